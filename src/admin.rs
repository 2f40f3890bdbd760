//! Local admin surface (C7/C9): a Unix domain socket with peer-credential
//! authentication, length-prefixed JSON framing, and a small command
//! dispatch table.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::AdminError;

const MAX_REQUEST_BYTES: usize = 1024 * 1024;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const RATE_LIMIT: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct AdminRequest {
    pub command: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub force: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaInfo {
    pub kid: String,
    pub used: f64,
    pub limit: u32,
    pub remaining: f64,
}

/// Everything the admin surface needs from the rest of the daemon,
/// abstracted so the dispatch table is testable without a live supervisor.
#[async_trait]
pub trait AdminContext: Send + Sync {
    async fn list_kids(&self) -> Vec<String>;
    async fn get_quota(&self, kid: &str) -> Result<QuotaInfo, AdminError>;
    async fn get_curfew(&self, kid: &str) -> Result<serde_json::Value, AdminError>;
    async fn list_timers(&self) -> Result<Vec<String>, AdminError>;
    async fn reload_policy(&self) -> Result<String, AdminError>;
    async fn reset_quota(&self, force: bool) -> Result<(), AdminError>;
    async fn setup_user(&self, kid: &str) -> Result<(), AdminError>;
    async fn add_user(&self, kid: &str) -> Result<(), AdminError>;
    async fn sync_users_from_config(&self) -> Result<(usize, usize), AdminError>;
}

/// Command names reflected back by `describe_commands`, in table order.
pub const COMMANDS: &[&str] = &[
    "list_kids",
    "get_quota",
    "get_curfew",
    "list_timers",
    "reload_timers",
    "reset_quota",
    "setup_user",
    "add_user",
    "sync_users_from_config",
    "describe_commands",
];

fn require_kid(request: &AdminRequest) -> Result<&str, AdminError> {
    request
        .kid
        .as_deref()
        .ok_or_else(|| AdminError::BadRequest("missing required field 'kid'".to_string()))
}

/// Dispatches one already-authenticated, already-rate-limited request.
pub async fn dispatch(ctx: &dyn AdminContext, request: AdminRequest) -> serde_json::Value {
    let result = handle(ctx, &request).await;
    match result {
        Ok(value) => value,
        Err(err) => json!({ "error": err.to_string() }),
    }
}

async fn handle(ctx: &dyn AdminContext, request: &AdminRequest) -> Result<serde_json::Value, AdminError> {
    match request.command.as_str() {
        "list_kids" => Ok(json!({ "kids": ctx.list_kids().await })),
        "get_quota" => {
            let kid = require_kid(request)?;
            let quota = ctx.get_quota(kid).await?;
            Ok(serde_json::to_value(quota).expect("QuotaInfo always serializes"))
        }
        "get_curfew" => {
            let kid = require_kid(request)?;
            let curfew = ctx.get_curfew(kid).await?;
            Ok(json!({ "kid": kid, "curfew": curfew }))
        }
        "list_timers" => Ok(json!({ "timers": ctx.list_timers().await? })),
        "reload_timers" => {
            let status = ctx.reload_policy().await?;
            Ok(json!({ "status": status }))
        }
        "reset_quota" => {
            ctx.reset_quota(request.force.unwrap_or(false)).await?;
            Ok(json!({ "status": "ok" }))
        }
        "setup_user" => {
            let kid = require_kid(request)?;
            ctx.setup_user(kid).await?;
            Ok(json!({ "status": "ok", "kid": kid }))
        }
        "add_user" => {
            let kid = require_kid(request)?;
            ctx.add_user(kid).await?;
            Ok(json!({ "status": "ok", "kid": kid }))
        }
        "sync_users_from_config" => {
            let (added, updated) = ctx.sync_users_from_config().await?;
            Ok(json!({ "added": added, "updated": updated }))
        }
        "describe_commands" => Ok(json!({ "commands": COMMANDS })),
        other => Err(AdminError::UnknownCommand(other.to_string())),
    }
}

/// Per-uid rolling-window rate limiter; uid 0 is always exempt.
pub struct RateLimiter {
    windows: Mutex<HashMap<u32, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, uid: u32) -> bool {
        if uid == 0 {
            return true;
        }
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let entries = windows.entry(uid).or_default();
        while let Some(front) = entries.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                entries.pop_front();
            } else {
                break;
            }
        }
        if entries.len() >= RATE_LIMIT {
            return false;
        }
        entries.push_back(now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a connecting peer with `uid`/`gid` may use the admin surface:
/// root, or a member of the configured admin group (by primary gid).
pub fn is_authorized(uid: u32, gid: u32, admin_gid: u32) -> bool {
    uid == 0 || gid == admin_gid
}

/// Validates a frame length header; non-positive or oversized lengths are
/// protocol violations that close the connection without reading further.
pub fn validate_frame_length(len: i32) -> Result<usize, AdminError> {
    if len <= 0 {
        return Err(AdminError::BadRequest("zero-or-negative frame length".to_string()));
    }
    let len = len as usize;
    if len > MAX_REQUEST_BYTES {
        return Err(AdminError::MessageTooLarge(len));
    }
    Ok(len)
}

pub struct AdminServer {
    socket_path: std::path::PathBuf,
    admin_gid: u32,
    rate_limiter: Arc<RateLimiter>,
    context: Arc<dyn AdminContext>,
}

impl AdminServer {
    pub fn new(socket_path: std::path::PathBuf, admin_gid: u32, context: Arc<dyn AdminContext>) -> Self {
        Self {
            socket_path,
            admin_gid,
            rate_limiter: Arc::new(RateLimiter::new()),
            context,
        }
    }

    /// Binds the socket (removing a stale one from a prior run) and serves
    /// connections until the process exits or the listener errors.
    pub async fn serve(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::os::unix::fs::PermissionsExt::from_mode(0o660))?;
        info!(path = %self.socket_path.display(), "admin surface listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let context = self.context.clone();
            let rate_limiter = self.rate_limiter.clone();
            let admin_gid = self.admin_gid;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, admin_gid, &rate_limiter, context.as_ref()).await {
                    warn!(error = %e, "admin connection closed with error");
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    admin_gid: u32,
    rate_limiter: &RateLimiter,
    context: &dyn AdminContext,
) -> std::io::Result<()> {
    let cred = stream.peer_cred()?;
    if !is_authorized(cred.uid(), cred.gid(), admin_gid) {
        return Ok(()); // close without reading any payload
    }

    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = i32::from_be_bytes(len_buf);

        let frame_len = match validate_frame_length(len) {
            Ok(n) => n,
            Err(e) => {
                let body = json!({ "error": e.to_string() });
                let _ = write_response(&mut stream, &body).await;
                return Ok(());
            }
        };

        if !rate_limiter.check(cred.uid()).await {
            let body = json!({ "error": AdminError::RateLimited.to_string() });
            let _ = write_response(&mut stream, &body).await;
            return Ok(());
        }

        let mut payload = vec![0u8; frame_len];
        if stream.read_exact(&mut payload).await.is_err() {
            return Ok(());
        }

        let response = match serde_json::from_slice::<AdminRequest>(&payload) {
            Ok(request) => dispatch(context, request).await,
            Err(e) => json!({ "error": AdminError::BadRequest(e.to_string()).to_string() }),
        };
        write_response(&mut stream, &response).await?;
    }
}

async fn write_response(stream: &mut UnixStream, value: &serde_json::Value) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let len = (bytes.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(&bytes).await
}

#[cfg(test)]
pub mod fake {
    use super::*;

    pub struct FakeAdminContext {
        pub kids: Vec<String>,
        pub quotas: HashMap<String, QuotaInfo>,
        pub reload_ok: bool,
    }

    impl FakeAdminContext {
        pub fn new(kids: Vec<String>) -> Self {
            Self {
                kids,
                quotas: HashMap::new(),
                reload_ok: true,
            }
        }
    }

    #[async_trait]
    impl AdminContext for FakeAdminContext {
        async fn list_kids(&self) -> Vec<String> {
            self.kids.clone()
        }

        async fn get_quota(&self, kid: &str) -> Result<QuotaInfo, AdminError> {
            self.quotas
                .get(kid)
                .cloned()
                .ok_or_else(|| AdminError::BadRequest(format!("unknown kid {kid}")))
        }

        async fn get_curfew(&self, kid: &str) -> Result<serde_json::Value, AdminError> {
            Ok(json!({ "kid": kid, "windows": {} }))
        }

        async fn list_timers(&self) -> Result<Vec<String>, AdminError> {
            Ok(vec!["guardian-daily-reset.timer".to_string()])
        }

        async fn reload_policy(&self) -> Result<String, AdminError> {
            if self.reload_ok {
                Ok("reloaded".to_string())
            } else {
                Err(AdminError::BadRequest("reload failed".to_string()))
            }
        }

        async fn reset_quota(&self, _force: bool) -> Result<(), AdminError> {
            Ok(())
        }

        async fn setup_user(&self, _kid: &str) -> Result<(), AdminError> {
            Ok(())
        }

        async fn add_user(&self, _kid: &str) -> Result<(), AdminError> {
            Ok(())
        }

        async fn sync_users_from_config(&self) -> Result<(usize, usize), AdminError> {
            Ok((1, 2))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeAdminContext;
    use super::*;

    #[tokio::test]
    async fn list_kids_returns_configured_usernames() {
        let ctx = FakeAdminContext::new(vec!["alice".to_string(), "bob".to_string()]);
        let response = dispatch(&ctx, AdminRequest { command: "list_kids".to_string(), kid: None, force: None }).await;
        assert_eq!(response["kids"], json!(["alice", "bob"]));
    }

    #[tokio::test]
    async fn get_quota_without_kid_is_bad_request() {
        let ctx = FakeAdminContext::new(vec![]);
        let response = dispatch(&ctx, AdminRequest { command: "get_quota".to_string(), kid: None, force: None }).await;
        assert!(response["error"].as_str().unwrap().contains("kid"));
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let ctx = FakeAdminContext::new(vec![]);
        let response = dispatch(&ctx, AdminRequest { command: "delete_everything".to_string(), kid: None, force: None }).await;
        assert!(response["error"].as_str().unwrap().contains("delete_everything"));
    }

    #[tokio::test]
    async fn describe_commands_lists_the_full_table() {
        let ctx = FakeAdminContext::new(vec![]);
        let response = dispatch(&ctx, AdminRequest { command: "describe_commands".to_string(), kid: None, force: None }).await;
        let commands = response["commands"].as_array().unwrap();
        assert_eq!(commands.len(), COMMANDS.len());
    }

    #[test]
    fn frame_length_rejects_non_positive() {
        assert!(validate_frame_length(0).is_err());
        assert!(validate_frame_length(-1).is_err());
    }

    #[test]
    fn frame_length_rejects_oversized() {
        assert!(validate_frame_length((MAX_REQUEST_BYTES as i32) + 1).is_err());
    }

    #[test]
    fn frame_length_accepts_small_request() {
        assert_eq!(validate_frame_length(128).unwrap(), 128);
    }

    #[test]
    fn root_is_always_authorized() {
        assert!(is_authorized(0, 9999, 50));
    }

    #[test]
    fn admin_group_member_is_authorized() {
        assert!(is_authorized(1000, 50, 50));
        assert!(!is_authorized(1000, 51, 50));
    }

    #[tokio::test]
    async fn rate_limiter_exempts_root() {
        let limiter = RateLimiter::new();
        for _ in 0..200 {
            assert!(limiter.check(0).await);
        }
    }

    #[tokio::test]
    async fn rate_limiter_blocks_after_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT {
            assert!(limiter.check(1000).await);
        }
        assert!(!limiter.check(1000).await);
    }
}
