//! Orchestration (C8): wires every component together, runs the reload
//! loop, the daily rollover, and the login-manager/agent D-Bus plumbing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use zbus::Connection;

use crate::admin::{AdminContext, AdminServer, QuotaInfo};
use crate::agent_registry::{AgentEndpoint, AgentRegistry};
use crate::clock::TimeProvider;
use crate::command_runner::CommandRunner;
use crate::config::{self, PolicySnapshot};
use crate::enforcer::Enforcer;
use crate::error::{AdminError, GuardianError, SetupError};
use crate::pam_writer::PamWriter;
use crate::session_tracker::{SessionProps, SessionTracker};
use crate::store::Store;
use crate::systemd_units::SystemdUnits;
use crate::user_manager::UserManager;

const RELOAD_INTERVAL: StdDuration = StdDuration::from_secs(5 * 60);
const TICK_INTERVAL: StdDuration = StdDuration::from_secs(10);

/// Atomically-swappable policy handle: readers clone the `Arc`, never
/// observing a partially-applied reload.
#[derive(Clone)]
struct PolicyHandle(Arc<RwLock<Arc<PolicySnapshot>>>);

impl PolicyHandle {
    fn new(initial: PolicySnapshot) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(initial))))
    }

    async fn current(&self) -> Arc<PolicySnapshot> {
        self.0.read().await.clone()
    }

    async fn swap(&self, next: PolicySnapshot) {
        *self.0.write().await = Arc::new(next);
    }
}

pub struct SupervisorPaths {
    pub default_config: PathBuf,
    pub override_config: Option<PathBuf>,
    pub unit_dir: PathBuf,
    pub rules_path: PathBuf,
    pub dbus_policy_path: PathBuf,
    pub exec_path: PathBuf,
}

pub struct Supervisor {
    store: Store,
    policy: PolicyHandle,
    paths: SupervisorPaths,
    clock: Arc<dyn TimeProvider>,
    runner: Arc<dyn CommandRunner>,
    pam_writer: PamWriter,
    systemd_units: SystemdUnits,
    user_manager: UserManager,
    agents: Arc<AgentRegistry>,
    tracker: Arc<SessionTracker>,
    enforcer: Arc<Enforcer>,
}

impl Supervisor {
    /// Assembles every component from an already-opened store and an
    /// already-validated initial snapshot. Building the D-Bus connection is
    /// deferred to [`Supervisor::start`] so construction stays infallible
    /// and unit-testable.
    pub fn new(
        store: Store,
        initial_policy: PolicySnapshot,
        paths: SupervisorPaths,
        clock: Arc<dyn TimeProvider>,
        runner: Arc<dyn CommandRunner>,
        agents: Arc<AgentRegistry>,
        boot_id: String,
    ) -> Self {
        let tracker = Arc::new(SessionTracker::new(store.clone(), clock.clone(), boot_id));
        let enforcer = Arc::new(Enforcer::new(clock.clone(), tracker.clone(), agents.clone(), runner.clone()));
        let pam_writer = PamWriter::new(paths.rules_path.clone());
        let systemd_units = SystemdUnits::new(paths.unit_dir.clone());
        let user_manager = UserManager::new(runner.clone(), paths.dbus_policy_path.clone());

        Self {
            store,
            policy: PolicyHandle::new(initial_policy),
            paths,
            clock,
            runner,
            pam_writer,
            systemd_units,
            user_manager,
            agents,
            tracker,
            enforcer,
        }
    }

    /// Builds the D-Bus interface object agents call into; `main` registers
    /// it on the system bus connection it owns.
    pub fn daemon_interface(&self) -> DaemonInterface {
        DaemonInterface::new(self.tracker.clone(), self.agents.clone())
    }

    pub async fn timezone(&self) -> Tz {
        let policy = self.policy.current().await;
        policy.timezone.parse().unwrap_or_else(|_| {
            warn!(timezone = %policy.timezone, "unparseable timezone, defaulting to UTC");
            chrono_tz::UTC
        })
    }

    /// Full startup sequence per the design notes: sync config to the
    /// store, install PAM rules and the OS-level reset timer, provision the
    /// managed group and D-Bus policy, then hand off to the three
    /// concurrent loops.
    pub async fn start(self: Arc<Self>) -> Result<(), GuardianError> {
        let policy = self.policy.current().await;

        self.store.sync_config_to_db(&policy).await?;
        self.pam_writer.write_rules(&policy)?;
        self.systemd_units.install(&policy.reset_time, &self.paths.exec_path)?;

        let usernames: Vec<String> = policy.managed_usernames().map(str::to_string).collect();
        self.user_manager.ensure_group(&policy.admin_group, &usernames).await?;
        self.user_manager.install_dbus_policy(&policy.admin_group)?;

        self.recover_if_needed().await?;

        let reload_task = self.clone().spawn_reload_loop();
        let tick_task = self.clone().spawn_tick_loop();
        let _rollover_scheduler = self.clone().schedule_rollover().await?;

        info!("supervisor started");
        // The scheduler above owns its own background task; keeping it
        // alive for the process lifetime just means not dropping it here.
        let _ = tokio::join!(reload_task, tick_task);
        Ok(())
    }

    async fn recover_if_needed(&self) -> Result<(), GuardianError> {
        let timezone = self.timezone().await;
        let today = self.clock.today_in(timezone);
        let last = self.store.last_reset_date().await?;
        if last.map(|d| d < today).unwrap_or(true) {
            info!(?last, %today, "running catch-up rollover");
            self.rollover(true).await?;
        }
        Ok(())
    }

    fn spawn_reload_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RELOAD_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = self.reload_once().await {
                    warn!(error = %e, "policy reload failed, keeping previous snapshot");
                }
            }
        })
    }

    fn spawn_tick_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                self.tick_all().await;
            }
        })
    }

    async fn schedule_rollover(self: Arc<Self>) -> Result<JobScheduler, GuardianError> {
        let scheduler = JobScheduler::new().await.map_err(|e| {
            GuardianError::Setup(SetupError::PermissionDenied(format!("cron scheduler init failed: {e}")))
        })?;

        let policy = self.policy.current().await;
        let cron = reset_time_to_cron(&policy.reset_time);
        let supervisor = self.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let supervisor = supervisor.clone();
            Box::pin(async move {
                if let Err(e) = supervisor.rollover(false).await {
                    error!(error = %e, "scheduled rollover failed");
                }
            })
        })
        .map_err(|e| GuardianError::Setup(SetupError::PermissionDenied(e.to_string())))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| GuardianError::Setup(SetupError::PermissionDenied(e.to_string())))?;
        scheduler
            .start()
            .await
            .map_err(|e| GuardianError::Setup(SetupError::PermissionDenied(e.to_string())))?;
        Ok(scheduler)
    }

    /// Re-reads the config files; a no-op if the content hash is unchanged.
    /// On any validation failure the previous snapshot is kept untouched.
    pub async fn reload_once(&self) -> Result<bool, GuardianError> {
        let current = self.policy.current().await;
        let candidate = match config::load(&self.paths.default_config, self.paths.override_config.as_deref()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "policy file invalid, rolling back to previous snapshot");
                return Err(GuardianError::Config(e));
            }
        };

        if candidate.content_hash() == current.content_hash() {
            return Ok(false);
        }

        self.store.sync_config_to_db(&candidate).await?;
        self.pam_writer.write_rules(&candidate)?;
        self.systemd_units.install(&candidate.reset_time, &self.paths.exec_path)?;
        self.policy.swap(candidate).await;
        info!("policy reloaded");
        Ok(true)
    }

    async fn tick_all(&self) {
        let policy = self.policy.current().await;
        let timezone = self.timezone().await;
        for (username, user) in &policy.users {
            if let Err(e) = self.enforcer.tick(username, user, timezone).await {
                warn!(username, error = %e, "enforcer tick failed");
            }
        }
    }

    /// Daily rollover: archives each monitored user's usage, resets
    /// in-progress session baselines, clears enforcer state, and triggers
    /// an immediate reconciliation tick.
    pub async fn rollover(&self, force: bool) -> Result<(), GuardianError> {
        let policy = self.policy.current().await;
        let timezone = self.timezone().await;
        let today = self.clock.today_in(timezone);

        if !force {
            if let Some(last) = self.store.last_reset_date().await? {
                if last >= today {
                    return Ok(());
                }
            }
        }

        for (username, user) in &policy.users {
            let bonus_consumed = self.enforcer.bonus_consumed_minutes(username).await;
            if let Err(e) = self
                .store
                .archive_and_clear(username, today, user.daily_quota_minutes, bonus_consumed)
                .await
            {
                warn!(username, error = %e, "archive_and_clear failed during rollover");
            }
        }
        self.tracker.reset_active_baselines().await;
        self.enforcer.reset_all().await;
        self.store.set_last_reset_date(today).await?;
        self.tick_all().await;
        info!(%today, "daily rollover complete");
        Ok(())
    }
}

#[zbus::proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait LoginManager {
    #[zbus(signal)]
    fn session_new(&self, session_id: String, object_path: zbus::zvariant::OwnedObjectPath) -> zbus::Result<()>;
    #[zbus(signal)]
    fn session_removed(&self, session_id: String, object_path: zbus::zvariant::OwnedObjectPath) -> zbus::Result<()>;
}

#[zbus::proxy(interface = "org.freedesktop.login1.Session", default_service = "org.freedesktop.login1")]
trait Session {
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;
    #[zbus(property, name = "User")]
    fn user(&self) -> zbus::Result<zbus::zvariant::OwnedValue>;
    #[zbus(property)]
    fn desktop(&self) -> zbus::Result<String>;
    #[zbus(property)]
    fn service(&self) -> zbus::Result<String>;
    #[zbus(property)]
    fn class(&self) -> zbus::Result<String>;
}

/// `User` arrives as either `(uid, object_path)` or a bare integer,
/// depending on the login manager. Accept both (§6, §8).
fn parse_session_uid(value: &zbus::zvariant::OwnedValue) -> Result<u32, crate::error::BusError> {
    use zbus::zvariant::Value;

    let bad = || crate::error::BusError::InterfaceMissing("Session.User has unexpected shape".to_string());

    match &**value {
        Value::Structure(s) => match s.fields().first() {
            Some(Value::U32(uid)) => Ok(*uid),
            Some(Value::I64(uid)) => Ok(*uid as u32),
            Some(Value::U64(uid)) => Ok(*uid as u32),
            Some(Value::I32(uid)) => Ok(*uid as u32),
            _ => Err(bad()),
        },
        Value::U32(uid) => Ok(*uid),
        Value::I64(uid) => Ok(*uid as u32),
        Value::U64(uid) => Ok(*uid as u32),
        Value::I32(uid) => Ok(*uid as u32),
        _ => Err(bad()),
    }
}

impl Supervisor {
    /// Subscribes to the login manager's session lifecycle signals and
    /// feeds them to the session tracker. Runs until the bus connection
    /// drops; the caller is expected to run it as a background task.
    pub async fn run_login_manager_loop(self: Arc<Self>, connection: Connection) -> Result<(), GuardianError> {
        use futures_util::StreamExt;

        let manager = LoginManagerProxy::new(&connection)
            .await
            .map_err(crate::error::BusError::from)?;
        let mut new_sessions = manager.receive_session_new().await.map_err(crate::error::BusError::from)?;
        let mut removed_sessions = manager.receive_session_removed().await.map_err(crate::error::BusError::from)?;

        loop {
            tokio::select! {
                Some(signal) = new_sessions.next() => {
                    if let Ok(args) = signal.args() {
                        let connection = connection.clone();
                        let supervisor = self.clone();
                        let object_path = args.object_path.clone();
                        tokio::spawn(async move {
                            if let Err(e) = supervisor.on_session_new(&connection, object_path).await {
                                warn!(error = %e, "failed to process new session");
                            }
                        });
                    }
                }
                Some(signal) = removed_sessions.next() => {
                    if let Ok(args) = signal.args() {
                        if let Err(e) = self.tracker.handle_session_removed(&args.session_id).await {
                            warn!(error = %e, "failed to process removed session");
                        }
                    }
                }
                else => break,
            }
        }
        Ok(())
    }

    async fn on_session_new(
        &self,
        connection: &Connection,
        object_path: zbus::zvariant::OwnedObjectPath,
    ) -> Result<(), GuardianError> {
        let session = SessionProxy::builder(connection)
            .path(object_path.clone())
            .map_err(crate::error::BusError::from)?
            .build()
            .await
            .map_err(crate::error::BusError::from)?;

        let platform_session_id = session.name().await.map_err(crate::error::BusError::from)?;
        let user_value = session.user().await.map_err(crate::error::BusError::from)?;
        let uid = parse_session_uid(&user_value)?;
        let desktop = session.desktop().await.unwrap_or_default();
        let service = session.service().await.unwrap_or_default();
        let class = session.class().await.unwrap_or_default();
        let username = self.resolve_username(uid as i64).await?;

        let policy = self.policy.current().await;
        self.tracker
            .handle_session_new(
                SessionProps {
                    platform_session_id,
                    username,
                    uid: uid as i64,
                    desktop,
                    service,
                    class,
                },
                &policy,
            )
            .await?;
        Ok(())
    }

    async fn resolve_username(&self, uid: i64) -> Result<String, GuardianError> {
        let out = self
            .runner
            .run("id", &["-nu", &uid.to_string()], StdDuration::from_secs(5))
            .await
            .map_err(|e| GuardianError::Setup(SetupError::PermissionDenied(e.to_string())))?;
        Ok(out.stdout.trim().to_string())
    }
}

fn reset_time_to_cron(reset_time: &str) -> String {
    let (hour, minute) = reset_time.split_once(':').unwrap_or(("3", "0"));
    format!("0 {minute} {hour} * * *")
}

#[async_trait]
impl AdminContext for Supervisor {
    async fn list_kids(&self) -> Vec<String> {
        self.policy.current().await.managed_usernames().map(str::to_string).collect()
    }

    async fn get_quota(&self, kid: &str) -> Result<QuotaInfo, AdminError> {
        let policy = self.policy.current().await;
        let user = policy
            .effective(kid)
            .ok_or_else(|| AdminError::BadRequest(format!("unknown kid {kid}")))?;
        let timezone = self.timezone().await;
        let remaining = self
            .tracker
            .remaining_minutes(kid, user, timezone, &policy.reset_time)
            .await
            .map_err(|e| AdminError::BadRequest(e.to_string()))?;
        let boundary = crate::session_tracker::last_reset_boundary(self.clock.now_utc(), timezone, &policy.reset_time);
        let used = self
            .tracker
            .used_minutes(kid, boundary)
            .await
            .map_err(|e| AdminError::BadRequest(e.to_string()))?;
        Ok(QuotaInfo {
            kid: kid.to_string(),
            used,
            limit: user.daily_quota_minutes,
            remaining,
        })
    }

    async fn get_curfew(&self, kid: &str) -> Result<serde_json::Value, AdminError> {
        let policy = self.policy.current().await;
        let user = policy
            .effective(kid)
            .ok_or_else(|| AdminError::BadRequest(format!("unknown kid {kid}")))?;
        Ok(json!(user.curfew))
    }

    async fn list_timers(&self) -> Result<Vec<String>, AdminError> {
        self.systemd_units.list_timers().map_err(|e| AdminError::BadRequest(e.to_string()))
    }

    async fn reload_policy(&self) -> Result<String, AdminError> {
        match self.reload_once().await {
            Ok(true) => Ok("reloaded".to_string()),
            Ok(false) => Ok("unchanged".to_string()),
            Err(e) => Err(AdminError::BadRequest(e.to_string())),
        }
    }

    async fn reset_quota(&self, force: bool) -> Result<(), AdminError> {
        self.rollover(force).await.map_err(|e| AdminError::BadRequest(e.to_string()))
    }

    async fn setup_user(&self, kid: &str) -> Result<(), AdminError> {
        let policy = self.policy.current().await;
        self.user_manager
            .ensure_group(&policy.admin_group, &[kid.to_string()])
            .await
            .map_err(|e| AdminError::BadRequest(e.to_string()))?;
        if self.store.get_user_settings(kid).await.map_err(|e| AdminError::BadRequest(e.to_string()))?.is_none() {
            self.store
                .set_user_settings(kid, "{}")
                .await
                .map_err(|e| AdminError::BadRequest(e.to_string()))?;
        }
        Ok(())
    }

    async fn add_user(&self, kid: &str) -> Result<(), AdminError> {
        self.setup_user(kid).await
    }

    async fn sync_users_from_config(&self) -> Result<(usize, usize), AdminError> {
        let policy = self.policy.current().await;
        let mut added = 0;
        let mut updated = 0;
        for username in policy.managed_usernames() {
            let existing = self
                .store
                .get_user_settings(username)
                .await
                .map_err(|e| AdminError::BadRequest(e.to_string()))?;
            if existing.is_none() {
                added += 1;
            } else {
                updated += 1;
            }
        }
        self.store
            .sync_config_to_db(&policy)
            .await
            .map_err(|e| AdminError::BadRequest(e.to_string()))?;
        Ok((added, updated))
    }
}

/// Exposed to session agents over D-Bus: `LockEvent` reports lock/unlock
/// transitions, and `RegisterAgent` lets a freshly-started agent announce
/// its own bus name so the Enforcer can reach it. `NotifyUser` is
/// implemented by the agent, not here.
pub struct DaemonInterface {
    tracker: Arc<SessionTracker>,
    agents: Arc<AgentRegistry>,
}

impl DaemonInterface {
    pub fn new(tracker: Arc<SessionTracker>, agents: Arc<AgentRegistry>) -> Self {
        Self { tracker, agents }
    }
}

#[zbus::interface(name = "org.guardian.Daemon1")]
impl DaemonInterface {
    async fn lock_event(&self, session_id: String, _username: String, locked: bool, timestamp: f64) {
        let ts = Utc
            .timestamp_opt(timestamp as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);
        if let Err(e) = self.tracker.handle_lock_event(&session_id, locked, ts).await {
            warn!(session_id, error = %e, "failed to record lock event");
        }
    }

    async fn register_agent(&self, username: String, bus_name: String, object_path: String) -> bool {
        let endpoint = AgentEndpoint { bus_name, object_path };
        match self.agents.verify_and_register(&username, endpoint).await {
            Ok(()) => true,
            Err(e) => {
                warn!(username, error = %e, "agent registration rejected");
                false
            }
        }
    }
}

/// Starts the admin surface bound to the current policy's socket path.
pub async fn spawn_admin_surface(supervisor: Arc<Supervisor>) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let policy = supervisor.policy.current().await;
    let admin_gid = supervisor
        .user_manager
        .resolve_group_id(&policy.admin_group)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, group = %policy.admin_group, "could not resolve admin group gid, defaulting to 0");
            None
        })
        .unwrap_or(0);
    let socket_path = policy.ipc_socket.clone();
    let server = AdminServer::new(socket_path, admin_gid, supervisor);
    Ok(tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            error!(error = %e, "admin surface exited");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockTimeProvider;
    use crate::command_runner::fake::FakeCommandRunner;
    use crate::agent_registry::fake::FakeAgentTransport;

    fn write_policy(dir: &tempfile::TempDir, daily_quota: u32) -> PathBuf {
        let path = dir.path().join("default.yaml");
        std::fs::write(
            &path,
            format!(
                "db_path: {:?}\nusers:\n  alice:\n    daily_quota_minutes: {daily_quota}\n",
                dir.path().join("guardian.db")
            ),
        )
        .unwrap();
        path
    }

    async fn build_supervisor(dir: &tempfile::TempDir) -> Arc<Supervisor> {
        let config_path = write_policy(dir, 60);
        let policy = config::load(&config_path, None).unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let clock = Arc::new(MockTimeProvider::new_from_now());
        let runner: Arc<dyn CommandRunner> = Arc::new(FakeCommandRunner::new());
        let transport = Arc::new(FakeAgentTransport::new());
        let agents = Arc::new(AgentRegistry::new(transport));

        let paths = SupervisorPaths {
            default_config: config_path,
            override_config: None,
            unit_dir: dir.path().join("units"),
            rules_path: dir.path().join("time.conf"),
            dbus_policy_path: dir.path().join("guardian.conf"),
            exec_path: PathBuf::from("/usr/bin/guardian-daemon"),
        };

        Arc::new(Supervisor::new(store, policy, paths, clock, runner, agents, "boot-1".to_string()))
    }

    #[tokio::test]
    async fn reload_once_is_noop_when_content_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = build_supervisor(&dir).await;
        let changed = supervisor.reload_once().await.unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn reload_once_picks_up_changed_quota() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = build_supervisor(&dir).await;

        write_policy(&dir, 90);
        let changed = supervisor.reload_once().await.unwrap();
        assert!(changed);

        let quota = supervisor.get_quota("alice").await.unwrap();
        assert_eq!(quota.limit, 90);
    }

    #[tokio::test]
    async fn reload_once_rolls_back_on_invalid_policy() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = build_supervisor(&dir).await;

        std::fs::write(dir.path().join("default.yaml"), "reset_time: \"not-a-time\"\n").unwrap();
        let result = supervisor.reload_once().await;
        assert!(result.is_err());

        let quota = supervisor.get_quota("alice").await.unwrap();
        assert_eq!(quota.limit, 60);
    }

    #[tokio::test]
    async fn rollover_clears_usage_and_records_last_reset_date() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = build_supervisor(&dir).await;

        supervisor.store.sync_config_to_db(supervisor.policy.current().await.as_ref()).await.unwrap();
        supervisor.rollover(true).await.unwrap();

        let last = supervisor.store.last_reset_date().await.unwrap();
        assert!(last.is_some());
    }

    #[test]
    fn reset_time_to_cron_places_minute_then_hour() {
        assert_eq!(reset_time_to_cron("03:30"), "0 30 3 * * *");
    }

    #[test]
    fn parse_session_uid_accepts_tuple_shape() {
        use zbus::zvariant::{ObjectPath, OwnedValue, Structure, Value};

        let path = ObjectPath::try_from("/org/freedesktop/login1/user/_1000").unwrap();
        let structure: Structure = (1000u32, path).into();
        let value: OwnedValue = Value::Structure(structure).try_into().unwrap();
        assert_eq!(parse_session_uid(&value).unwrap(), 1000);
    }

    #[test]
    fn parse_session_uid_accepts_plain_integer_shape() {
        use zbus::zvariant::{OwnedValue, Value};

        let value: OwnedValue = Value::U32(1000).try_into().unwrap();
        assert_eq!(parse_session_uid(&value).unwrap(), 1000);
    }

    #[test]
    fn parse_session_uid_rejects_unrelated_shape() {
        use zbus::zvariant::{OwnedValue, Value};

        let value: OwnedValue = Value::from("not a uid").try_into().unwrap();
        assert!(parse_session_uid(&value).is_err());
    }
}
