//! Error handling for guardian-daemon
//!
//! Each subsystem owns a narrow `thiserror` enum; `GuardianError` composes
//! them so the supervisor can decide fatal-vs-recovered handling from a
//! single `kind()` without matching on subsystem internals.

use thiserror::Error;

/// Policy/configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required key: {0}")]
    MissingRequired(String),

    #[error("wrong type for key {key}: expected {expected}")]
    BadType { key: String, expected: &'static str },

    #[error("invalid time format for {key}: {value:?} (expected HH:MM)")]
    BadTimeFormat { key: String, value: String },

    #[error("negative number not allowed for {key}: {value}")]
    NegativeNumber { key: String, value: i64 },

    #[error("unknown log level: {0:?}")]
    UnknownLogLevel(String),

    #[error("invalid username: {0:?}")]
    BadUsername(String),

    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path:?}: {source}")]
    Yaml {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Store (persistence layer) failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("conflicting row for {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store io error: {0}")]
    Io(#[from] sqlx::Error),

    #[error("store file is corrupt: {0}")]
    Corrupt(String),
}

/// D-Bus / login-manager interaction failures.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    NotAvailable(String),

    #[error("expected interface missing: {0}")]
    InterfaceMissing(String),

    #[error("bus call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("bus error: {0}")]
    Other(#[from] zbus::Error),
}

/// Enforcement-action failures (termination, account lock/unlock).
#[derive(Error, Debug)]
pub enum EnforceError {
    #[error("failed to terminate sessions for {user}: {reason}")]
    TerminateFailed { user: String, reason: String },

    #[error("failed to lock account {user}: {reason}")]
    LockFailed { user: String, reason: String },

    #[error("failed to unlock account {user}: {reason}")]
    UnlockFailed { user: String, reason: String },
}

/// Host-provisioning failures (group, D-Bus policy, PAM module presence).
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to create or populate group {group}: {reason}")]
    GroupCreateFailed { group: String, reason: String },

    #[error("pam_time module is not installed")]
    PamModuleMissing,

    #[error("no auth selector (pam-auth-update or equivalent) available")]
    AuthSelectMissing,

    #[error("permission denied writing {0}")]
    PermissionDenied(String),
}

/// Admin-surface protocol failures.
#[derive(Error, Debug)]
pub enum AdminError {
    #[error("unauthorized peer (uid {uid}, gid {gid})")]
    Unauthorized { uid: u32, gid: u32 },

    #[error("rate limited")]
    RateLimited,

    #[error("request exceeds {0} bytes")]
    MessageTooLarge(usize),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// Crate-wide error, composing every subsystem's error type.
///
/// `kind()` is what the supervisor inspects to decide whether to exit,
/// roll back a reload, or just log and continue.
#[derive(Error, Debug)]
pub enum GuardianError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("enforcement error: {0}")]
    Enforce(#[from] EnforceError),

    #[error("setup error: {0}")]
    Setup(#[from] SetupError),

    #[error("admin error: {0}")]
    Admin(#[from] AdminError),
}

/// Coarse classification used by the supervisor to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Process should exit with a non-zero status.
    Fatal,
    /// Caller should retain previous state and log; no process impact.
    Recoverable,
}

impl GuardianError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardianError::Config(_) => ErrorKind::Fatal,
            GuardianError::Store(StoreError::Io(_) | StoreError::Corrupt(_)) => ErrorKind::Fatal,
            GuardianError::Store(_) => ErrorKind::Recoverable,
            GuardianError::Bus(_) => ErrorKind::Recoverable,
            GuardianError::Enforce(_) => ErrorKind::Recoverable,
            GuardianError::Setup(_) => ErrorKind::Fatal,
            GuardianError::Admin(_) => ErrorKind::Recoverable,
        }
    }

    /// Config errors encountered during a *reload* (as opposed to startup)
    /// are never fatal: the caller keeps the previous snapshot.
    pub fn is_config(&self) -> bool {
        matches!(self, GuardianError::Config(_))
    }
}

pub type GuardianResult<T> = Result<T, GuardianError>;
