//! Policy loading for guardian-daemon.
//!
//! Two YAML layers (distribution default + optional site override) are
//! deep-merged into one [`serde_yaml::Value`], validated, then frozen into
//! an immutable [`PolicySnapshot`] that the rest of the daemon reads without
//! locking. Per-user effective policy is the same deep merge applied again,
//! `defaults` ⊕ the user's own override block.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

const TIME_RE: &str = r"^(?:[01]\d|2[0-3]):[0-5]\d$";
const USERNAME_RE: &str = r"^[A-Za-z_][A-Za-z0-9_-]*$";

/// Per-weekday curfew windows, e.g. `{"monday": "08:00-20:00"}`.
pub type CurfewMap = HashMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_target")]
    pub target: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "plain".to_string()
}
fn default_log_target() -> String {
    "stdout".to_string()
}

/// Effective (post-merge) policy for one managed user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedUser {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub daily_quota_minutes: u32,
    #[serde(default)]
    pub weekly_quota_minutes: Option<u32>,
    #[serde(default)]
    pub curfew: CurfewMap,
    #[serde(default = "default_grace")]
    pub grace_minutes: u32,
    #[serde(default)]
    pub bonus_pool_minutes: u32,
    #[serde(default = "default_true")]
    pub monitored: bool,
    #[serde(default)]
    pub quota_exempt: bool,
}

fn default_grace() -> u32 {
    5
}
fn default_true() -> bool {
    true
}

/// Raw shape of a merged config file, deserialized directly from YAML.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default = "default_db_path")]
    db_path: PathBuf,
    #[serde(default = "default_ipc_socket")]
    ipc_socket: PathBuf,
    #[serde(default = "default_reset_time")]
    reset_time: String,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default = "default_admin_group")]
    admin_group: String,
    #[serde(default)]
    defaults: serde_yaml::Value,
    #[serde(default)]
    users: HashMap<String, serde_yaml::Value>,
    #[serde(default)]
    logging: LogConfig,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/guardian-daemon/guardian.db")
}
fn default_ipc_socket() -> PathBuf {
    PathBuf::from("/run/guardian-daemon.sock")
}
fn default_reset_time() -> String {
    "03:00".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_admin_group() -> String {
    "kids".to_string()
}

/// Immutable, validated policy. Atomically swapped on reload; readers get
/// a clone of the `Arc` it's wrapped in by the caller (see `supervisor`).
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub db_path: PathBuf,
    pub ipc_socket: PathBuf,
    pub reset_time: String,
    pub timezone: String,
    pub admin_group: String,
    pub logging: LogConfig,
    pub users: HashMap<String, ManagedUser>,
    raw_hash: [u8; 32],
}

impl PolicySnapshot {
    /// Effective policy for `username`, or `None` if not a managed user.
    pub fn effective(&self, username: &str) -> Option<&ManagedUser> {
        self.users.get(username)
    }

    pub fn managed_usernames(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(String::as_str)
    }

    /// Content hash of the merged policy, used by the reload loop to skip
    /// re-validating a file that hasn't changed.
    pub fn content_hash(&self) -> [u8; 32] {
        self.raw_hash
    }
}

/// Deep-merges `overlay` onto `base`: mapping keys recurse into matching
/// mapping keys in `base`; anything else in `overlay` replaces the value at
/// that key (or is added if absent from `base`).
fn merge_yaml(base: &serde_yaml::Value, overlay: &serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                let next = match merged.get(k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => v.clone(),
                };
                merged.insert(k.clone(), next);
            }
            Value::Mapping(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the two-layer policy and validates it into a [`PolicySnapshot`].
///
/// `override_path` is optional: if the path doesn't exist, only the default
/// file is used (this is the common case for a fresh install).
pub fn load(default_path: &Path, override_path: Option<&Path>) -> Result<PolicySnapshot, ConfigError> {
    let default_value = read_yaml(default_path)?;

    let (merged, raw_for_hash) = match override_path {
        Some(p) if p.exists() => {
            let override_value = read_yaml(p)?;
            let merged = merge_yaml(&default_value, &override_value);
            let hash_input = format!("{default_value:?}{override_value:?}");
            (merged, hash_input)
        }
        _ => {
            let hash_input = format!("{default_value:?}");
            (default_value, hash_input)
        }
    };

    let raw: RawConfig = serde_yaml::from_value(merged).map_err(|source| ConfigError::Yaml {
        path: default_path.to_path_buf(),
        source,
    })?;

    let snapshot = build_snapshot(raw, &raw_for_hash)?;
    validate(&snapshot)?;
    Ok(snapshot)
}

/// Quota-ish keys that must be non-negative integers if present. Checked
/// against the weakly-typed merged YAML before the strongly-typed
/// `ManagedUser` deserialization, since `u32`/`Option<u32>` fields would
/// otherwise surface a negative or wrong-typed value as an opaque
/// `ConfigError::Yaml` instead of the distinct semantic error.
const QUOTA_KEYS: [&str; 4] = [
    "daily_quota_minutes",
    "weekly_quota_minutes",
    "grace_minutes",
    "bonus_pool_minutes",
];

fn validate_quota_fields(username: &str, merged: &serde_yaml::Value) -> Result<(), ConfigError> {
    let serde_yaml::Value::Mapping(map) = merged else {
        return Err(ConfigError::MissingRequired(format!(
            "users.{username}.daily_quota_minutes"
        )));
    };
    if map
        .get(serde_yaml::Value::String("daily_quota_minutes".to_string()))
        .is_none_or(serde_yaml::Value::is_null)
    {
        return Err(ConfigError::MissingRequired(format!(
            "users.{username}.daily_quota_minutes"
        )));
    }
    for key in QUOTA_KEYS {
        let Some(value) = map.get(serde_yaml::Value::String(key.to_string())) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        match value.as_i64() {
            Some(n) if n < 0 => {
                return Err(ConfigError::NegativeNumber {
                    key: format!("users.{username}.{key}"),
                    value: n,
                });
            }
            Some(_) => {}
            None => {
                return Err(ConfigError::BadType {
                    key: format!("users.{username}.{key}"),
                    expected: "non-negative integer",
                });
            }
        }
    }
    Ok(())
}

fn build_snapshot(raw: RawConfig, hash_input: &str) -> Result<PolicySnapshot, ConfigError> {
    let mut users = HashMap::with_capacity(raw.users.len());
    for (username, override_value) in &raw.users {
        let merged_value = merge_yaml(&raw.defaults, override_value);
        validate_quota_fields(username, &merged_value)?;
        let mut user: ManagedUser =
            serde_yaml::from_value(merged_value).map_err(|source| ConfigError::Yaml {
                path: PathBuf::from(format!("users.{username}")),
                source,
            })?;
        user.username = username.clone();
        users.insert(username.clone(), user);
    }

    let mut hasher = Sha256::new();
    hasher.update(hash_input.as_bytes());
    let raw_hash: [u8; 32] = hasher.finalize().into();

    Ok(PolicySnapshot {
        db_path: raw.db_path,
        ipc_socket: raw.ipc_socket,
        reset_time: raw.reset_time,
        timezone: raw.timezone,
        admin_group: raw.admin_group,
        logging: raw.logging,
        users,
        raw_hash,
    })
}

fn validate(snapshot: &PolicySnapshot) -> Result<(), ConfigError> {
    let time_re = regex::Regex::new(TIME_RE).expect("static regex is valid");
    let username_re = regex::Regex::new(USERNAME_RE).expect("static regex is valid");

    if !time_re.is_match(&snapshot.reset_time) {
        return Err(ConfigError::BadTimeFormat {
            key: "reset_time".to_string(),
            value: snapshot.reset_time.clone(),
        });
    }

    if !matches!(
        snapshot.logging.level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(ConfigError::UnknownLogLevel(snapshot.logging.level.clone()));
    }

    for (username, user) in &snapshot.users {
        if !username_re.is_match(username) {
            return Err(ConfigError::BadUsername(username.clone()));
        }
        for (day, window) in &user.curfew {
            let parts: Vec<&str> = window.splitn(2, '-').collect();
            if parts.len() != 2 || !time_re.is_match(parts[0]) || !time_re.is_match(parts[1]) {
                return Err(ConfigError::BadTimeFormat {
                    key: format!("users.{username}.curfew.{day}"),
                    value: window.clone(),
                });
            }
        }
    }

    Ok(())
}
