//! Logging setup for guardian-daemon.
//!
//! Structured logging driven by the `logging.level/format/target` policy
//! keys (§6), rather than environment variables alone — the daemon runs
//! unattended and must pick up its logging shape from the same config file
//! as everything else.

use std::fs::OpenOptions;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::LogConfig;
use crate::error::ConfigError;

/// Initializes the global `tracing` subscriber from policy. Must be called
/// exactly once, before any other component logs.
pub fn init_logging(config: &LogConfig) -> Result<(), ConfigError> {
    let level = Level::from_str(&config.level)
        .map_err(|_| ConfigError::UnknownLogLevel(config.level.clone()))?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let registry = Registry::default().with(env_filter);

    match config.target.as_str() {
        "stdout" => {
            if config.format == "json" {
                registry.with(json_layer(std::io::stdout)).init();
            } else {
                registry.with(console_layer(std::io::stdout)).init();
            }
        }
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| ConfigError::Io {
                    path: path.into(),
                    source,
                })?;
            let file = std::sync::Mutex::new(file);
            if config.format == "json" {
                registry.with(json_layer(file)).init();
            } else {
                registry.with(console_layer(file)).init();
            }
        }
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "guardian-daemon logging initialized");
    Ok(())
}

fn json_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(writer)
}

fn console_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .with_writer(writer)
}

/// Span covering one enforcer tick for a single user.
#[macro_export]
macro_rules! enforce_span {
    ($username:expr) => {
        tracing::info_span!(
            "enforce_tick",
            username = %$username,
            tier = tracing::field::Empty,
            remaining_minutes = tracing::field::Empty,
        )
    };
}

/// Span covering one session-lifecycle event.
#[macro_export]
macro_rules! session_span {
    ($platform_id:expr) => {
        tracing::info_span!(
            "session_event",
            platform_session_id = %$platform_id,
            username = tracing::field::Empty,
        )
    };
}

pub fn log_session_started(username: &str, platform_session_id: &str, desktop: &str) {
    tracing::info!(
        username = %username,
        platform_session_id = %platform_session_id,
        desktop = %desktop,
        "session started"
    );
}

pub fn log_session_ended(username: &str, platform_session_id: &str, duration_secs: i64) {
    tracing::info!(
        username = %username,
        platform_session_id = %platform_session_id,
        duration_secs = %duration_secs,
        "session ended"
    );
}

pub fn log_notification_sent(username: &str, tier: &str, category: &str, delivered: bool) {
    if delivered {
        tracing::info!(username = %username, tier = %tier, category = %category, "notification delivered");
    } else {
        tracing::warn!(username = %username, tier = %tier, category = %category, "notification delivery failed");
    }
}

pub fn log_enforcement_action(username: &str, action: &str, reason: &str) {
    tracing::warn!(username = %username, action = %action, reason = %reason, "enforcement action taken");
}

pub fn log_reload_result(path: &std::path::Path, applied: bool, reason: &str) {
    if applied {
        tracing::info!(path = %path.display(), "policy reload applied");
    } else {
        tracing::warn!(path = %path.display(), reason = %reason, "policy reload rejected, keeping previous snapshot");
    }
}

pub fn log_rollover(username: &str, total_seconds: i64) {
    tracing::info!(username = %username, total_seconds = %total_seconds, "daily rollover archived session");
}
