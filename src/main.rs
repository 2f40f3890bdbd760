//! guardian-daemon entrypoint: assembles every component and runs the
//! supervisor until the process is terminated.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use zbus::Connection;

mod admin;
mod agent_registry;
mod clock;
mod command_runner;
mod config;
mod enforcer;
mod error;
mod logging;
mod pam_writer;
mod session_tracker;
mod store;
mod supervisor;
mod systemd_units;
mod user_manager;

use agent_registry::{AgentRegistry, ZbusAgentTransport};
use clock::SystemTimeProvider;
use command_runner::SystemCommandRunner;
use error::GuardianError;
use store::Store;
use supervisor::{spawn_admin_surface, Supervisor, SupervisorPaths};

const DEFAULT_CONFIG: &str = "/etc/guardian-daemon/default.yaml";
const OVERRIDE_CONFIG: &str = "/etc/guardian-daemon/local.yaml";
const UNIT_DIR: &str = "/etc/systemd/system";
const RULES_PATH: &str = "/etc/security/time.conf";
const DBUS_POLICY_PATH: &str = "/etc/dbus-1/system.d/guardian-daemon.conf";
const EXEC_PATH: &str = "/usr/bin/guardian-daemon";
const WELL_KNOWN_NAME: &str = "org.guardian.Daemon";
const OBJECT_PATH: &str = "/org/guardian/Daemon";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logging may not be initialized yet if the failure happened
            // while loading the policy that configures it.
            eprintln!("guardian-daemon: fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), GuardianError> {
    if std::env::args().skip(1).any(|arg| arg == "--rollover-once") {
        return run_rollover_once().await;
    }

    let (supervisor, connection) = assemble().await?;

    connection
        .object_server()
        .at(OBJECT_PATH, supervisor.daemon_interface())
        .await
        .map_err(error::BusError::from)?;
    connection.request_name(WELL_KNOWN_NAME).await.map_err(error::BusError::from)?;
    info!(name = WELL_KNOWN_NAME, "registered on system bus");

    let login_manager_task = {
        let supervisor = supervisor.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.run_login_manager_loop(connection).await {
                error!(error = %e, "login manager loop exited");
            }
        })
    };

    let admin_task = spawn_admin_surface(supervisor.clone())
        .await
        .map_err(|e| error::GuardianError::Setup(error::SetupError::PermissionDenied(e.to_string())))?;

    let supervisor_task = tokio::spawn(async move {
        if let Err(e) = supervisor.start().await {
            error!(error = %e, "supervisor exited");
        }
    });

    let _ = tokio::join!(login_manager_task, admin_task, supervisor_task);
    Ok(())
}

/// `--rollover-once`: the exec target of the systemd timer unit
/// (`systemd_units::render_service_unit`). Performs a single rollover and
/// exits without binding the well-known bus name, the admin socket, or the
/// login-manager subscription, so it can run alongside an already-running
/// daemon instance without colliding with it.
async fn run_rollover_once() -> Result<(), GuardianError> {
    let (supervisor, _connection) = assemble().await?;
    supervisor.rollover(true).await?;
    info!("rollover-once complete");
    Ok(())
}

/// Shared assembly for both the long-running daemon and the oneshot
/// rollover invocation: load policy, open the store, and wire every
/// component up to (but not including) registering any long-lived surface.
async fn assemble() -> Result<(Arc<Supervisor>, Connection), GuardianError> {
    let default_config = PathBuf::from(DEFAULT_CONFIG);
    let override_config = PathBuf::from(OVERRIDE_CONFIG);
    let override_config = override_config.exists().then_some(override_config);

    let policy = config::load(&default_config, override_config.as_deref())?;
    logging::init_logging(&policy.logging)?;
    info!(db_path = ?policy.db_path, "loaded policy");

    let store = Store::open(&policy.db_path).await?;
    let clock = Arc::new(SystemTimeProvider::new());
    let runner = Arc::new(SystemCommandRunner);

    let connection = Connection::system().await.map_err(error::BusError::from)?;
    let transport = Arc::new(ZbusAgentTransport::new(connection.clone()));
    let agents = Arc::new(AgentRegistry::new(transport));

    let boot_id = read_boot_id();

    let paths = SupervisorPaths {
        default_config,
        override_config,
        unit_dir: PathBuf::from(UNIT_DIR),
        rules_path: PathBuf::from(RULES_PATH),
        dbus_policy_path: PathBuf::from(DBUS_POLICY_PATH),
        exec_path: PathBuf::from(EXEC_PATH),
    };

    let supervisor = Arc::new(Supervisor::new(store, policy, paths, clock, runner, agents, boot_id));
    Ok((supervisor, connection))
}

/// Prefers the boot-scoped random id so in-memory session keys can't
/// collide across reboots even if `/etc/machine-id` is a stable per-host
/// value; falls back to the stable id, then to a fixed string for
/// environments exposing neither file.
fn read_boot_id() -> String {
    std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .or_else(|_| std::fs::read_to_string("/etc/machine-id"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|e| {
            warn!(error = %e, "could not read boot id, using fixed fallback");
            "unknown-boot".to_string()
        })
}
