//! Host provisioning: the managed group and the D-Bus system policy that
//! lets session agents in that group talk to the daemon (§4.8).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command_runner::CommandRunner;
use crate::error::SetupError;

const COMMAND_DEADLINE: Duration = Duration::from_secs(10);

pub struct UserManager {
    runner: Arc<dyn CommandRunner>,
    dbus_policy_path: PathBuf,
}

impl UserManager {
    pub fn new(runner: Arc<dyn CommandRunner>, dbus_policy_path: PathBuf) -> Self {
        Self {
            runner,
            dbus_policy_path,
        }
    }

    /// Ensures `group` exists and every username in `usernames` is a
    /// member. Idempotent: already-satisfied membership issues no command.
    pub async fn ensure_group(&self, group: &str, usernames: &[String]) -> Result<(), SetupError> {
        if !self.group_exists(group).await? {
            info!(group, "creating managed group");
            let out = self
                .runner
                .run("groupadd", &[group], COMMAND_DEADLINE)
                .await
                .map_err(|e| SetupError::GroupCreateFailed {
                    group: group.to_string(),
                    reason: e.to_string(),
                })?;
            if !out.status_success {
                return Err(SetupError::GroupCreateFailed {
                    group: group.to_string(),
                    reason: out.stderr,
                });
            }
        } else {
            debug!(group, "managed group already exists");
        }

        for username in usernames {
            if self.user_in_group(username, group).await? {
                debug!(username, group, "already a member");
                continue;
            }
            info!(username, group, "adding user to managed group");
            let out = self
                .runner
                .run("usermod", &["-aG", group, username], COMMAND_DEADLINE)
                .await
                .map_err(|e| SetupError::GroupCreateFailed {
                    group: group.to_string(),
                    reason: e.to_string(),
                })?;
            if !out.status_success {
                warn!(username, group, stderr = %out.stderr, "failed to add user to group");
            }
        }
        Ok(())
    }

    async fn group_exists(&self, group: &str) -> Result<bool, SetupError> {
        let out = self
            .runner
            .run("getent", &["group", group], COMMAND_DEADLINE)
            .await
            .map_err(|e| SetupError::GroupCreateFailed {
                group: group.to_string(),
                reason: e.to_string(),
            })?;
        Ok(out.status_success)
    }

    async fn user_in_group(&self, username: &str, group: &str) -> Result<bool, SetupError> {
        let out = self
            .runner
            .run("id", &["-nG", username], COMMAND_DEADLINE)
            .await
            .map_err(|e| SetupError::GroupCreateFailed {
                group: group.to_string(),
                reason: e.to_string(),
            })?;
        Ok(out.stdout.split_whitespace().any(|g| g == group))
    }

    /// Resolves `group`'s gid via NSS, same lookup `group_exists` already
    /// uses. Returns `None` if the group is absent or `getent`'s output
    /// doesn't parse.
    pub async fn resolve_group_id(&self, group: &str) -> Result<Option<u32>, SetupError> {
        let out = self
            .runner
            .run("getent", &["group", group], COMMAND_DEADLINE)
            .await
            .map_err(|e| SetupError::GroupCreateFailed {
                group: group.to_string(),
                reason: e.to_string(),
            })?;
        if !out.status_success {
            return Ok(None);
        }
        Ok(out.stdout.trim().split(':').nth(2).and_then(|gid| gid.parse().ok()))
    }

    /// Renders and atomically installs the D-Bus system policy fragment
    /// authorizing `group` to reach the daemon's and agents' bus names.
    pub fn install_dbus_policy(&self, group: &str) -> Result<(), SetupError> {
        let xml = render_dbus_policy(group);
        let parent = self.dbus_policy_path.parent().unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(parent)
            .map_err(|e| SetupError::PermissionDenied(format!("{}: {e}", parent.display())))?;

        let tmp_path = parent.join(".guardian.conf.tmp");
        std::fs::write(&tmp_path, &xml)
            .map_err(|e| SetupError::PermissionDenied(format!("{}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &self.dbus_policy_path)
            .map_err(|e| SetupError::PermissionDenied(format!("{}: {e}", self.dbus_policy_path.display())))?;

        info!(path = %self.dbus_policy_path.display(), group, "installed D-Bus system policy");
        Ok(())
    }
}

fn render_dbus_policy(group: &str) -> String {
    format!(
        r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
<busconfig>
  <policy group="{group}">
    <allow send_destination="org.guardian.Daemon"/>
    <allow receive_sender="org.guardian.Daemon"/>
    <allow own="org.guardian.Agent"/>
    <allow send_destination="org.guardian.Agent"/>
    <allow receive_sender="org.guardian.Agent"/>
  </policy>
  <policy user="root">
    <allow own="org.guardian.Daemon"/>
    <allow send_destination="org.guardian.Daemon"/>
    <allow receive_sender="org.guardian.Daemon"/>
    <allow send_destination="org.guardian.Agent"/>
    <allow receive_sender="org.guardian.Agent"/>
    <allow own="org.guardian.Agent"/>
  </policy>
</busconfig>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::fake::FakeCommandRunner;
    use crate::command_runner::CommandOutput;

    #[tokio::test]
    async fn creates_group_when_absent() {
        let runner = Arc::new(FakeCommandRunner::new());
        // getent fails (group absent), groupadd succeeds, id -nG fails (user absent from group)
        runner.push_response(CommandOutput { status_success: false, stdout: String::new(), stderr: String::new() });
        runner.push_response(CommandOutput { status_success: true, stdout: String::new(), stderr: String::new() });
        runner.push_response(CommandOutput { status_success: false, stdout: String::new(), stderr: String::new() });
        runner.push_response(CommandOutput { status_success: true, stdout: String::new(), stderr: String::new() });

        let dir = tempfile::tempdir().unwrap();
        let manager = UserManager::new(runner.clone(), dir.path().join("guardian.conf"));
        manager.ensure_group("kids", &["alice".to_string()]).await.unwrap();

        assert_eq!(runner.calls_matching("groupadd").len(), 1);
        assert_eq!(runner.calls_matching("usermod").len(), 1);
    }

    #[tokio::test]
    async fn skips_usermod_when_already_member() {
        let runner = Arc::new(FakeCommandRunner::new());
        runner.push_response(CommandOutput { status_success: true, stdout: String::new(), stderr: String::new() }); // getent: exists
        runner.push_response(CommandOutput { status_success: true, stdout: "kids sudo".to_string(), stderr: String::new() }); // id -nG

        let dir = tempfile::tempdir().unwrap();
        let manager = UserManager::new(runner.clone(), dir.path().join("guardian.conf"));
        manager.ensure_group("kids", &["alice".to_string()]).await.unwrap();

        assert_eq!(runner.calls_matching("usermod").len(), 0);
    }

    #[tokio::test]
    async fn resolve_group_id_parses_third_field() {
        let runner = Arc::new(FakeCommandRunner::new());
        runner.push_response(CommandOutput {
            status_success: true,
            stdout: "kids:x:1001:alice,bob".to_string(),
            stderr: String::new(),
        });

        let dir = tempfile::tempdir().unwrap();
        let manager = UserManager::new(runner, dir.path().join("guardian.conf"));
        assert_eq!(manager.resolve_group_id("kids").await.unwrap(), Some(1001));
    }

    #[tokio::test]
    async fn resolve_group_id_is_none_when_group_absent() {
        let runner = Arc::new(FakeCommandRunner::new());
        runner.push_response(CommandOutput {
            status_success: false,
            stdout: String::new(),
            stderr: String::new(),
        });

        let dir = tempfile::tempdir().unwrap();
        let manager = UserManager::new(runner, dir.path().join("guardian.conf"));
        assert_eq!(manager.resolve_group_id("kids").await.unwrap(), None);
    }

    #[test]
    fn dbus_policy_contains_group_and_root_blocks() {
        let xml = render_dbus_policy("kids");
        assert!(xml.contains(r#"group="kids""#));
        assert!(xml.contains(r#"user="root""#));
        assert!(xml.contains("org.guardian.Daemon"));
    }

    #[tokio::test]
    async fn install_dbus_policy_writes_file_atomically() {
        let runner = Arc::new(FakeCommandRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("nested").join("guardian.conf");
        let manager = UserManager::new(runner, policy_path.clone());

        manager.install_dbus_policy("kids").unwrap();
        let contents = std::fs::read_to_string(&policy_path).unwrap();
        assert!(contents.contains("kids"));
        assert!(!dir.path().join("nested").join(".guardian.conf.tmp").exists());
    }
}
