//! Login-time rules file management (curfew enforcement, §4.5).
//!
//! Rewrites only the block of `login;*;<user>;<day>;<window>` lines that
//! guardian-daemon owns, leaving any other administrator's rules in the
//! file untouched, and replaces the file atomically (write to a sibling
//! temp file, fsync, rename over the target).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::PolicySnapshot;
use crate::error::SetupError;

const MANAGED_HEADER: &str = "# Managed by guardian-daemon";
const RULE_PREFIX: &str = "login;*;";

pub struct PamWriter {
    rules_path: PathBuf,
}

impl PamWriter {
    pub fn new(rules_path: PathBuf) -> Self {
        Self { rules_path }
    }

    /// Rewrites the managed block for every managed user in `snapshot`.
    pub fn write_rules(&self, snapshot: &PolicySnapshot) -> Result<(), SetupError> {
        let managed: std::collections::HashSet<&str> = snapshot.managed_usernames().collect();
        let kept = self.read_unmanaged_lines(&managed)?;
        let rules = generate_rules(snapshot);
        self.atomic_replace(&kept, &rules)
    }

    /// Strips every managed rule without writing any back; used on
    /// uninstall / when the managed set becomes empty.
    pub fn remove_rules(&self) -> Result<(), SetupError> {
        let kept = self.read_unmanaged_lines(&std::collections::HashSet::new())?;
        self.atomic_replace(&kept, &[])
    }

    fn read_unmanaged_lines(&self, managed: &std::collections::HashSet<&str>) -> Result<Vec<String>, SetupError> {
        if !self.rules_path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.rules_path)
            .map_err(|e| SetupError::PermissionDenied(format!("{}: {e}", self.rules_path.display())))?;

        Ok(contents
            .lines()
            .filter(|line| {
                if line == &MANAGED_HEADER {
                    return false;
                }
                if let Some(rest) = line.strip_prefix(RULE_PREFIX) {
                    let username = rest.split(';').next().unwrap_or("");
                    if managed.contains(username) {
                        return false;
                    }
                }
                true
            })
            .map(str::to_string)
            .collect())
    }

    fn atomic_replace(&self, kept_lines: &[String], new_rules: &[String]) -> Result<(), SetupError> {
        let parent = self
            .rules_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let tmp_path = parent.join(format!(
            ".{}.tmp",
            self.rules_path.file_name().and_then(|n| n.to_str()).unwrap_or("time.conf")
        ));

        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| SetupError::PermissionDenied(format!("{}: {e}", tmp_path.display())))?;

        if !new_rules.is_empty() {
            writeln!(file, "{MANAGED_HEADER}").map_err(|e| SetupError::PermissionDenied(e.to_string()))?;
        }
        for rule in new_rules {
            writeln!(file, "{rule}").map_err(|e| SetupError::PermissionDenied(e.to_string()))?;
        }
        for line in kept_lines {
            writeln!(file, "{line}").map_err(|e| SetupError::PermissionDenied(e.to_string()))?;
        }
        file.sync_all().map_err(|e| SetupError::PermissionDenied(e.to_string()))?;
        drop(file);

        std::fs::rename(&tmp_path, &self.rules_path)
            .map_err(|e| SetupError::PermissionDenied(format!("{}: {e}", self.rules_path.display())))?;
        Ok(())
    }
}

fn generate_rules(snapshot: &PolicySnapshot) -> Vec<String> {
    let mut rules = Vec::new();
    // BTreeMap for deterministic ordering across runs (easier to diff/test).
    let mut users: BTreeMap<&str, _> = BTreeMap::new();
    for username in snapshot.managed_usernames() {
        if let Some(user) = snapshot.effective(username) {
            users.insert(username, user);
        }
    }
    for (username, user) in users {
        let mut days: Vec<&String> = user.curfew.keys().collect();
        days.sort();
        for day in days {
            let window = &user.curfew[day];
            rules.push(format!("{RULE_PREFIX}{username};{day};{window}"));
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn snapshot_with_curfew() -> PolicySnapshot {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.yaml");
        std::fs::write(
            &path,
            r#"
users:
  alice:
    curfew:
      monday: "08:00-20:00"
      tuesday: "08:00-20:00"
  bob: {}
"#,
        )
        .unwrap();
        config::load(&path, None).unwrap()
    }

    #[test]
    fn generates_one_rule_per_curfew_day() {
        let snapshot = snapshot_with_curfew();
        let rules = generate_rules(&snapshot);
        assert_eq!(rules.len(), 2);
        assert!(rules.contains(&"login;*;alice;monday;08:00-20:00".to_string()));
    }

    #[test]
    fn preserves_foreign_lines_across_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("time.conf");
        std::fs::write(&rules_path, "login;*;root;Al0000-2400\n").unwrap();

        let writer = PamWriter::new(rules_path.clone());
        let snapshot = snapshot_with_curfew();
        writer.write_rules(&snapshot).unwrap();

        let contents = std::fs::read_to_string(&rules_path).unwrap();
        assert!(contents.contains("login;*;root;Al0000-2400"));
        assert!(contents.contains(MANAGED_HEADER));
        assert!(contents.contains("login;*;alice;monday;08:00-20:00"));
    }

    #[test]
    fn rewriting_removes_stale_managed_rules() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("time.conf");
        std::fs::write(&rules_path, format!("{MANAGED_HEADER}\nlogin;*;alice;sunday;10:00-11:00\n")).unwrap();

        let writer = PamWriter::new(rules_path.clone());
        let snapshot = snapshot_with_curfew();
        writer.write_rules(&snapshot).unwrap();

        let contents = std::fs::read_to_string(&rules_path).unwrap();
        assert!(!contents.contains("sunday"));
    }

    #[test]
    fn remove_rules_clears_managed_block() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("time.conf");
        std::fs::write(&rules_path, format!("{MANAGED_HEADER}\nlogin;*;alice;monday;08:00-20:00\nlogin;*;root;Al0000-2400\n")).unwrap();

        let writer = PamWriter::new(rules_path.clone());
        writer.remove_rules().unwrap();

        let contents = std::fs::read_to_string(&rules_path).unwrap();
        assert!(!contents.contains(MANAGED_HEADER));
        assert!(contents.contains("login;*;root;Al0000-2400"));
    }

    #[test]
    fn no_curfew_means_no_managed_block_written() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("time.conf");
        let writer = PamWriter::new(rules_path.clone());

        let default_path = dir.path().join("default.yaml");
        std::fs::write(&default_path, "users:\n  bob: {}\n").unwrap();
        let snapshot = config::load(&default_path, None).unwrap();

        writer.write_rules(&snapshot).unwrap();
        let contents = std::fs::read_to_string(&rules_path).unwrap();
        assert!(!contents.contains(MANAGED_HEADER));
    }
}
