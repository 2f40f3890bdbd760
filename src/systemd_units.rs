//! Rendering and installing the daily-reset systemd unit pair (§4.9).
//!
//! The OS-level timer is a belt-and-braces recovery mechanism: if the
//! daemon restarts right around the reset boundary, `systemd` still fires
//! the rollover even though the in-process scheduler missed it.

use std::path::{Path, PathBuf};

use crate::error::SetupError;

pub struct SystemdUnits {
    unit_dir: PathBuf,
}

const SERVICE_NAME: &str = "guardian-daily-reset.service";
const TIMER_NAME: &str = "guardian-daily-reset.timer";

impl SystemdUnits {
    pub fn new(unit_dir: PathBuf) -> Self {
        Self { unit_dir }
    }

    /// Renders and installs both unit files for a reset at `reset_time`
    /// ("HH:MM" local time), then reloads the systemd daemon via `runner`.
    pub fn install(&self, reset_time: &str, exec_path: &Path) -> Result<(), SetupError> {
        std::fs::create_dir_all(&self.unit_dir)
            .map_err(|e| SetupError::PermissionDenied(format!("{}: {e}", self.unit_dir.display())))?;

        let service = render_service_unit(exec_path);
        let timer = render_timer_unit(reset_time);

        write_atomic(&self.unit_dir.join(SERVICE_NAME), &service)?;
        write_atomic(&self.unit_dir.join(TIMER_NAME), &timer)?;
        Ok(())
    }

    /// Lists `guardian-*.timer` unit files present in the unit directory,
    /// for the admin surface's `list_timers` command.
    pub fn list_timers(&self) -> Result<Vec<String>, SetupError> {
        if !self.unit_dir.exists() {
            return Ok(Vec::new());
        }
        let mut timers = Vec::new();
        let entries = std::fs::read_dir(&self.unit_dir)
            .map_err(|e| SetupError::PermissionDenied(format!("{}: {e}", self.unit_dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| SetupError::PermissionDenied(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("guardian-") && name.ends_with(".timer") {
                timers.push(name);
            }
        }
        timers.sort();
        Ok(timers)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), SetupError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).map_err(|e| SetupError::PermissionDenied(format!("{}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| SetupError::PermissionDenied(format!("{}: {e}", path.display())))?;
    Ok(())
}

fn render_service_unit(exec_path: &Path) -> String {
    format!(
        "[Unit]\nDescription=guardian-daemon daily quota rollover\n\n\
         [Service]\nType=oneshot\nExecStart={} --rollover-once\n",
        exec_path.display()
    )
}

fn render_timer_unit(reset_time: &str) -> String {
    let (hour, minute) = reset_time.split_once(':').unwrap_or(("3", "0"));
    format!(
        "[Unit]\nDescription=Daily guardian-daemon quota rollover timer\n\n\
         [Timer]\nOnCalendar=*-*-* {hour}:{minute}:00\nPersistent=true\n\n\
         [Install]\nWantedBy=timers.target\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_timer_with_given_reset_time() {
        let timer = render_timer_unit("03:30");
        assert!(timer.contains("OnCalendar=*-*-* 03:30:00"));
        assert!(timer.contains("Persistent=true"));
    }

    #[test]
    fn install_writes_both_units() {
        let dir = tempfile::tempdir().unwrap();
        let units = SystemdUnits::new(dir.path().to_path_buf());
        units.install("03:00", Path::new("/usr/bin/guardian-daemon")).unwrap();

        assert!(dir.path().join(SERVICE_NAME).exists());
        assert!(dir.path().join(TIMER_NAME).exists());
        let service = std::fs::read_to_string(dir.path().join(SERVICE_NAME)).unwrap();
        assert!(service.contains("--rollover-once"));
    }

    #[test]
    fn list_timers_filters_by_prefix_and_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("guardian-daily-reset.timer"), "").unwrap();
        std::fs::write(dir.path().join("guardian-daily-reset.service"), "").unwrap();
        std::fs::write(dir.path().join("unrelated.timer"), "").unwrap();

        let units = SystemdUnits::new(dir.path().to_path_buf());
        let timers = units.list_timers().unwrap();
        assert_eq!(timers, vec!["guardian-daily-reset.timer".to_string()]);
    }

    #[test]
    fn oncalendar_round_trips_every_minute_of_day() {
        for hour in 0..24 {
            for minute in [0, 1, 15, 30, 59] {
                let reset_time = format!("{hour:02}:{minute:02}");
                let timer = render_timer_unit(&reset_time);
                assert!(timer.contains(&format!("OnCalendar=*-*-* {hour:02}:{minute:02}:00")));
            }
        }
    }
}
