//! Narrow boundary around external-tool invocation.
//!
//! Account lock/unlock, session termination, group membership, and systemd
//! reloads all shell out to platform tools. Every call site goes through
//! this trait instead of `tokio::process::Command` directly so tests can
//! substitute a fake runner rather than actually invoking `usermod` et al.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], deadline: Duration) -> std::io::Result<CommandOutput>;
}

/// Real subprocess runner; used in production.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str], deadline: Duration) -> std::io::Result<CommandOutput> {
        let child = Command::new(program).args(args).output();
        match timeout(deadline, child).await {
            Ok(result) => {
                let output = result?;
                Ok(CommandOutput {
                    status_success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{program} did not complete within {deadline:?}"),
            )),
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct Invocation {
        pub program: String,
        pub args: Vec<String>,
    }

    /// Records every invocation and returns a scripted response per call
    /// (defaulting to success once the script is exhausted).
    #[derive(Default)]
    pub struct FakeCommandRunner {
        pub calls: Mutex<Vec<Invocation>>,
        pub responses: Mutex<Vec<CommandOutput>>,
    }

    impl FakeCommandRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_response(&self, output: CommandOutput) {
            self.responses.lock().unwrap().push(output);
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn calls_matching(&self, program: &str) -> Vec<Invocation> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|i| i.program == program)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeCommandRunner {
        async fn run(&self, program: &str, args: &[&str], _deadline: Duration) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(Invocation {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            });
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(CommandOutput {
                    status_success: true,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            } else {
                Ok(responses.remove(0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeCommandRunner;
    use super::*;

    #[tokio::test]
    async fn real_runner_captures_stdout() {
        let runner = SystemCommandRunner;
        let out = runner.run("echo", &["hello"], Duration::from_secs(2)).await.unwrap();
        assert!(out.status_success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn real_runner_times_out() {
        let runner = SystemCommandRunner;
        let result = runner.run("sleep", &["5"], Duration::from_millis(50)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fake_runner_records_calls() {
        let runner = FakeCommandRunner::new();
        runner.run("usermod", &["-L", "alice"], Duration::from_secs(1)).await.unwrap();
        assert_eq!(runner.call_count(), 1);
        assert_eq!(runner.calls_matching("usermod").len(), 1);
    }
}
