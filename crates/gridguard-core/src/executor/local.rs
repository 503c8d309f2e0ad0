//! Local command execution.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

use super::{truncate_command, ActionResult, Executor};
use crate::action::{HealthExpect, Healthcheck};

/// Deadline applied to healthcheck commands, which are expected to be quick.
const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a command on the local host via `/bin/sh -c`.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    command: String,
    recovery: Option<String>,
    healthcheck: Option<Healthcheck>,
    shell: String,
}

impl LocalExecutor {
    /// Creates a local executor for `command`.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            recovery: None,
            healthcheck: None,
            shell: "/bin/sh".to_string(),
        }
    }

    /// Sets the recovery command.
    #[must_use]
    pub fn with_recovery(mut self, recovery: Option<String>) -> Self {
        self.recovery = recovery;
        self
    }

    /// Sets the post-action verification.
    #[must_use]
    pub fn with_healthcheck(mut self, healthcheck: Option<Healthcheck>) -> Self {
        self.healthcheck = healthcheck;
        self
    }

    async fn run_shell(&self, command: &str, deadline: Instant) -> ActionResult {
        let started = Instant::now();
        let budget = deadline.saturating_duration_since(started);

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command, "running local command");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ActionResult::fail(format!("spawn failed: {e}"), started.elapsed());
            },
        };

        match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
            Err(_) => ActionResult::timed_out(budget, started.elapsed()),
            Ok(Err(e)) => ActionResult::fail(format!("wait failed: {e}"), started.elapsed()),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                if output.status.success() {
                    ActionResult::ok(stdout, started.elapsed())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    ActionResult::fail_with_output(
                        format!("exit status {}: {}", output.status, stderr.trim_end()),
                        stdout,
                        started.elapsed(),
                    )
                }
            },
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, deadline: Instant) -> ActionResult {
        self.run_shell(&self.command, deadline).await
    }

    async fn recover(&self, deadline: Instant) -> ActionResult {
        match self.recovery.as_deref().filter(|r| !r.is_empty()) {
            Some(recovery) => self.run_shell(recovery, deadline).await,
            None => ActionResult::ok("no recovery command defined", Duration::ZERO),
        }
    }

    async fn healthcheck(&self, _deadline: Instant) -> bool {
        let Some(check) = &self.healthcheck else {
            return true;
        };
        let deadline = Instant::now() + HEALTHCHECK_TIMEOUT;
        let result = self.run_shell(&check.command, deadline).await;
        match check.expect {
            HealthExpect::Success => result.success,
            HealthExpect::Failure => !result.success,
        }
    }

    fn describe(&self) -> String {
        format!("local: {}", truncate_command(&self.command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::HealthExpect;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let result = LocalExecutor::new("echo hello").execute(far_deadline()).await;
        assert!(result.success);
        assert_eq!(result.output, "hello\n");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr() {
        let result = LocalExecutor::new("echo oops >&2; exit 3")
            .execute(far_deadline())
            .await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("oops"), "stderr missing from: {error}");
    }

    #[tokio::test]
    async fn test_deadline_kills_and_reports_timeout() {
        let deadline = Instant::now() + Duration::from_millis(100);
        let result = LocalExecutor::new("sleep 10").execute(deadline).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(result.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_recover_without_command_is_noop_success() {
        let result = LocalExecutor::new("true").recover(far_deadline()).await;
        assert!(result.success);
        assert!(result.output.contains("no recovery command"));
    }

    #[tokio::test]
    async fn test_recover_runs_recovery_command() {
        let exec =
            LocalExecutor::new("true").with_recovery(Some("echo recovered".to_string()));
        let result = exec.recover(far_deadline()).await;
        assert!(result.success);
        assert_eq!(result.output, "recovered\n");
    }

    #[tokio::test]
    async fn test_healthcheck_expect_success() {
        let exec = LocalExecutor::new("true").with_healthcheck(Some(Healthcheck {
            command: "true".to_string(),
            expect: HealthExpect::Success,
        }));
        assert!(exec.healthcheck(far_deadline()).await);
    }

    #[tokio::test]
    async fn test_healthcheck_expect_failure() {
        let exec = LocalExecutor::new("true").with_healthcheck(Some(Healthcheck {
            command: "false".to_string(),
            expect: HealthExpect::Failure,
        }));
        assert!(exec.healthcheck(far_deadline()).await);

        let exec = LocalExecutor::new("true").with_healthcheck(Some(Healthcheck {
            command: "true".to_string(),
            expect: HealthExpect::Failure,
        }));
        assert!(!exec.healthcheck(far_deadline()).await);
    }

    #[tokio::test]
    async fn test_no_healthcheck_passes() {
        assert!(LocalExecutor::new("true").healthcheck(far_deadline()).await);
    }

    #[test]
    fn test_describe() {
        assert_eq!(LocalExecutor::new("echo hi").describe(), "local: echo hi");
    }
}
