//! Remote shell execution.
//!
//! Drives the system `ssh` client in batch mode rather than speaking the
//! SSH protocol in-process. Key-based authentication only; host-key policy
//! is delegated to the operator's `known_hosts`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

use super::{truncate_command, ActionResult, Executor};
use crate::action::{HealthExpect, Healthcheck};

const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a command on a remote host as `user@host[:port]` with a key file.
#[derive(Debug, Clone)]
pub struct RemoteShellExecutor {
    host: String,
    port: u16,
    user: String,
    key_file: Option<String>,
    command: String,
    recovery: Option<String>,
    healthcheck: Option<Healthcheck>,
}

impl RemoteShellExecutor {
    /// Creates a remote executor. `host` may carry a `:port` suffix
    /// (default 22); `user` defaults to `root` when empty.
    #[must_use]
    pub fn new(host: &str, user: &str, command: impl Into<String>) -> Self {
        let (host, port) = match host.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(port) => (h.to_string(), port),
                Err(_) => (host.to_string(), 22),
            },
            None => (host.to_string(), 22),
        };
        let user = if user.is_empty() { "root" } else { user };
        Self {
            host,
            port,
            user: user.to_string(),
            key_file: None,
            command: command.into(),
            recovery: None,
            healthcheck: None,
        }
    }

    /// Sets the SSH private key path. Without one, the ssh client falls
    /// back to its usual identity lookup.
    #[must_use]
    pub fn with_key_file(mut self, key_file: Option<String>) -> Self {
        self.key_file = key_file;
        self
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

    async fn run_remote(&self, command: &str, deadline: Instant) -> ActionResult {
        let started = Instant::now();
        let budget = deadline.saturating_duration_since(started);
        // Bound the TCP dial separately so a black-holed host does not eat
        // the whole action budget.
        let connect_timeout = budget.as_secs().clamp(1, 10);

        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={connect_timeout}"))
            .arg("-p")
            .arg(self.port.to_string());
        if let Some(key) = &self.key_file {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.user, self.host))
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host = %self.host, user = %self.user, command, "running remote command");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ActionResult::fail(format!("ssh spawn failed: {e}"), started.elapsed());
            },
        };

        match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
            Err(_) => ActionResult::timed_out(budget, started.elapsed()),
            Ok(Err(e)) => ActionResult::fail(format!("ssh wait failed: {e}"), started.elapsed()),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                if output.status.success() {
                    ActionResult::ok(stdout, started.elapsed())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    ActionResult::fail_with_output(
                        format!(
                            "ssh to {}@{} failed ({}): {}",
                            self.user,
                            self.host,
                            output.status,
                            stderr.trim_end()
                        ),
                        stdout,
                        started.elapsed(),
                    )
                }
            },
        }
    }
}

#[async_trait]
impl Executor for RemoteShellExecutor {
    async fn execute(&self, deadline: Instant) -> ActionResult {
        self.run_remote(&self.command, deadline).await
    }

    async fn recover(&self, deadline: Instant) -> ActionResult {
        match self.recovery.as_deref().filter(|r| !r.is_empty()) {
            Some(recovery) => self.run_remote(recovery, deadline).await,
            None => ActionResult::ok("no recovery command defined", Duration::ZERO),
        }
    }

    async fn healthcheck(&self, _deadline: Instant) -> bool {
        let Some(check) = &self.healthcheck else {
            return true;
        };
        let deadline = Instant::now() + HEALTHCHECK_TIMEOUT;
        let result = self.run_remote(&check.command, deadline).await;
        match check.expect {
            HealthExpect::Success => result.success,
            HealthExpect::Failure => !result.success,
        }
    }

    fn describe(&self) -> String {
        format!(
            "ssh {}@{}: {}",
            self.user,
            self.host,
            truncate_command(&self.command)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_parsing() {
        let exec = RemoteShellExecutor::new("backup.lan:2222", "admin", "true");
        assert_eq!(exec.host, "backup.lan");
        assert_eq!(exec.port, 2222);

        let exec = RemoteShellExecutor::new("backup.lan", "admin", "true");
        assert_eq!(exec.port, 22);
    }

    #[test]
    fn test_user_defaults_to_root() {
        let exec = RemoteShellExecutor::new("host", "", "true");
        assert_eq!(exec.user, "root");
    }

    #[test]
    fn test_describe() {
        let exec = RemoteShellExecutor::new("nas.lan", "admin", "poweroff");
        assert_eq!(exec.describe(), "ssh admin@nas.lan: poweroff");
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_within_deadline() {
        // TEST-NET-1 address; the dial cannot succeed.
        let exec = RemoteShellExecutor::new("192.0.2.1:22", "root", "true");
        let deadline = Instant::now() + Duration::from_secs(3);
        let result = exec.execute(deadline).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
