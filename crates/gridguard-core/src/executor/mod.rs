//! Executor contract and generic retry.
//!
//! An executor runs exactly one action against one target. Failures are
//! reported as [`ActionResult`] values, never as control flow; the
//! orchestrator's on-error policy is the only place a failure escalates.

mod factory;
mod guest;
mod local;
mod remote;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

pub use factory::{ExecutorFactory, FactoryError};
pub use guest::{GuestControlExecutor, GuestExecExecutor};
pub use local::LocalExecutor;
pub use remote::RemoteShellExecutor;

use crate::action::RetryPolicy;
use crate::stop::StopSignal;

/// Outcome of one executor operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    /// Whether the operation achieved its intended outcome.
    pub success: bool,
    /// Captured stdout (possibly empty).
    pub output: String,
    /// Failure description when `success` is false.
    pub error: Option<String>,
    /// Wall-clock duration of the operation, including retries.
    pub duration: Duration,
    /// Number of retries consumed (0 for a first-attempt success).
    pub retries: u32,
}

impl ActionResult {
    /// A successful result with captured output.
    #[must_use]
    pub fn ok(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            duration,
            retries: 0,
        }
    }

    /// A failed result with an error description.
    #[must_use]
    pub fn fail(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration,
            retries: 0,
        }
    }

    /// A failed result that still captured some output.
    #[must_use]
    pub fn fail_with_output(
        error: impl Into<String>,
        output: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            duration,
            retries: 0,
        }
    }

    /// Marker result for an operation cut short by a deadline.
    #[must_use]
    pub fn timed_out(deadline_was: Duration, duration: Duration) -> Self {
        Self::fail(
            format!(
                "timed out after {}",
                humantime::format_duration(deadline_was)
            ),
            duration,
        )
    }
}

/// Uniform contract for running one action against one target.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs the primary command, honoring `deadline`.
    async fn execute(&self, deadline: Instant) -> ActionResult;

    /// Runs the paired recovery command; a no-op success when none is set.
    async fn recover(&self, deadline: Instant) -> ActionResult;

    /// Verifies the action outcome against the configured expectation.
    ///
    /// Executors without a configured healthcheck return `true`. A
    /// verification transport error counts as a mismatch.
    async fn healthcheck(&self, deadline: Instant) -> bool;

    /// Short human-readable label for logs and journal entries.
    fn describe(&self) -> String;
}

/// Runs `exec.execute` under the given retry policy.
///
/// A retry is consumed whenever an attempt reports failure. Between
/// attempts the policy delay is awaited (doubling under exponential
/// backoff); a stop request aborts the wait immediately and the result
/// names the cancellation rather than retry exhaustion. The returned
/// result carries the number of retries consumed.
pub async fn run_with_retry(
    exec: &dyn Executor,
    policy: Option<&RetryPolicy>,
    deadline: Instant,
    stop: &mut StopSignal,
) -> ActionResult {
    let started = Instant::now();
    let Some(policy) = policy.filter(|p| p.attempts > 1) else {
        return exec.execute(deadline).await;
    };

    let mut last = None;
    for attempt in 1..=policy.attempts {
        let mut result = exec.execute(deadline).await;
        result.retries = attempt - 1;
        if result.success {
            result.duration = started.elapsed();
            return result;
        }
        last = Some(result);

        if attempt < policy.attempts {
            let delay = policy.delay_after_attempt(attempt);
            if stop.sleep_interruptible(delay).await {
                let mut cancelled =
                    ActionResult::fail("cancelled while waiting to retry", started.elapsed());
                cancelled.retries = attempt;
                return cancelled;
            }
        }
    }

    let mut result =
        last.unwrap_or_else(|| ActionResult::fail("no attempts were made", started.elapsed()));
    result.retries = policy.attempts.saturating_sub(1);
    result.duration = started.elapsed();
    result
}

/// Shortens a command string for labels and logs.
#[must_use]
pub(crate) fn truncate_command(command: &str) -> String {
    const MAX: usize = 48;
    if command.chars().count() <= MAX {
        command.to_string()
    } else {
        let head: String = command.chars().take(MAX - 3).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::action::Backoff;
    use crate::stop::stop_channel;

    /// Fails a scripted number of times, then succeeds.
    struct Flaky {
        failures: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl Executor for Flaky {
        async fn execute(&self, _deadline: Instant) -> ActionResult {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                ActionResult::fail("scripted failure", Duration::ZERO)
            } else {
                ActionResult::ok("done", Duration::ZERO)
            }
        }

        async fn recover(&self, _deadline: Instant) -> ActionResult {
            ActionResult::ok("", Duration::ZERO)
        }

        async fn healthcheck(&self, _deadline: Instant) -> bool {
            true
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    #[tokio::test]
    async fn test_retry_count_matches_failures() {
        let exec = Flaky::new(2);
        let policy = RetryPolicy {
            attempts: 5,
            delay: Duration::from_millis(1),
            backoff: Backoff::Linear,
        };
        let mut stop = StopSignal::never();
        let result = run_with_retry(
            &exec,
            Some(&policy),
            Instant::now() + Duration::from_secs(5),
            &mut stop,
        )
        .await;
        assert!(result.success);
        assert_eq!(result.retries, 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_keeps_last_error() {
        let exec = Flaky::new(10);
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
            backoff: Backoff::Linear,
        };
        let mut stop = StopSignal::never();
        let result = run_with_retry(
            &exec,
            Some(&policy),
            Instant::now() + Duration::from_secs(5),
            &mut stop,
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.retries, 2);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_cancel_during_retry_wait_returns_promptly() {
        let exec = Flaky::new(10);
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_secs(600),
            backoff: Backoff::Linear,
        };
        let (ctl, mut stop) = stop_channel();
        let deadline = Instant::now() + Duration::from_secs(3600);
        let handle =
            tokio::spawn(
                async move { run_with_retry(&exec, Some(&policy), deadline, &mut stop).await },
            );
        ctl.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("cancelled retry must return promptly")
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_no_policy_runs_once() {
        let exec = Flaky::new(1);
        let mut stop = StopSignal::never();
        let result = run_with_retry(
            &exec,
            None,
            Instant::now() + Duration::from_secs(5),
            &mut stop,
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.retries, 0);
    }

    #[test]
    fn test_truncate_command() {
        assert_eq!(truncate_command("echo hi"), "echo hi");
        let long = "x".repeat(100);
        let short = truncate_command(&long);
        assert!(short.chars().count() <= 48);
        assert!(short.ends_with("..."));
    }

    #[test]
    fn test_timed_out_result_names_the_deadline() {
        let result = ActionResult::timed_out(Duration::from_millis(100), Duration::from_millis(120));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }
}
