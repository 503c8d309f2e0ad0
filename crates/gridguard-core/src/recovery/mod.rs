//! Recovery: reverse replay of completed actions once power is back.
//!
//! Entered when the journal holds an interrupted or failed session (or,
//! on operator request, a completed one) and recovery is enabled. Each
//! recoverable journal entry has its executor rebuilt from the embedded
//! action specification; entries whose executor cannot be rebuilt are
//! reported for manual recovery, never silently skipped.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::executor::ExecutorFactory;
use crate::journal::{CompletedAction, Journal, SessionStatus};
use crate::orchestrator::Notifier;
use crate::stop::StopSignal;

/// What to do when recovering one action fails. Either way the pass
/// continues to the next action; only the reporting differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryErrorPolicy {
    /// Emit a per-failure notification and continue.
    Notify,
    /// Continue silently.
    #[default]
    Ignore,
}

/// Recovery configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Master toggle; a disabled manager refuses to run.
    pub enabled: bool,

    /// Debounce wait before touching anything, so flapping mains do not
    /// trigger a premature restart.
    pub power_stable_delay: Duration,

    /// Per-failure handling.
    pub on_error: RecoveryErrorPolicy,

    /// Attempts per action (including the first).
    pub max_attempts: u32,

    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            power_stable_delay: Duration::from_secs(60),
            on_error: RecoveryErrorPolicy::default(),
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Errors that prevent a recovery pass from running at all.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Recovery is disabled in configuration.
    #[error("recovery is disabled")]
    Disabled,

    /// The journal holds nothing recoverable.
    #[error("nothing to recover (status: {0})")]
    NothingToRecover(SessionStatus),

    /// The pass was cancelled before any action was touched.
    #[error("recovery cancelled during power-stable delay")]
    Cancelled,
}

/// End-of-pass report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Actions whose recovery command succeeded.
    pub recovered: usize,
    /// Actions whose recovery command failed after all attempts.
    pub failed: usize,
    /// Actions that could not be rebuilt and need manual recovery.
    pub skipped: usize,
}

impl RecoveryReport {
    /// Total number of errors (failed plus skipped).
    #[must_use]
    pub const fn errors(&self) -> usize {
        self.failed + self.skipped
    }
}

/// Replays recovery commands in reverse completion order.
pub struct Recovery {
    config: RecoveryConfig,
    journal: Arc<Journal>,
    factory: ExecutorFactory,
    notifier: Arc<dyn Notifier>,
}

impl Recovery {
    /// Creates a recovery manager.
    #[must_use]
    pub fn new(
        config: RecoveryConfig,
        journal: Arc<Journal>,
        factory: ExecutorFactory,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            journal,
            factory,
            notifier,
        }
    }

    /// True when recovery is enabled and the journal demands a pass.
    #[must_use]
    pub fn should_run(&self) -> bool {
        self.config.enabled && self.journal.needs_recovery()
    }

    /// Runs one recovery pass.
    ///
    /// On a clean pass the journal is cleared and the status returns to
    /// idle; any error leaves the session failed with an error count, and
    /// a failed session is never retried automatically.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError`] when the pass cannot start (disabled,
    /// nothing to recover, cancelled during the stability delay).
    pub async fn execute(&self, stop: &mut StopSignal) -> Result<RecoveryReport, RecoveryError> {
        if !self.config.enabled {
            return Err(RecoveryError::Disabled);
        }
        let state = self.journal.snapshot();
        if !matches!(
            state.status,
            SessionStatus::InProgress | SessionStatus::Completed | SessionStatus::Failed
        ) {
            return Err(RecoveryError::NothingToRecover(state.status));
        }

        let actions = self.journal.actions_for_recovery();
        info!(
            session_id = %state.session_id,
            trigger = %state.trigger_event,
            actions = actions.len(),
            "recovery starting"
        );
        self.notify(
            "recovery_start",
            json!({
                "session_id": state.session_id.clone(),
                "original_trigger": state.trigger_event.clone(),
                "actions_to_recover": actions.len(),
            }),
        )
        .await;

        if let Err(e) = self.journal.set_status(SessionStatus::Recovering) {
            error!(error = %e, "failed to journal recovering status");
        }

        if !self.config.power_stable_delay.is_zero() {
            info!(delay = ?self.config.power_stable_delay, "waiting for power to stabilize");
            if stop.sleep_interruptible(self.config.power_stable_delay).await {
                return Err(RecoveryError::Cancelled);
            }
        }

        let mut report = RecoveryReport {
            recovered: 0,
            failed: 0,
            skipped: 0,
        };

        for (i, action) in actions.iter().enumerate() {
            if stop.is_stopped() {
                warn!("stop requested, abandoning remaining recoveries");
                report.failed += actions.len() - i;
                break;
            }

            info!(
                index = i + 1,
                total = actions.len(),
                phase = %action.phase_name,
                action = %action.description,
                "recovering action"
            );
            match self.recover_one(action, stop).await {
                Ok(()) => report.recovered += 1,
                Err(RecoverActionError::Unreconstructable(reason)) => {
                    report.skipped += 1;
                    warn!(action = %action.description, reason, "recovery skipped");
                    self.report_failure(action, &reason).await;
                },
                Err(RecoverActionError::Failed(reason)) => {
                    report.failed += 1;
                    warn!(action = %action.description, reason, "recovery failed");
                    self.report_failure(action, &reason).await;
                },
            }
        }

        if report.errors() == 0 {
            if let Err(e) = self.journal.clear() {
                error!(error = %e, "failed to clear journal after recovery");
            }
            info!(recovered = report.recovered, "recovery completed");
        } else {
            let message = format!("{} recovery errors", report.errors());
            if let Err(e) = self
                .journal
                .set_error(&message)
                .and_then(|()| self.journal.set_status(SessionStatus::Failed))
            {
                error!(error = %e, "failed to journal recovery failure");
            }
            warn!(
                recovered = report.recovered,
                failed = report.failed,
                skipped = report.skipped,
                "recovery completed with errors; manual intervention required"
            );
        }

        self.notify(
            "recovery_complete",
            json!({
                "session_id": state.session_id.clone(),
                "total_actions": actions.len(),
                "recovered": report.recovered,
                "errors": report.errors(),
            }),
        )
        .await;

        Ok(report)
    }

    async fn recover_one(
        &self,
        action: &CompletedAction,
        stop: &mut StopSignal,
    ) -> Result<(), RecoverActionError> {
        let executor = self
            .factory
            .build(&action.action_spec)
            .map_err(|e| RecoverActionError::Unreconstructable(e.to_string()))?;

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_attempts.max(1) {
            let deadline = Instant::now() + action.action_spec.timeout;
            let result = executor.recover(deadline).await;
            if result.success {
                return Ok(());
            }
            last_error = result
                .error
                .unwrap_or_else(|| "recovery command failed".to_string());

            if attempt < self.config.max_attempts {
                info!(
                    attempt,
                    max = self.config.max_attempts,
                    error = %last_error,
                    "recovery attempt failed, retrying"
                );
                if stop.sleep_interruptible(self.config.retry_delay).await {
                    return Err(RecoverActionError::Failed(format!(
                        "cancelled after attempt {attempt}: {last_error}"
                    )));
                }
            }
        }
        Err(RecoverActionError::Failed(last_error))
    }

    async fn report_failure(&self, action: &CompletedAction, reason: &str) {
        match self.config.on_error {
            RecoveryErrorPolicy::Notify => {
                self.notify(
                    "recovery_error",
                    json!({
                        "phase": action.phase_name.clone(),
                        "action": action.description.clone(),
                        "error": reason,
                    }),
                )
                .await;
            },
            RecoveryErrorPolicy::Ignore => {},
        }
    }

    async fn notify(&self, event: &str, data: serde_json::Value) {
        if let Err(e) = self.notifier.notify(event, data).await {
            warn!(event, error = %e, "notification failed");
        }
    }
}

enum RecoverActionError {
    /// The executor could not be rebuilt; manual recovery needed.
    Unreconstructable(String),
    /// The recovery command ran and failed after all attempts.
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_error_count() {
        let report = RecoveryReport {
            recovered: 3,
            failed: 1,
            skipped: 2,
        };
        assert_eq!(report.errors(), 3);
    }

    #[test]
    fn test_default_config_matches_contract() {
        let config = RecoveryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        // Unconfigured error handling continues silently.
        assert_eq!(config.on_error, RecoveryErrorPolicy::Ignore);
    }
}
