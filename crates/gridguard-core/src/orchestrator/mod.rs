//! Shutdown orchestration.
//!
//! The orchestrator executes a [`Plan`] phase by phase, honoring per-action
//! retry, timeout, healthcheck, and on-error policy, and journals every
//! terminal action outcome. Phase-level failures never abort the plan by
//! themselves; only an action's `abort_all` policy (or a broken journal)
//! turns a session into a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::action::{ActionSpec, OnErrorPolicy};
use crate::executor::{run_with_retry, ActionResult, Executor};
use crate::journal::{CompletedAction, Journal, JournalError, SessionStatus};
use crate::plan::{ExecMode, Phase, Plan};
use crate::stop::StopSignal;

/// Captured output is truncated to this many bytes in journal entries.
const MAX_RECORDED_OUTPUT: usize = 4096;

/// Failure of a notification dispatch. Terminal at the notifier boundary;
/// the orchestrator logs it and moves on.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NotifyError(
    /// Failure description.
    pub String,
);

/// Receives lifecycle events (`shutdown_start`, `phase_start`,
/// `phase_complete`, `shutdown_complete`, recovery events).
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Dispatches one event with a structured payload.
    async fn notify(&self, event: &str, data: serde_json::Value) -> Result<(), NotifyError>;
}

/// A notifier that discards everything.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: &str, _data: serde_json::Value) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// End-of-session report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// The session id that was journalled.
    pub session_id: String,
    /// Terminal session status.
    pub status: SessionStatus,
    /// Number of actions that reached a terminal outcome.
    pub actions_run: usize,
    /// Number of those that failed.
    pub actions_failed: usize,
    /// Wall-clock duration of the session.
    pub duration: Duration,
}

/// Outcome of one phase, as seen by the plan loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseOutcome {
    Proceed,
    AbortAll,
}

/// Executes shutdown plans against the journal.
pub struct Orchestrator {
    plan: Plan,
    journal: Arc<Journal>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    /// Creates an orchestrator over a resolved plan.
    #[must_use]
    pub fn new(plan: Plan, journal: Arc<Journal>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            plan,
            journal,
            notifier,
        }
    }

    /// Runs the plan, journalling as it goes.
    ///
    /// `deadline` bounds the whole session; each phase and action nests its
    /// own deadline inside it. A stop request lets in-flight actions run to
    /// their deadlines, records their outcomes, and starts nothing further.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] only when the opening session save fails;
    /// later journal errors degrade the session to `failed` instead.
    pub async fn execute(
        &self,
        trigger: &str,
        deadline: Option<Instant>,
        stop: StopSignal,
    ) -> Result<SessionSummary, JournalError> {
        let started = Instant::now();
        let session_id = self.journal.start_session(trigger)?;
        info!(session_id, trigger, phases = self.plan.phases.len(), "shutdown sequence starting");

        self.notify(
            "shutdown_start",
            json!({
                "trigger": trigger,
                "session_id": session_id.clone(),
                "phases": self.plan.phases.len(),
            }),
        )
        .await;

        let journal_ok = Arc::new(AtomicBool::new(true));
        let mut aborted = false;

        for (phase_index, phase) in self.plan.phases.iter().enumerate() {
            if aborted {
                break;
            }
            if stop.is_stopped() {
                warn!("stop requested, not starting further phases");
                break;
            }

            info!(
                phase = %phase.name,
                index = phase_index + 1,
                total = self.plan.phases.len(),
                mode = ?phase.mode,
                "starting phase"
            );
            record_journal(
                &journal_ok,
                self.journal.update_progress(phase_index, 0),
            );
            self.notify(
                "phase_start",
                json!({ "phase": phase.name.clone(), "index": phase_index + 1 }),
            )
            .await;

            let phase_deadline = nested_deadline(deadline, phase.timeout);
            let outcome = match phase.mode {
                ExecMode::Sequential => {
                    self.run_sequential(phase_index, phase, phase_deadline, &journal_ok, &stop)
                        .await
                },
                ExecMode::Parallel => {
                    self.run_parallel(phase_index, phase, phase_deadline, &journal_ok, &stop)
                        .await
                },
            };

            self.notify(
                "phase_complete",
                json!({ "phase": phase.name.clone(), "index": phase_index + 1 }),
            )
            .await;

            if outcome == PhaseOutcome::AbortAll {
                warn!(phase = %phase.name, "action requested abort_all, ceasing further phases");
                aborted = true;
            }
        }

        let mut status = if aborted {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };
        if !journal_ok.load(Ordering::SeqCst) {
            // The plan may have run fine, but without a trustworthy journal
            // the session must look interrupted so recovery is attempted.
            status = SessionStatus::Failed;
        }
        if aborted {
            record_journal(&journal_ok, self.journal.set_error("plan aborted by abort_all"));
        }
        if let Err(e) = self.journal.set_status(status) {
            error!(error = %e, "failed to journal terminal status");
            status = SessionStatus::Failed;
            let _ = self.journal.set_status(status);
        }

        let snapshot = self.journal.snapshot();
        let actions_failed = snapshot
            .completed_actions
            .iter()
            .filter(|a| !a.success)
            .count();
        let summary = SessionSummary {
            session_id,
            status,
            actions_run: snapshot.completed_actions.len(),
            actions_failed,
            duration: started.elapsed(),
        };

        info!(
            session_id = %summary.session_id,
            status = %summary.status,
            actions = summary.actions_run,
            failed = summary.actions_failed,
            "shutdown sequence finished"
        );
        self.notify(
            "shutdown_complete",
            json!({
                "session_id": summary.session_id.clone(),
                "status": summary.status.to_string(),
                "actions": summary.actions_run,
                "failed": summary.actions_failed,
                "duration_secs": summary.duration.as_secs(),
            }),
        )
        .await;

        Ok(summary)
    }

    async fn run_sequential(
        &self,
        phase_index: usize,
        phase: &Phase,
        phase_deadline: Option<Instant>,
        journal_ok: &Arc<AtomicBool>,
        stop: &StopSignal,
    ) -> PhaseOutcome {
        for (action_index, action) in phase.actions.iter().enumerate() {
            if stop.is_stopped() {
                warn!(phase = %phase.name, "stop requested, skipping remaining actions");
                return PhaseOutcome::Proceed;
            }

            record_journal(
                journal_ok,
                self.journal.update_progress(phase_index, action_index),
            );

            let result = run_action(
                Arc::clone(&action.executor),
                &action.spec,
                phase_deadline,
                stop.clone(),
            )
            .await;
            let success = result.success;
            record_journal(
                journal_ok,
                self.journal.record_action(completed_entry(
                    phase_index,
                    &phase.name,
                    action_index,
                    &action.spec,
                    action.executor.describe(),
                    &result,
                )),
            );

            if !success {
                match action.spec.on_error {
                    OnErrorPolicy::Continue => {
                        info!(action = %action.executor.describe(), "action failed, continuing");
                    },
                    OnErrorPolicy::AbortPhase => {
                        warn!(
                            phase = %phase.name,
                            action = %action.executor.describe(),
                            "action failed, aborting phase"
                        );
                        return PhaseOutcome::Proceed;
                    },
                    OnErrorPolicy::AbortAll => return PhaseOutcome::AbortAll,
                }
            }
        }
        PhaseOutcome::Proceed
    }

    async fn run_parallel(
        &self,
        phase_index: usize,
        phase: &Phase,
        phase_deadline: Option<Instant>,
        journal_ok: &Arc<AtomicBool>,
        stop: &StopSignal,
    ) -> PhaseOutcome {
        let mut tasks: JoinSet<(OnErrorPolicy, bool)> = JoinSet::new();

        for (action_index, action) in phase.actions.iter().enumerate() {
            let executor = Arc::clone(&action.executor);
            let spec = action.spec.clone();
            let journal = Arc::clone(&self.journal);
            let journal_ok = Arc::clone(journal_ok);
            let phase_name = phase.name.clone();
            let stop = stop.clone();

            tasks.spawn(async move {
                let result = run_action(Arc::clone(&executor), &spec, phase_deadline, stop).await;
                record_journal(
                    &journal_ok,
                    journal.record_action(completed_entry(
                        phase_index,
                        &phase_name,
                        action_index,
                        &spec,
                        executor.describe(),
                        &result,
                    )),
                );
                (spec.on_error, result.success)
            });
        }

        // Barrier: every task finishes before the phase reports anything.
        let mut abort_all = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((policy, success)) => {
                    if !success && policy == OnErrorPolicy::AbortAll {
                        abort_all = true;
                    }
                },
                Err(e) => {
                    error!(error = %e, "parallel action task panicked");
                },
            }
        }

        if abort_all {
            PhaseOutcome::AbortAll
        } else {
            PhaseOutcome::Proceed
        }
    }

    async fn notify(&self, event: &str, data: serde_json::Value) {
        if let Err(e) = self.notifier.notify(event, data).await {
            warn!(event, error = %e, "notification failed");
        }
    }
}

/// Runs one action to a terminal result: deadline, optional retry,
/// optional healthcheck. A healthcheck mismatch downgrades an otherwise
/// successful run to a failure.
async fn run_action(
    executor: Arc<dyn Executor>,
    spec: &ActionSpec,
    outer_deadline: Option<Instant>,
    mut stop: StopSignal,
) -> ActionResult {
    let mut action_deadline = Instant::now() + spec.timeout;
    if let Some(limit) = outer_deadline {
        action_deadline = action_deadline.min(limit);
    }

    debug!(action = %executor.describe(), "executing action");
    let mut result = run_with_retry(
        executor.as_ref(),
        spec.retry.as_ref(),
        action_deadline,
        &mut stop,
    )
    .await;

    if result.success {
        // Executors without a configured check pass immediately;
        // guest-control verifies its matches stopped. The verification
        // keeps a short grace even when the action consumed its budget.
        let hc_deadline = action_deadline.max(Instant::now() + Duration::from_secs(10));
        if !executor.healthcheck(hc_deadline).await {
            result.success = false;
            result.error = Some("healthcheck failed".to_string());
        }
    }

    if result.success {
        info!(action = %executor.describe(), duration = ?result.duration, "action completed");
    } else {
        warn!(
            action = %executor.describe(),
            error = result.error.as_deref().unwrap_or("unknown"),
            "action failed"
        );
    }
    result
}

fn completed_entry(
    phase_index: usize,
    phase_name: &str,
    action_index: usize,
    spec: &ActionSpec,
    description: String,
    result: &ActionResult,
) -> CompletedAction {
    let mut output = result.output.clone();
    if output.len() > MAX_RECORDED_OUTPUT {
        let mut cut = MAX_RECORDED_OUTPUT;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
    }
    CompletedAction {
        phase_index,
        phase_name: phase_name.to_string(),
        action_index,
        action_type: spec.kind.to_string(),
        description,
        action_spec: spec.clone(),
        completed_at: Utc::now(),
        success: result.success,
        retries: result.retries,
        output,
        error: result.error.clone().unwrap_or_default(),
    }
}

fn nested_deadline(outer: Option<Instant>, timeout: Option<Duration>) -> Option<Instant> {
    let inner = timeout.map(|t| Instant::now() + t);
    match (outer, inner) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (one, other) => one.or(other),
    }
}

fn record_journal(journal_ok: &Arc<AtomicBool>, result: Result<(), JournalError>) {
    if let Err(e) = result {
        error!(error = %e, "journal write failed, continuing in memory");
        journal_ok.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_deadline_takes_minimum() {
        let now = Instant::now();
        let outer = now + Duration::from_secs(10);
        let nested = nested_deadline(Some(outer), Some(Duration::from_secs(60)));
        assert_eq!(nested, Some(outer));

        let nested = nested_deadline(Some(outer), Some(Duration::from_secs(1)));
        assert!(nested.unwrap() < outer);

        assert_eq!(nested_deadline(None, None), None);
        assert_eq!(nested_deadline(Some(outer), None), Some(outer));
    }
}
