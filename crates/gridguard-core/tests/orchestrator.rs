//! End-to-end orchestrator scenarios against real `/bin/sh` actions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gridguard_core::executor::ExecutorFactory;
use gridguard_core::journal::{Journal, SessionStatus};
use gridguard_core::orchestrator::{Notifier, NotifyError, Orchestrator};
use gridguard_core::plan::{ExecMode, PhaseSpec, Plan};
use gridguard_core::stop::StopSignal;
use gridguard_core::{ActionSpec, Backoff, OnErrorPolicy, RetryPolicy};

/// Notifier that records event names in dispatch order.
#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &str, _data: serde_json::Value) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push(event.to_string());
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    journal: Arc<Journal>,
    notifier: Arc<RecordingNotifier>,
    orchestrator: Orchestrator,
}

fn harness(phases: Vec<PhaseSpec>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let journal = Arc::new(Journal::new(dir.path().join("state.json")));
    let notifier = Arc::new(RecordingNotifier::default());
    let plan = Plan::resolve(&phases, &ExecutorFactory::new()).unwrap();
    let orchestrator = Orchestrator::new(
        plan,
        Arc::clone(&journal),
        Arc::clone(&notifier) as Arc<dyn Notifier>,
    );
    Harness {
        _dir: dir,
        journal,
        notifier,
        orchestrator,
    }
}

fn local(command: &str) -> ActionSpec {
    let mut spec = ActionSpec::local(command);
    spec.timeout = Duration::from_secs(10);
    spec
}

fn sequential(name: &str, actions: Vec<ActionSpec>) -> PhaseSpec {
    PhaseSpec {
        name: name.to_string(),
        mode: ExecMode::Sequential,
        timeout: None,
        actions,
    }
}

fn parallel(name: &str, actions: Vec<ActionSpec>) -> PhaseSpec {
    PhaseSpec {
        name: name.to_string(),
        mode: ExecMode::Parallel,
        timeout: None,
        actions,
    }
}

#[tokio::test]
async fn happy_path_sequential() {
    let h = harness(vec![sequential(
        "p1",
        vec![local("echo a"), local("echo b")],
    )]);

    let summary = h
        .orchestrator
        .execute("test trigger", None, StopSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.status, SessionStatus::Completed);
    assert_eq!(summary.actions_run, 2);
    assert_eq!(summary.actions_failed, 0);

    let state = h.journal.snapshot();
    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.trigger_event, "test trigger");
    assert_eq!(state.completed_actions.len(), 2);
    assert_eq!(state.completed_actions[0].action_index, 0);
    assert_eq!(state.completed_actions[0].output, "a\n");
    assert_eq!(state.completed_actions[1].action_index, 1);
    assert_eq!(state.completed_actions[1].output, "b\n");
    assert!(state.completed_actions.iter().all(|a| a.success));
}

#[tokio::test]
async fn parallel_partial_failure_continues() {
    let h = harness(vec![parallel("p1", vec![local("exit 1"), local("echo ok")])]);

    let summary = h
        .orchestrator
        .execute("test", None, StopSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.status, SessionStatus::Completed);
    let state = h.journal.snapshot();
    assert_eq!(state.completed_actions.len(), 2);
    let failures = state.completed_actions.iter().filter(|a| !a.success).count();
    assert_eq!(failures, 1);
    // Append order is unspecified in a parallel phase, but indices carry
    // declaration order.
    let mut indices: Vec<_> = state.completed_actions.iter().map(|a| a.action_index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1]);
}

#[tokio::test]
async fn retry_recovers_and_counts_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("attempts");
    // Fails twice, succeeds on the third attempt.
    let command = format!(
        "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; [ $n -ge 3 ]",
        c = counter.display()
    );
    let mut spec = local(&command);
    spec.retry = Some(RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(10),
        backoff: Backoff::Linear,
    });

    let h = harness(vec![sequential("p1", vec![spec])]);
    let summary = h
        .orchestrator
        .execute("test", None, StopSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.status, SessionStatus::Completed);
    let state = h.journal.snapshot();
    assert_eq!(state.completed_actions.len(), 1, "one entry per action, not per attempt");
    let entry = &state.completed_actions[0];
    assert!(entry.success);
    assert_eq!(entry.retries, 2);
}

#[tokio::test]
async fn timeout_is_reported_as_deadline_failure() {
    let mut spec = local("sleep 10");
    spec.timeout = Duration::from_millis(100);
    let h = harness(vec![sequential("p1", vec![spec])]);

    let summary = h
        .orchestrator
        .execute("test", None, StopSignal::never())
        .await
        .unwrap();

    // Default policy continues, so the session still completes.
    assert_eq!(summary.status, SessionStatus::Completed);
    let state = h.journal.snapshot();
    assert_eq!(state.completed_actions.len(), 1);
    let entry = &state.completed_actions[0];
    assert!(!entry.success);
    assert!(entry.error.contains("timed out"), "error was: {}", entry.error);
}

#[tokio::test]
async fn abort_phase_skips_rest_of_phase_only() {
    let mut failing = local("exit 1");
    failing.on_error = OnErrorPolicy::AbortPhase;
    let h = harness(vec![
        sequential("p1", vec![failing, local("echo skipped")]),
        sequential("p2", vec![local("echo ran")]),
    ]);

    let summary = h
        .orchestrator
        .execute("test", None, StopSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.status, SessionStatus::Completed);
    let state = h.journal.snapshot();
    assert_eq!(state.completed_actions.len(), 2);
    assert_eq!(state.completed_actions[0].phase_index, 0);
    assert_eq!(state.completed_actions[1].phase_index, 1);
    assert_eq!(state.completed_actions[1].output, "ran\n");
}

#[tokio::test]
async fn abort_all_fails_session_and_stops_phases() {
    let mut failing = local("exit 1");
    failing.on_error = OnErrorPolicy::AbortAll;
    let h = harness(vec![
        sequential("p1", vec![failing, local("echo never")]),
        sequential("p2", vec![local("echo never")]),
    ]);

    let summary = h
        .orchestrator
        .execute("test", None, StopSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.status, SessionStatus::Failed);
    let state = h.journal.snapshot();
    assert_eq!(state.status, SessionStatus::Failed);
    assert_eq!(state.completed_actions.len(), 1);
    assert!(!state.last_error.is_empty());
    assert!(state.needs_recovery());
}

#[tokio::test]
async fn healthcheck_mismatch_fails_action() {
    let mut spec = local("true");
    spec.healthcheck = Some(gridguard_core::Healthcheck {
        command: "false".to_string(),
        expect: gridguard_core::action::HealthExpect::Success,
    });
    let h = harness(vec![sequential("p1", vec![spec])]);

    let summary = h
        .orchestrator
        .execute("test", None, StopSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.actions_failed, 1);
    let state = h.journal.snapshot();
    assert!(state.completed_actions[0].error.contains("healthcheck"));
}

#[tokio::test]
async fn lifecycle_notifications_are_ordered() {
    let h = harness(vec![
        sequential("p1", vec![local("true")]),
        parallel("p2", vec![local("true")]),
    ]);

    h.orchestrator
        .execute("test", None, StopSignal::never())
        .await
        .unwrap();

    let events = h.notifier.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "shutdown_start",
            "phase_start",
            "phase_complete",
            "phase_start",
            "phase_complete",
            "shutdown_complete",
        ]
    );
}

#[tokio::test]
async fn sequential_entries_in_declaration_order() {
    let h = harness(vec![sequential(
        "p1",
        vec![local("echo 0"), local("echo 1"), local("echo 2")],
    )]);

    h.orchestrator
        .execute("test", None, StopSignal::never())
        .await
        .unwrap();

    let state = h.journal.snapshot();
    let indices: Vec<_> = state.completed_actions.iter().map(|a| a.action_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn journal_survives_restart_mid_session() {
    // Simulate a crash by reloading the state file with a fresh journal
    // while the session is still in progress on disk.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    {
        let journal = Arc::new(Journal::new(&path));
        let plan = Plan::resolve(
            &[sequential("p1", vec![local("echo a")])],
            &ExecutorFactory::new(),
        )
        .unwrap();
        let orchestrator = Orchestrator::new(
            plan,
            Arc::clone(&journal),
            Arc::new(RecordingNotifier::default()) as _,
        );
        orchestrator
            .execute("test", None, StopSignal::never())
            .await
            .unwrap();
        // Force the on-disk state back to in_progress, as a crash between
        // the last append and the terminal status write would leave it.
        journal.set_status(SessionStatus::InProgress).unwrap();
    }

    let reloaded = Journal::new(&path);
    reloaded.load().unwrap();
    assert!(reloaded.needs_recovery());
    assert_eq!(reloaded.snapshot().completed_actions.len(), 1);
}
