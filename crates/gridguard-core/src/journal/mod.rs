//! Persistent action journal.
//!
//! The journal is the source of truth for crash-consistent recovery: every
//! session mutation ends with a full atomic rewrite of the state file, so
//! a host that loses power mid-sequence can reconstruct exactly which
//! actions completed and replay their recovery commands in reverse.
//!
//! Only the orchestrator writes. A reader-writer lock protects the
//! in-memory state and snapshots are handed out by value.

mod fs;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use fs::{JournalFsError, MAX_JOURNAL_SIZE};

use crate::action::ActionSpec;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No session in flight.
    #[default]
    Idle,
    /// A shutdown plan is executing.
    InProgress,
    /// The plan ran to the end (individual actions may still have failed).
    Completed,
    /// The plan aborted, or a completed plan could not be journalled.
    Failed,
    /// A recovery pass is replaying completed actions.
    Recovering,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Recovering => write!(f, "recovering"),
        }
    }
}

/// One action that reached a terminal outcome.
///
/// The full [`ActionSpec`] is embedded verbatim so that recovery can
/// rebuild the executor without any external lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedAction {
    /// Index of the phase in the plan.
    pub phase_index: usize,
    /// Name of the phase.
    pub phase_name: String,
    /// Index of the action within the phase.
    pub action_index: usize,
    /// Action kind, as a stable string.
    pub action_type: String,
    /// Short human-readable description.
    pub description: String,
    /// The embedded action specification.
    pub action_spec: ActionSpec,
    /// When the action reached its terminal outcome.
    pub completed_at: DateTime<Utc>,
    /// Whether the action succeeded.
    pub success: bool,
    /// Number of retries the action consumed.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    /// Truncated captured output.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    /// Failure description, when `success` is false.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[allow(clippy::trivially_copy_pass_by_ref)] // serde's skip predicate signature
fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Serialized session state: the journal's on-disk document.
///
/// Unknown top-level fields are tolerated on load so that newer builds
/// can extend the format without breaking older readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Monotonic session id (nanosecond timestamp), empty when idle.
    #[serde(default)]
    pub session_id: String,
    /// Session start time.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: SessionStatus,
    /// Human-readable description of the triggering event.
    #[serde(default)]
    pub trigger_event: String,
    /// Index of the phase currently executing.
    #[serde(default)]
    pub current_phase: usize,
    /// Index of the action currently executing within the phase.
    #[serde(default)]
    pub current_action: usize,
    /// Actions in the order they reached a terminal outcome.
    #[serde(default)]
    pub completed_actions: Vec<CompletedAction>,
    /// Time of the last mutation.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// Last recorded error, empty when none.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

impl SessionState {
    /// True when this state demands a recovery pass: the session was
    /// interrupted mid-flight or ended in failure.
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        matches!(self.status, SessionStatus::InProgress | SessionStatus::Failed)
    }
}

/// Errors from journal operations.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The state file could not be read or written.
    #[error(transparent)]
    Fs(#[from] JournalFsError),
}

/// The persistent action journal.
///
/// All mutators persist before returning; there are no partial updates.
pub struct Journal {
    path: PathBuf,
    state: RwLock<SessionState>,
}

impl Journal {
    /// Creates a journal backed by `path`. Nothing is read or written
    /// until [`load`](Self::load) or the first mutation.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(SessionState::default()),
        }
    }

    /// Path of the backing state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads state from disk. A missing file yields the idle state.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the file exists but cannot be read
    /// or parsed.
    pub fn load(&self) -> Result<(), JournalError> {
        let loaded: Option<SessionState> = fs::read_json(&self.path)?;
        *self.write_lock() = loaded.unwrap_or_default();
        Ok(())
    }

    /// Opens a fresh session and persists it.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the initial save fails.
    pub fn start_session(&self, trigger: &str) -> Result<String, JournalError> {
        let now = Utc::now();
        let session_id = now.timestamp_nanos_opt().unwrap_or_default().to_string();
        let state = SessionState {
            session_id: session_id.clone(),
            started_at: Some(now),
            status: SessionStatus::InProgress,
            trigger_event: trigger.to_string(),
            current_phase: 0,
            current_action: 0,
            completed_actions: Vec::new(),
            last_updated: Some(now),
            last_error: String::new(),
        };
        {
            let mut guard = self.write_lock();
            *guard = state;
            self.save(&guard)?;
        }
        Ok(session_id)
    }

    /// Updates the current phase/action cursor and persists.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the save fails; the in-memory update
    /// sticks regardless.
    pub fn update_progress(&self, phase: usize, action: usize) -> Result<(), JournalError> {
        let mut guard = self.write_lock();
        guard.current_phase = phase;
        guard.current_action = action;
        guard.last_updated = Some(Utc::now());
        self.save(&guard)
    }

    /// Appends a completed action and persists. Entries are never
    /// reordered or mutated once appended.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the save fails; the in-memory append
    /// sticks regardless.
    pub fn record_action(&self, action: CompletedAction) -> Result<(), JournalError> {
        let mut guard = self.write_lock();
        guard.completed_actions.push(action);
        guard.last_updated = Some(Utc::now());
        self.save(&guard)
    }

    /// Sets the session status and persists.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the save fails.
    pub fn set_status(&self, status: SessionStatus) -> Result<(), JournalError> {
        let mut guard = self.write_lock();
        guard.status = status;
        guard.last_updated = Some(Utc::now());
        self.save(&guard)
    }

    /// Records the last error string and persists.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the save fails.
    pub fn set_error(&self, error: &str) -> Result<(), JournalError> {
        let mut guard = self.write_lock();
        guard.last_error = error.to_string();
        guard.last_updated = Some(Utc::now());
        self.save(&guard)
    }

    /// Resets the journal to the idle state and persists.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the save fails.
    pub fn clear(&self) -> Result<(), JournalError> {
        let mut guard = self.write_lock();
        *guard = SessionState {
            last_updated: Some(Utc::now()),
            ..SessionState::default()
        };
        self.save(&guard)
    }

    /// Returns a copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.read_lock().clone()
    }

    /// True when the journalled session demands a recovery pass.
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.read_lock().needs_recovery()
    }

    /// Completed actions eligible for recovery: successful, carrying a
    /// non-empty recovery command, in reverse-append order.
    #[must_use]
    pub fn actions_for_recovery(&self) -> Vec<CompletedAction> {
        let guard = self.read_lock();
        guard
            .completed_actions
            .iter()
            .rev()
            .filter(|a| a.success && a.action_spec.has_recovery())
            .cloned()
            .collect()
    }

    fn save(&self, state: &SessionState) -> Result<(), JournalError> {
        fs::atomic_write_json(&self.path, state)?;
        Ok(())
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
