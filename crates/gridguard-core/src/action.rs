//! Action specifications.
//!
//! An [`ActionSpec`] is the serializable description of one unit of work in
//! a shutdown plan. It carries everything needed to rebuild the executor
//! after a restart, so journal entries embed it verbatim.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::virt::Selector;

/// Default per-action deadline.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);

/// The closed set of action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Run a command on the local host via `/bin/sh -c`.
    #[serde(rename = "local-command")]
    LocalCommand,

    /// Run a command on a remote host over SSH.
    #[serde(rename = "remote-shell")]
    RemoteShell,

    /// Run a command inside a guest via the virtualization API.
    #[serde(rename = "guest-exec")]
    GuestExec,

    /// Shut down or stop a set of guests resolved by a selector.
    #[serde(rename = "guest-control")]
    GuestControl,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCommand => write!(f, "local-command"),
            Self::RemoteShell => write!(f, "remote-shell"),
            Self::GuestExec => write!(f, "guest-exec"),
            Self::GuestControl => write!(f, "guest-control"),
        }
    }
}

/// What to do with the rest of the plan when an action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    /// Move on to the next action in the phase.
    #[default]
    Continue,

    /// Skip the remaining actions in this phase; later phases still run.
    AbortPhase,

    /// Cease all further phases and mark the session failed.
    AbortAll,
}

/// Backoff mode between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// The configured delay between every attempt.
    #[default]
    Linear,

    /// The delay doubles after each attempt.
    Exponential,
}

/// Retry policy for a failing action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Delay before the second attempt.
    #[serde(default = "default_retry_delay")]
    #[serde(with = "humantime_serde")]
    pub delay: Duration,

    /// Backoff mode.
    #[serde(default)]
    pub backoff: Backoff,
}

const fn default_attempts() -> u32 {
    3
}

const fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay: default_retry_delay(),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given 1-based attempt number failed.
    #[must_use]
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Linear => self.delay,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(16);
                self.delay.saturating_mul(1u32 << shift)
            },
        }
    }
}

/// Expected outcome of a healthcheck command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthExpect {
    /// The verification command must exit zero.
    #[default]
    Success,

    /// The verification command must exit non-zero.
    Failure,
}

/// Post-action verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    /// Verification command, run through the action's own transport.
    pub command: String,

    /// Expected outcome of the verification command.
    #[serde(default)]
    pub expect: HealthExpect,
}

/// Control verb for guest-control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlVerb {
    /// Graceful guest shutdown (ACPI / init).
    Shutdown,

    /// Hard stop.
    Stop,
}

impl fmt::Display for ControlVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutdown"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// Serializable description of one action, sufficient to rebuild its
/// executor after a restart.
///
/// Which fields are meaningful depends on [`kind`](Self::kind):
/// `local-command` needs only `command`; `remote-shell` adds `host`, `user`
/// and optionally `key_file`; `guest-exec` needs `guest` and `command`;
/// `guest-control` needs `selector` and `verb`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Action kind.
    pub kind: ActionKind,

    /// Remote host (`host` or `host:port`), for `remote-shell`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Remote user, for `remote-shell`. Defaults to `root`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// SSH private key path, for `remote-shell`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,

    /// Guest reference (`vm:100`, `ct:web01`), for `guest-exec`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<String>,

    /// Guest selector, for `guest-control`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,

    /// Primary command, for the command-carrying kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Control verb, for `guest-control`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<ControlVerb>,

    /// Recovery command (or verb counterpart), replayed when power returns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<String>,

    /// Per-action deadline.
    #[serde(default = "default_action_timeout")]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Failure escalation policy.
    #[serde(default)]
    pub on_error: OnErrorPolicy,

    /// Optional retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Optional post-action verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
}

const fn default_action_timeout() -> Duration {
    DEFAULT_ACTION_TIMEOUT
}

impl ActionSpec {
    /// A minimal local-command spec. Other fields take their defaults.
    #[must_use]
    pub fn local(command: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::LocalCommand,
            host: None,
            user: None,
            key_file: None,
            guest: None,
            selector: None,
            command: Some(command.into()),
            verb: None,
            recovery: None,
            timeout: DEFAULT_ACTION_TIMEOUT,
            on_error: OnErrorPolicy::default(),
            retry: None,
            healthcheck: None,
        }
    }

    /// True when the spec carries a non-empty recovery command.
    #[must_use]
    pub fn has_recovery(&self) -> bool {
        self.recovery.as_deref().is_some_and(|r| !r.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_round_trip() {
        for kind in [
            ActionKind::LocalCommand,
            ActionKind::RemoteShell,
            ActionKind::GuestExec,
            ActionKind::GuestControl,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let back: ActionKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
            assert_eq!(json.trim_matches('"'), kind.to_string());
        }
    }

    #[test]
    fn test_spec_round_trip() {
        let mut spec = ActionSpec::local("systemctl stop media");
        spec.recovery = Some("systemctl start media".to_string());
        spec.retry = Some(RetryPolicy {
            attempts: 5,
            delay: Duration::from_millis(250),
            backoff: Backoff::Exponential,
        });
        spec.healthcheck = Some(Healthcheck {
            command: "systemctl is-active media".to_string(),
            expect: HealthExpect::Failure,
        });

        let json = serde_json::to_string(&spec).unwrap();
        let back: ActionSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_spec_defaults_on_load() {
        let spec: ActionSpec =
            serde_json::from_str(r#"{"kind":"local-command","command":"true"}"#).unwrap();
        assert_eq!(spec.timeout, DEFAULT_ACTION_TIMEOUT);
        assert_eq!(spec.on_error, OnErrorPolicy::Continue);
        assert!(spec.retry.is_none());
        assert!(!spec.has_recovery());
    }

    #[test]
    fn test_linear_backoff_is_constant() {
        let policy = RetryPolicy {
            attempts: 4,
            delay: Duration::from_millis(10),
            backoff: Backoff::Linear,
        };
        for attempt in 1..=4 {
            assert_eq!(policy.delay_after_attempt(attempt), Duration::from_millis(10));
        }
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let policy = RetryPolicy {
            attempts: 4,
            delay: Duration::from_secs(1),
            backoff: Backoff::Exponential,
        };
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_empty_recovery_is_not_recoverable() {
        let mut spec = ActionSpec::local("true");
        spec.recovery = Some(String::new());
        assert!(!spec.has_recovery());
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
