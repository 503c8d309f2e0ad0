//! Operator configuration.
//!
//! The config file is YAML. Structural problems are rejected at load time;
//! nothing invalid ever reaches the core. Durations are humantime strings
//! (`90s`, `2m`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use gridguard_core::action::{ActionKind, ActionSpec, ControlVerb, Healthcheck, OnErrorPolicy, RetryPolicy};
use gridguard_core::monitor::Thresholds;
use gridguard_core::plan::{ExecMode, PhaseSpec};
use gridguard_core::recovery::{RecoveryConfig, RecoveryErrorPolicy};
use gridguard_core::virt::{GuestRef, Selector};
use secrecy::SecretString;
use serde::Deserialize;

/// Default NUT port.
pub const DEFAULT_NUT_PORT: u16 = 3493;

/// Configuration errors. All of them refuse startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading config file {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The YAML did not parse.
    #[error("parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The config parsed but is semantically invalid.
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UPS endpoint and thresholds.
    pub ups: UpsSection,

    /// Virtualization API endpoint; required when guest actions exist.
    #[serde(default)]
    pub virt: Option<VirtSection>,

    /// The shutdown plan.
    pub phases: Vec<PhaseSection>,

    /// Recovery behavior.
    #[serde(default)]
    pub recovery: RecoverySection,

    /// Webhook notification targets.
    #[serde(default)]
    pub notifications: Vec<WebhookSection>,

    /// Global options.
    #[serde(default)]
    pub options: OptionsSection,
}

/// UPS connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpsSection {
    /// NUT server, `host` or `host:port` (default port 3493).
    pub host: String,

    /// UPS unit name on the NUT server.
    pub name: String,

    /// Battery thresholds in percent.
    #[serde(default)]
    pub thresholds: ThresholdsSection,
}

/// Battery threshold levels.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdsSection {
    /// Notify at this level.
    #[serde(default = "default_warning")]
    pub warning: u8,
    /// Start the shutdown plan at this level.
    #[serde(default = "default_critical")]
    pub critical: u8,
    /// Force immediate shutdown at this level.
    #[serde(default = "default_emergency")]
    pub emergency: u8,
}

const fn default_warning() -> u8 {
    30
}

const fn default_critical() -> u8 {
    20
}

const fn default_emergency() -> u8 {
    10
}

impl Default for ThresholdsSection {
    fn default() -> Self {
        Self {
            warning: default_warning(),
            critical: default_critical(),
            emergency: default_emergency(),
        }
    }
}

/// Virtualization API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtSection {
    /// Base API URL, e.g. `https://pve.lan:8006/api2/json`.
    pub api_url: String,

    /// API token id (`user@realm!name`).
    pub token_id: String,

    /// API token secret. Debug output keeps it redacted.
    #[serde(default)]
    pub token_secret: Option<SecretString>,

    /// Environment variable to read the token secret from instead.
    #[serde(default)]
    pub token_secret_env: Option<String>,

    /// Skip TLS verification (self-signed clusters).
    #[serde(default)]
    pub insecure_tls: bool,
}

/// One phase of the plan.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseSection {
    /// Phase name.
    pub name: String,

    /// Run actions concurrently instead of in order.
    #[serde(default)]
    pub parallel: bool,

    /// Optional phase-wide deadline.
    #[serde(default, with = "humantime_opt")]
    pub timeout: Option<Duration>,

    /// Ordered actions.
    pub actions: Vec<ActionSection>,
}

/// One action of a phase.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionSection {
    /// Action kind.
    #[serde(rename = "type")]
    pub kind: ActionKind,

    /// Remote host, for `remote-shell`.
    #[serde(default)]
    pub host: Option<String>,

    /// Remote user, for `remote-shell`.
    #[serde(default)]
    pub user: Option<String>,

    /// SSH key path, for `remote-shell`.
    #[serde(default)]
    pub key_file: Option<String>,

    /// Guest reference, for `guest-exec`.
    #[serde(default)]
    pub guest: Option<String>,

    /// Guest selector, for `guest-control`.
    #[serde(default)]
    pub selector: Option<Selector>,

    /// Primary command.
    #[serde(default)]
    pub command: Option<String>,

    /// Control verb, for `guest-control`.
    #[serde(default, alias = "action")]
    pub verb: Option<ControlVerb>,

    /// Recovery command.
    #[serde(default)]
    pub recovery: Option<String>,

    /// Post-action verification.
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,

    /// Per-action deadline.
    #[serde(default, with = "humantime_opt")]
    pub timeout: Option<Duration>,

    /// Failure escalation policy.
    #[serde(default)]
    pub on_error: OnErrorPolicy,

    /// Retry policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Recovery behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoverySection {
    /// Replay recovery commands when power returns.
    #[serde(default)]
    pub enabled: bool,

    /// Debounce delay before recovery starts.
    #[serde(default = "default_power_stable_delay", with = "humantime_serde")]
    pub power_stable_delay: Duration,

    /// Per-failure handling: `notify` or `ignore`. Anything else falls
    /// back to continuing silently.
    #[serde(default)]
    pub on_error: Option<String>,
}

const fn default_power_stable_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            enabled: false,
            power_stable_delay: default_power_stable_delay(),
            on_error: None,
        }
    }
}

/// One webhook target.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookSection {
    /// Target URL.
    #[serde(default)]
    pub url: Option<String>,

    /// Environment variable holding the URL instead.
    #[serde(default)]
    pub url_env: Option<String>,

    /// Events to forward; empty or `*` means all.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Global options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptionsSection {
    /// Log the resolved plan instead of executing it.
    #[serde(default)]
    pub dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Journal path.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Lock file path.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// UPS sampling period.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/gridguard/state.json")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/run/gridguard.lock")
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for OptionsSection {
    fn default() -> Self {
        Self {
            dry_run: false,
            log_level: default_log_level(),
            state_file: default_state_file(),
            lock_file: default_lock_file(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Config {
    /// Loads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on I/O, parse, or validation failure.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the parsed document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ups.host.is_empty() {
            return Err(invalid("ups.host is required"));
        }
        if self.ups.name.is_empty() {
            return Err(invalid("ups.name is required"));
        }
        self.thresholds()?;

        if self.phases.is_empty() {
            return Err(invalid("at least one phase is required"));
        }
        let mut needs_virt = false;
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.name.is_empty() {
                return Err(invalid(format!("phase {}: name is required", i + 1)));
            }
            if phase.actions.is_empty() {
                return Err(invalid(format!(
                    "phase '{}': at least one action is required",
                    phase.name
                )));
            }
            for (j, action) in phase.actions.iter().enumerate() {
                validate_action(action)
                    .map_err(|e| invalid(format!("phase '{}', action {}: {e}", phase.name, j + 1)))?;
                needs_virt |= matches!(action.kind, ActionKind::GuestExec | ActionKind::GuestControl);
            }
        }

        if needs_virt {
            let virt = self
                .virt
                .as_ref()
                .ok_or_else(|| invalid("guest actions configured but the virt section is missing"))?;
            if virt.api_url.is_empty() {
                return Err(invalid("virt.api_url is required"));
            }
            if virt.token_id.is_empty() {
                return Err(invalid("virt.token_id is required"));
            }
            if virt.token_secret.is_none() && virt.token_secret_env.is_none() {
                return Err(invalid(
                    "one of virt.token_secret or virt.token_secret_env is required",
                ));
            }
        }

        for (i, hook) in self.notifications.iter().enumerate() {
            if hook.url.is_none() && hook.url_env.is_none() {
                return Err(invalid(format!(
                    "notification {}: one of url or url_env is required",
                    i + 1
                )));
            }
        }

        Ok(())
    }

    /// Validated battery thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the ordering is violated.
    pub fn thresholds(&self) -> Result<Thresholds, ConfigError> {
        let t = self.ups.thresholds;
        Thresholds::new(t.warning, t.critical, t.emergency).map_err(|e| invalid(e.to_string()))
    }

    /// The plan as core phase specifications.
    #[must_use]
    pub fn phase_specs(&self) -> Vec<PhaseSpec> {
        self.phases
            .iter()
            .map(|phase| PhaseSpec {
                name: phase.name.clone(),
                mode: if phase.parallel {
                    ExecMode::Parallel
                } else {
                    ExecMode::Sequential
                },
                timeout: phase.timeout,
                actions: phase.actions.iter().map(ActionSection::to_spec).collect(),
            })
            .collect()
    }

    /// The recovery section as a core recovery config.
    #[must_use]
    pub fn recovery_config(&self) -> RecoveryConfig {
        let on_error = match self.recovery.on_error.as_deref() {
            Some("notify") => RecoveryErrorPolicy::Notify,
            // "ignore" and anything unrecognized continue silently.
            _ => RecoveryErrorPolicy::Ignore,
        };
        RecoveryConfig {
            enabled: self.recovery.enabled,
            power_stable_delay: self.recovery.power_stable_delay,
            on_error,
            ..RecoveryConfig::default()
        }
    }

    /// NUT endpoint as `(host, port)`.
    #[must_use]
    pub fn nut_endpoint(&self) -> (String, u16) {
        match self.ups.host.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (self.ups.host.clone(), DEFAULT_NUT_PORT),
            },
            None => (self.ups.host.clone(), DEFAULT_NUT_PORT),
        }
    }
}

impl ActionSection {
    fn to_spec(&self) -> ActionSpec {
        let mut spec = ActionSpec {
            kind: self.kind,
            host: self.host.clone(),
            user: self.user.clone(),
            key_file: self.key_file.clone(),
            guest: self.guest.clone(),
            selector: self.selector.clone(),
            command: self.command.clone(),
            verb: self.verb,
            recovery: self.recovery.clone(),
            timeout: self
                .timeout
                .unwrap_or(gridguard_core::action::DEFAULT_ACTION_TIMEOUT),
            on_error: self.on_error,
            retry: self.retry.clone(),
            healthcheck: self.healthcheck.clone(),
        };
        if spec.kind == ActionKind::GuestControl && spec.verb.is_none() {
            spec.verb = Some(ControlVerb::Shutdown);
        }
        spec
    }
}

fn validate_action(action: &ActionSection) -> Result<(), String> {
    let need = |field: Option<&str>, name: &str| -> Result<(), String> {
        field
            .filter(|v| !v.is_empty())
            .map(|_| ())
            .ok_or_else(|| format!("{} action requires {name}", action.kind))
    };

    match action.kind {
        ActionKind::LocalCommand => need(action.command.as_deref(), "command")?,
        ActionKind::RemoteShell => {
            need(action.host.as_deref(), "host")?;
            need(action.command.as_deref(), "command")?;
        },
        ActionKind::GuestExec => {
            let guest = action
                .guest
                .as_deref()
                .filter(|g| !g.is_empty())
                .ok_or_else(|| format!("{} action requires guest", action.kind))?;
            GuestRef::parse(guest).map_err(|e| e.to_string())?;
            need(action.command.as_deref(), "command")?;
        },
        ActionKind::GuestControl => {
            let selector = action
                .selector
                .as_ref()
                .ok_or_else(|| format!("{} action requires selector", action.kind))?;
            // Surface a bad regex now rather than mid-shutdown.
            selector.filter(&[]).map_err(|e| e.to_string())?;
            if action.verb.is_none() {
                return Err(format!("{} action requires action (shutdown/stop)", action.kind));
            }
            if action.healthcheck.is_some() {
                return Err(format!(
                    "{} actions have a built-in healthcheck; remove the explicit one",
                    action.kind
                ));
            }
        },
    }

    if let Some(retry) = &action.retry {
        if retry.attempts == 0 {
            return Err("retry.attempts must be at least 1".to_string());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
ups:
  host: nut.lan
  name: rack-ups
phases:
  - name: services
    actions:
      - type: local-command
        command: systemctl stop media
"#;

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.ups.thresholds.warning, 30);
        assert_eq!(config.options.poll_interval, Duration::from_secs(5));
        assert!(!config.recovery.enabled);
        assert_eq!(config.nut_endpoint(), ("nut.lan".to_string(), 3493));

        let specs = config.phase_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].mode, ExecMode::Sequential);
        assert_eq!(specs[0].actions[0].timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
ups:
  host: nut.lan:13493
  name: rack-ups
  thresholds:
    warning: 40
    critical: 25
    emergency: 10
virt:
  api_url: https://pve.lan:8006/api2/json
  token_id: guardian@pve!shutdown
  token_secret_env: PVE_TOKEN
  insecure_tls: true
phases:
  - name: guests
    parallel: true
    timeout: 5m
    actions:
      - type: guest-control
        action: shutdown
        selector:
          kind: vm
          exclude_tags: [keep-up]
        timeout: 2m
  - name: hosts
    actions:
      - type: remote-shell
        host: nas.lan
        user: admin
        key_file: /etc/gridguard/id_ed25519
        command: poweroff
        recovery: wakeonlan 00:11:22:33:44:55
        retry:
          attempts: 2
          delay: 10s
          backoff: exponential
recovery:
  enabled: true
  power_stable_delay: 2m
  on_error: ignore
notifications:
  - url_env: DISCORD_WEBHOOK
    events: [shutdown_start, shutdown_complete]
options:
  dry_run: true
  log_level: debug
  state_file: /tmp/gridguard-state.json
  poll_interval: 10s
"#;
        let config = parse(yaml).unwrap();
        assert_eq!(config.nut_endpoint(), ("nut.lan".to_string(), 13493));
        assert_eq!(config.thresholds().unwrap().critical(), 25);

        let specs = config.phase_specs();
        assert_eq!(specs[0].mode, ExecMode::Parallel);
        assert_eq!(specs[0].timeout, Some(Duration::from_secs(300)));
        assert_eq!(specs[0].actions[0].verb, Some(ControlVerb::Shutdown));
        assert_eq!(specs[1].actions[0].retry.as_ref().unwrap().attempts, 2);

        let recovery = config.recovery_config();
        assert!(recovery.enabled);
        assert_eq!(recovery.power_stable_delay, Duration::from_secs(120));
        assert_eq!(recovery.on_error, RecoveryErrorPolicy::Ignore);
    }

    #[test]
    fn test_recovery_on_error_mapping() {
        let with_on_error = |value: &str| {
            format!(
                "{MINIMAL}recovery:\n  enabled: true\n  on_error: {value}\n"
            )
        };

        let notify = parse(&with_on_error("notify")).unwrap();
        assert_eq!(notify.recovery_config().on_error, RecoveryErrorPolicy::Notify);

        let ignore = parse(&with_on_error("ignore")).unwrap();
        assert_eq!(ignore.recovery_config().on_error, RecoveryErrorPolicy::Ignore);

        // Unrecognized values continue silently, like "ignore".
        let other = parse(&with_on_error("retry")).unwrap();
        assert_eq!(other.recovery_config().on_error, RecoveryErrorPolicy::Ignore);

        let unset = parse(MINIMAL).unwrap();
        assert_eq!(unset.recovery_config().on_error, RecoveryErrorPolicy::Ignore);
    }

    #[test]
    fn test_phaseless_config_rejected() {
        let yaml = r#"
ups: {host: nut.lan, name: ups}
phases: []
"#;
        assert!(matches!(parse(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_threshold_ordering_rejected() {
        let yaml = r#"
ups:
  host: nut.lan
  name: ups
  thresholds: {warning: 10, critical: 20, emergency: 30}
phases:
  - name: p
    actions: [{type: local-command, command: "true"}]
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("thresholds"));
    }

    #[test]
    fn test_remote_shell_requires_host() {
        let yaml = r#"
ups: {host: nut.lan, name: ups}
phases:
  - name: p
    actions: [{type: remote-shell, command: poweroff}]
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("requires host"));
    }

    #[test]
    fn test_guest_actions_require_virt_section() {
        let yaml = r#"
ups: {host: nut.lan, name: ups}
phases:
  - name: p
    actions:
      - type: guest-control
        action: stop
        selector: {kind: container}
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("virt section"));
    }

    #[test]
    fn test_bad_selector_regex_rejected() {
        let yaml = r#"
ups: {host: nut.lan, name: ups}
virt: {api_url: "https://pve:8006", token_id: "a@b!c"}
phases:
  - name: p
    actions:
      - type: guest-control
        action: stop
        selector: {name_regex: "("}
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn test_bad_guest_ref_rejected() {
        let yaml = r#"
ups: {host: nut.lan, name: ups}
virt: {api_url: "https://pve:8006", token_id: "a@b!c"}
phases:
  - name: p
    actions:
      - type: guest-exec
        guest: "disk:100"
        command: sync
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = r#"
ups: {host: nut.lan, name: ups, tresholds: {}}
phases:
  - name: p
    actions: [{type: local-command, command: "true"}]
"#;
        assert!(matches!(parse(yaml), Err(ConfigError::Parse(_))));
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod humantime_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
