//! Executor reconstruction from action specifications.
//!
//! The factory is keyed on [`ActionKind`] and is the single place that
//! turns a serializable [`ActionSpec`] into a live executor, both when a
//! plan is resolved from configuration and when recovery rebuilds
//! executors out of journal entries. Live API handles are never
//! serialized; guest kinds need a [`VirtClient`] supplied up front.

use std::sync::Arc;

use super::{
    Executor, GuestControlExecutor, GuestExecExecutor, LocalExecutor, RemoteShellExecutor,
};
use crate::action::{ActionKind, ActionSpec, ControlVerb};
use crate::virt::{GuestRef, VirtClient, VirtError};

/// Builds executors from action specifications.
#[derive(Clone, Default)]
pub struct ExecutorFactory {
    virt: Option<Arc<dyn VirtClient>>,
}

impl ExecutorFactory {
    /// A factory without a virtualization client; guest kinds will fail
    /// to build.
    #[must_use]
    pub fn new() -> Self {
        Self { virt: None }
    }

    /// A factory with a virtualization client for the guest kinds.
    #[must_use]
    pub fn with_virt(virt: Arc<dyn VirtClient>) -> Self {
        Self { virt: Some(virt) }
    }

    /// Builds the executor described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError`] when the spec is missing a required field
    /// or names a guest kind while no virtualization client is available.
    pub fn build(&self, spec: &ActionSpec) -> Result<Arc<dyn Executor>, FactoryError> {
        match spec.kind {
            ActionKind::LocalCommand => {
                let command = require(spec, spec.command.as_deref(), "command")?;
                Ok(Arc::new(
                    LocalExecutor::new(command)
                        .with_recovery(spec.recovery.clone())
                        .with_healthcheck(spec.healthcheck.clone()),
                ))
            },
            ActionKind::RemoteShell => {
                let host = require(spec, spec.host.as_deref(), "host")?;
                let command = require(spec, spec.command.as_deref(), "command")?;
                Ok(Arc::new(
                    RemoteShellExecutor::new(host, spec.user.as_deref().unwrap_or(""), command)
                        .with_key_file(spec.key_file.clone())
                        .with_recovery(spec.recovery.clone())
                        .with_healthcheck(spec.healthcheck.clone()),
                ))
            },
            ActionKind::GuestExec => {
                let virt = self.require_virt(spec)?;
                let raw = require(spec, spec.guest.as_deref(), "guest")?;
                let guest = GuestRef::parse(raw)?;
                let command = require(spec, spec.command.as_deref(), "command")?;
                Ok(Arc::new(
                    GuestExecExecutor::new(guest, command, virt)
                        .with_recovery(spec.recovery.clone())
                        .with_healthcheck(spec.healthcheck.clone()),
                ))
            },
            ActionKind::GuestControl => {
                let virt = self.require_virt(spec)?;
                let selector = spec
                    .selector
                    .clone()
                    .ok_or_else(|| FactoryError::MissingField {
                        kind: spec.kind,
                        field: "selector",
                    })?;
                let verb = spec.verb.unwrap_or(ControlVerb::Shutdown);
                Ok(Arc::new(GuestControlExecutor::new(
                    selector,
                    verb,
                    spec.timeout,
                    virt,
                )))
            },
        }
    }

    fn require_virt(&self, spec: &ActionSpec) -> Result<Arc<dyn VirtClient>, FactoryError> {
        self.virt
            .clone()
            .ok_or(FactoryError::VirtUnavailable { kind: spec.kind })
    }
}

fn require<'a>(
    spec: &ActionSpec,
    value: Option<&'a str>,
    field: &'static str,
) -> Result<&'a str, FactoryError> {
    value.filter(|v| !v.is_empty()).ok_or(FactoryError::MissingField {
        kind: spec.kind,
        field,
    })
}

/// Errors from executor reconstruction.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    /// The spec is missing a field its kind requires.
    #[error("{kind} action is missing required field '{field}'")]
    MissingField {
        /// Kind of the offending spec.
        kind: ActionKind,
        /// Name of the missing field.
        field: &'static str,
    },

    /// A guest kind was requested without a live virtualization client;
    /// the action cannot be replayed automatically.
    #[error("{kind} action requires a virtualization API connection - manual recovery needed")]
    VirtUnavailable {
        /// Kind of the offending spec.
        kind: ActionKind,
    },

    /// The guest reference did not parse.
    #[error(transparent)]
    BadGuest(#[from] VirtError),
}
