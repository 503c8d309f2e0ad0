//! Shutdown plans.
//!
//! A [`Plan`] is the ordered list of [`Phase`]s resolved from
//! configuration, with executors pre-built. It is read-only for the
//! duration of a session.

use std::sync::Arc;
use std::time::Duration;

use crate::action::ActionSpec;
use crate::executor::{Executor, ExecutorFactory, FactoryError};

/// How the actions of a phase are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Actions run one after another, in declared order.
    #[default]
    Sequential,
    /// Actions fan out concurrently and are awaited in a barrier.
    Parallel,
}

/// Description of one phase, before executors are built.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSpec {
    /// Phase name, used in journal entries and notifications.
    pub name: String,

    /// Dispatch mode.
    pub mode: ExecMode,

    /// Optional phase-wide deadline.
    pub timeout: Option<Duration>,

    /// Ordered action specifications.
    pub actions: Vec<ActionSpec>,
}

/// One action with its pre-built executor.
pub struct PlannedAction {
    /// The serializable specification (journalled verbatim).
    pub spec: ActionSpec,
    /// The live executor for this action. Not shared across actions.
    pub executor: Arc<dyn Executor>,
}

/// One resolved phase.
pub struct Phase {
    /// Phase name.
    pub name: String,
    /// Dispatch mode.
    pub mode: ExecMode,
    /// Optional phase-wide deadline.
    pub timeout: Option<Duration>,
    /// Ordered actions.
    pub actions: Vec<PlannedAction>,
}

/// The resolved shutdown plan.
pub struct Plan {
    /// Ordered phases.
    pub phases: Vec<Phase>,
}

impl Plan {
    /// Resolves phase specifications into a plan with live executors.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError`] when any action cannot be built.
    pub fn resolve(specs: &[PhaseSpec], factory: &ExecutorFactory) -> Result<Self, FactoryError> {
        let mut phases = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut actions = Vec::with_capacity(spec.actions.len());
            for action in &spec.actions {
                actions.push(PlannedAction {
                    spec: action.clone(),
                    executor: factory.build(action)?,
                });
            }
            phases.push(Phase {
                name: spec.name.clone(),
                mode: spec.mode,
                timeout: spec.timeout,
                actions,
            });
        }
        Ok(Self { phases })
    }

    /// Total number of actions across all phases.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.phases.iter().map(|p| p.actions.len()).sum()
    }
}
