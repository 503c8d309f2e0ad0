//! # gridguard-core
//!
//! Core engine for gridguard, a power-failure-driven shutdown orchestrator
//! for virtualization hosts.
//!
//! The crate is built from five cooperating pieces:
//!
//! - **Executors** ([`executor`]): a uniform contract for running one action
//!   against one target (local shell, remote shell, guest exec, guest
//!   control), plus a generic retry wrapper.
//! - **Journal** ([`journal`]): an append-only, crash-consistent record of
//!   session progress, rewritten atomically on every update.
//! - **UPS monitor** ([`monitor`]): a sampling loop that derives
//!   edge-triggered power events from UPS telemetry.
//! - **Orchestrator** ([`orchestrator`]): the two-level phase × action
//!   scheduler with per-action retry, timeout, healthcheck, and on-error
//!   policy.
//! - **Recovery** ([`recovery`]): the reverse replay of recovery commands
//!   once line power is back and stable.
//!
//! Wire-level concerns (the NUT protocol, the virtualization REST API, the
//! webhook format) live behind the [`monitor::UpsClient`],
//! [`virt::VirtClient`], and [`orchestrator::Notifier`] traits and are
//! implemented by the daemon crate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod executor;
pub mod journal;
pub mod monitor;
pub mod orchestrator;
pub mod plan;
pub mod recovery;
pub mod stop;
pub mod virt;

pub use action::{ActionKind, ActionSpec, Backoff, Healthcheck, OnErrorPolicy, RetryPolicy};
pub use journal::{CompletedAction, Journal, SessionState, SessionStatus};
pub use monitor::{Monitor, Thresholds, UpsEvent, UpsEventKind, UpsSample};
pub use orchestrator::Orchestrator;
pub use plan::{ExecMode, Phase, Plan};
pub use recovery::Recovery;
