//! Guest-facing executors: in-guest command execution and bulk guest
//! control through the virtualization API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{truncate_command, ActionResult, Executor};
use crate::action::{ControlVerb, HealthExpect, Healthcheck};
use crate::virt::{Guest, GuestRef, Selector, VirtClient};

/// Runs a command inside a single guest via the virtualization API.
pub struct GuestExecExecutor {
    guest: GuestRef,
    command: String,
    recovery: Option<String>,
    healthcheck: Option<Healthcheck>,
    client: Arc<dyn VirtClient>,
}

impl GuestExecExecutor {
    /// Creates an in-guest executor for the referenced guest.
    #[must_use]
    pub fn new(guest: GuestRef, command: impl Into<String>, client: Arc<dyn VirtClient>) -> Self {
        Self {
            guest,
            command: command.into(),
            recovery: None,
            healthcheck: None,
            client,
        }
    }

    /// Sets the recovery command.
    #[must_use]
    pub fn with_recovery(mut self, recovery: Option<String>) -> Self {
        self.recovery = recovery;
        self
    }

    /// Sets the post-action verification.
    #[must_use]
    pub fn with_healthcheck(mut self, healthcheck: Option<Healthcheck>) -> Self {
        self.healthcheck = healthcheck;
        self
    }

    async fn run_in_guest(&self, command: &str, deadline: Instant) -> ActionResult {
        let started = Instant::now();
        let budget = deadline.saturating_duration_since(started);

        let run = async {
            let guests = self.client.list_guests().await?;
            let guest = self
                .guest
                .resolve(&guests)
                .ok_or_else(|| crate::virt::VirtError::GuestNotFound(self.guest.to_string()))?;
            self.client
                .exec_in_guest(guest.kind, guest.id, &guest.node, command)
                .await
        };

        match tokio::time::timeout_at(deadline, run).await {
            Err(_) => ActionResult::timed_out(budget, started.elapsed()),
            Ok(Err(e)) => ActionResult::fail(e.to_string(), started.elapsed()),
            Ok(Ok(output)) => ActionResult::ok(output, started.elapsed()),
        }
    }
}

#[async_trait]
impl Executor for GuestExecExecutor {
    async fn execute(&self, deadline: Instant) -> ActionResult {
        self.run_in_guest(&self.command, deadline).await
    }

    async fn recover(&self, deadline: Instant) -> ActionResult {
        match self.recovery.as_deref().filter(|r| !r.is_empty()) {
            Some(recovery) => self.run_in_guest(recovery, deadline).await,
            None => ActionResult::ok("no recovery command defined", Duration::ZERO),
        }
    }

    async fn healthcheck(&self, deadline: Instant) -> bool {
        let Some(check) = &self.healthcheck else {
            return true;
        };
        let result = self.run_in_guest(&check.command, deadline).await;
        match check.expect {
            HealthExpect::Success => result.success,
            HealthExpect::Failure => !result.success,
        }
    }

    fn describe(&self) -> String {
        format!("guest-exec {}: {}", self.guest, truncate_command(&self.command))
    }
}

/// Shuts down or stops every guest matched by a selector.
///
/// The built-in healthcheck passes once no matching guest reports a
/// running status; an explicit healthcheck configuration is not accepted
/// for this kind.
pub struct GuestControlExecutor {
    selector: Selector,
    verb: ControlVerb,
    timeout: Duration,
    client: Arc<dyn VirtClient>,
}

impl GuestControlExecutor {
    /// Creates a guest-control executor.
    #[must_use]
    pub fn new(
        selector: Selector,
        verb: ControlVerb,
        timeout: Duration,
        client: Arc<dyn VirtClient>,
    ) -> Self {
        Self {
            selector,
            verb,
            timeout,
            client,
        }
    }
}

#[async_trait]
impl Executor for GuestControlExecutor {
    async fn execute(&self, deadline: Instant) -> ActionResult {
        let started = Instant::now();
        let budget = deadline.saturating_duration_since(started);

        let run = async {
            let guests = self.client.list_guests().await?;
            let matched = self.selector.filter(&guests)?;
            if matched.is_empty() {
                return Ok::<_, crate::virt::VirtError>((Vec::new(), Vec::new()));
            }

            let mut done = Vec::new();
            let mut failed = Vec::new();
            for guest in &matched {
                debug!(guest = %guest.name, verb = %self.verb, "controlling guest");
                let outcome = match self.verb {
                    ControlVerb::Shutdown => {
                        self.client
                            .shutdown_guest(guest.kind, guest.id, &guest.node, self.timeout)
                            .await
                    },
                    ControlVerb::Stop => {
                        self.client.stop_guest(guest.kind, guest.id, &guest.node).await
                    },
                };
                match outcome {
                    Ok(()) => done.push(format!("{}:{}", guest.kind, guest.name)),
                    Err(e) => failed.push(format!("{}:{} ({e})", guest.kind, guest.name)),
                }
            }
            Ok((done, failed))
        };

        match tokio::time::timeout_at(deadline, run).await {
            Err(_) => ActionResult::timed_out(budget, started.elapsed()),
            Ok(Err(e)) => ActionResult::fail(e.to_string(), started.elapsed()),
            Ok(Ok((done, failed))) => {
                let output = if done.is_empty() && failed.is_empty() {
                    "no matching guests".to_string()
                } else {
                    format!("{} {} guests: {}", self.verb, done.len(), done.join(", "))
                };
                if failed.is_empty() {
                    ActionResult::ok(output, started.elapsed())
                } else {
                    ActionResult::fail_with_output(
                        format!("failed to {} {}", self.verb, failed.join(", ")),
                        output,
                        started.elapsed(),
                    )
                }
            },
        }
    }

    async fn recover(&self, deadline: Instant) -> ActionResult {
        let started = Instant::now();
        let budget = deadline.saturating_duration_since(started);

        let run = async {
            let guests = self.client.list_guests().await?;
            let matched = self.selector.filter(&guests)?;
            let mut started_guests = Vec::new();
            let mut failed = Vec::new();
            for guest in matched.iter().filter(|g| !g.is_running()) {
                match self.client.start_guest(guest.kind, guest.id, &guest.node).await {
                    Ok(()) => started_guests.push(format!("{}:{}", guest.kind, guest.name)),
                    Err(e) => failed.push(format!("{}:{} ({e})", guest.kind, guest.name)),
                }
            }
            Ok::<_, crate::virt::VirtError>((started_guests, failed))
        };

        match tokio::time::timeout_at(deadline, run).await {
            Err(_) => ActionResult::timed_out(budget, started.elapsed()),
            Ok(Err(e)) => ActionResult::fail(e.to_string(), started.elapsed()),
            Ok(Ok((started_guests, failed))) => {
                let output = format!("started {} guests: {}", started_guests.len(), started_guests.join(", "));
                if failed.is_empty() {
                    ActionResult::ok(output, started.elapsed())
                } else {
                    ActionResult::fail_with_output(
                        format!("failed to start {}", failed.join(", ")),
                        output,
                        started.elapsed(),
                    )
                }
            },
        }
    }

    async fn healthcheck(&self, deadline: Instant) -> bool {
        let run = async {
            let guests = self.client.list_guests().await?;
            let matched = self.selector.filter(&guests)?;
            Ok::<_, crate::virt::VirtError>(!matched.iter().any(Guest::is_running))
        };
        match tokio::time::timeout_at(deadline, run).await {
            Ok(Ok(stopped)) => stopped,
            Ok(Err(e)) => {
                warn!(error = %e, "guest-control healthcheck failed");
                false
            },
            Err(_) => false,
        }
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(kind) = self.selector.kind {
            parts.push(format!("kind={kind}"));
        }
        if !self.selector.tags.is_empty() {
            parts.push(format!("tags={}", self.selector.tags.join(",")));
        }
        if parts.is_empty() {
            parts.push("all".to_string());
        }
        format!("guest-control {} [{}]", self.verb, parts.join(" "))
    }
}
