//! Cooperative stop signalling.
//!
//! Every long-running loop in the core (monitor ticks, retry waits, the
//! power-stable delay) selects against a [`StopSignal`] so that an operator
//! interrupt propagates within one suspension point.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Sending half of a stop signal. Held by the process supervisor.
#[derive(Debug)]
pub struct StopController {
    tx: watch::Sender<bool>,
}

/// Receiving half of a stop signal. Cheap to clone; one per task.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
    // Keeps the channel open for detached signals created by `never()`.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

/// Creates a linked controller/signal pair.
#[must_use]
pub fn stop_channel() -> (StopController, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (
        StopController { tx },
        StopSignal {
            rx,
            _keepalive: None,
        },
    )
}

impl StopController {
    /// Signals all linked [`StopSignal`]s to stop.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns a new signal linked to this controller.
    #[must_use]
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

impl StopSignal {
    /// Returns true once stop has been requested.
    ///
    /// A dropped controller counts as a stop request: without a supervisor
    /// there is nobody left to run for.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves when stop is requested (or the controller is gone).
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|&stopped| stopped).await;
    }

    /// Sleeps for `delay`, returning early if stop is requested.
    ///
    /// Returns `true` when the wait was interrupted by a stop request.
    pub async fn sleep_interruptible(&mut self, delay: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => false,
            () = self.stopped() => true,
        }
    }

    /// Returns a signal that can never fire. Useful for one-shot commands
    /// that have no supervisor.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        StopSignal {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }
}
