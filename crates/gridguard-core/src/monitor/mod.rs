//! UPS monitor.
//!
//! A sampling loop that polls the UPS client on a fixed period and derives
//! edge-triggered events from consecutive samples. Power transitions are
//! emitted exactly once per edge; battery-level events are re-emitted on
//! every qualifying tick and deduplication is the consumer's concern.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::stop::StopSignal;

/// Default sampling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the sample and event channels. Sends never block; a full
/// channel drops the oldest-unread semantics in favor of dropping the new
/// item, which is fine for telemetry.
const CHANNEL_CAPACITY: usize = 16;

/// One UPS telemetry sample. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsSample {
    /// UPS unit name.
    pub name: String,
    /// Raw status string: space-separated flags such as `OL`, `OB`, `LB`.
    pub status: String,
    /// Battery charge in percent (0-100).
    pub battery_charge: u8,
    /// Estimated runtime remaining, in seconds.
    pub runtime_secs: u32,
    /// Load in percent.
    pub load: u8,
    /// Sample timestamp.
    pub timestamp: DateTime<Utc>,
}

impl UpsSample {
    /// True when the `OL` (online) flag is present.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.has_flag("OL")
    }

    /// True when the `OB` (on-battery) flag is present.
    #[must_use]
    pub fn is_on_battery(&self) -> bool {
        self.has_flag("OB")
    }

    /// True when the UPS itself raises the `LB` (low-battery) flag.
    #[must_use]
    pub fn is_low_battery(&self) -> bool {
        self.has_flag("LB")
    }

    fn has_flag(&self, flag: &str) -> bool {
        self.status.split_whitespace().any(|token| token == flag)
    }
}

/// Battery thresholds, in percent. Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    warning: u8,
    critical: u8,
    emergency: u8,
}

impl Thresholds {
    /// Builds a threshold set, enforcing `emergency <= critical <= warning`
    /// and an upper bound of 100 on each level.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::BadThresholds`] when the ordering or range
    /// is violated.
    pub fn new(warning: u8, critical: u8, emergency: u8) -> Result<Self, MonitorError> {
        if warning > 100 || !(emergency <= critical && critical <= warning) {
            return Err(MonitorError::BadThresholds {
                warning,
                critical,
                emergency,
            });
        }
        Ok(Self {
            warning,
            critical,
            emergency,
        })
    }

    /// Warning level.
    #[must_use]
    pub const fn warning(&self) -> u8 {
        self.warning
    }

    /// Critical level.
    #[must_use]
    pub const fn critical(&self) -> u8 {
        self.critical
    }

    /// Emergency level.
    #[must_use]
    pub const fn emergency(&self) -> u8 {
        self.emergency
    }
}

/// Kind of a derived UPS event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsEventKind {
    /// Mains power was lost (online -> on-battery edge).
    PowerLost,
    /// Mains power returned (on-battery -> online edge).
    PowerRestored,
    /// On battery at or below the warning threshold.
    LowBattery,
    /// On battery at or below the critical threshold.
    CriticalBattery,
    /// On battery at or below the emergency threshold.
    Emergency,
}

/// A derived UPS event with the sample that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsEvent {
    /// Event kind.
    pub kind: UpsEventKind,
    /// The sample the event was derived from.
    pub sample: UpsSample,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Human-readable description.
    pub message: String,
}

/// Errors from the UPS client and monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Threshold ordering or range violation.
    #[error(
        "invalid thresholds: require emergency <= critical <= warning <= 100, \
         got warning={warning} critical={critical} emergency={emergency}"
    )]
    BadThresholds {
        /// Offending warning level.
        warning: u8,
        /// Offending critical level.
        critical: u8,
        /// Offending emergency level.
        emergency: u8,
    },

    /// The client is not connected.
    #[error("UPS client is not connected")]
    NotConnected,

    /// Transport failure talking to the UPS daemon.
    #[error("UPS transport error: {0}")]
    Transport(String),

    /// The UPS daemon answered with a protocol error.
    #[error("UPS protocol error: {0}")]
    Protocol(String),

    /// The status read did not finish before its deadline.
    #[error("UPS status read timed out")]
    Timeout,
}

/// Line-protocol UPS client, implemented by the daemon crate.
#[async_trait]
pub trait UpsClient: Send {
    /// Establishes the connection to the UPS daemon.
    async fn connect(&mut self) -> Result<(), MonitorError>;

    /// Reads a fresh status sample, honoring `deadline`.
    async fn get_status(&mut self, deadline: Instant) -> Result<UpsSample, MonitorError>;

    /// Tears the connection down.
    async fn close(&mut self);
}

/// Receiving ends of the monitor's outbound channels.
#[derive(Debug)]
pub struct MonitorStreams {
    /// Derived events, in strict sample order.
    pub events: mpsc::Receiver<UpsEvent>,
    /// Raw samples, best effort (dropped when the consumer lags).
    pub samples: mpsc::Receiver<UpsSample>,
}

/// The UPS sampling loop.
pub struct Monitor<C> {
    client: C,
    thresholds: Thresholds,
    poll_interval: Duration,
    event_tx: mpsc::Sender<UpsEvent>,
    sample_tx: mpsc::Sender<UpsSample>,
}

impl<C: UpsClient> Monitor<C> {
    /// Creates a monitor and its outbound streams.
    #[must_use]
    pub fn new(client: C, thresholds: Thresholds, poll_interval: Duration) -> (Self, MonitorStreams) {
        let (event_tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        let (sample_tx, samples) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                client,
                thresholds,
                poll_interval,
                event_tx,
                sample_tx,
            },
            MonitorStreams { events, samples },
        )
    }

    /// Runs the sampling loop until `stop` fires.
    ///
    /// Sample-read failures are logged and skipped; the previous sample is
    /// retained so the next successful read still sees the correct edge.
    /// The outbound channels close when this returns.
    ///
    /// # Errors
    ///
    /// Returns the connection error when the initial connect fails.
    pub async fn run(mut self, mut stop: StopSignal) -> Result<(), MonitorError> {
        self.client.connect().await?;
        info!(period = ?self.poll_interval, "UPS monitor started");

        let mut previous: Option<UpsSample> = None;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = stop.stopped() => break,
                _ = ticker.tick() => {},
            }

            let deadline = Instant::now() + self.poll_interval;
            let sample = match self.client.get_status(deadline).await {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(error = %e, "UPS status read failed, keeping previous sample");
                    continue;
                },
            };

            // Telemetry push is best effort: a slow consumer loses samples,
            // never blocks the loop.
            if let Err(mpsc::error::TrySendError::Full(_)) =
                self.sample_tx.try_send(sample.clone())
            {
                debug!("status channel full, dropping sample");
            }

            for event in derive_events(previous.as_ref(), &sample, &self.thresholds) {
                info!(kind = ?event.kind, message = %event.message, "UPS event");
                if let Err(mpsc::error::TrySendError::Full(_)) = self.event_tx.try_send(event) {
                    warn!("event channel full, dropping event");
                }
            }
            previous = Some(sample);
        }

        self.client.close().await;
        info!("UPS monitor stopped");
        Ok(())
    }
}

/// Derives the events for one tick from the previous and current samples.
///
/// At most one battery-level event is produced per tick: the highest
/// severity whose predicate holds, using `<=` comparisons. Power
/// transitions are derived from the flag edge between the two samples.
#[must_use]
pub fn derive_events(
    previous: Option<&UpsSample>,
    current: &UpsSample,
    thresholds: &Thresholds,
) -> Vec<UpsEvent> {
    let mut events = Vec::new();
    let now = Utc::now();
    let mut push = |kind: UpsEventKind, message: String| {
        events.push(UpsEvent {
            kind,
            sample: current.clone(),
            timestamp: now,
            message,
        });
    };

    if let Some(previous) = previous {
        if previous.is_online() && current.is_on_battery() {
            push(
                UpsEventKind::PowerLost,
                format!(
                    "power lost, running on battery ({}%, ~{}s runtime)",
                    current.battery_charge, current.runtime_secs
                ),
            );
        }
        if previous.is_on_battery() && current.is_online() {
            push(
                UpsEventKind::PowerRestored,
                format!("power restored (battery at {}%)", current.battery_charge),
            );
        }
    }

    if current.is_on_battery() {
        let charge = current.battery_charge;
        if charge <= thresholds.emergency() {
            push(
                UpsEventKind::Emergency,
                format!("EMERGENCY: battery at {charge}%"),
            );
        } else if charge <= thresholds.critical() {
            push(
                UpsEventKind::CriticalBattery,
                format!("critical battery: {charge}%"),
            );
        } else if charge <= thresholds.warning() {
            push(UpsEventKind::LowBattery, format!("low battery: {charge}%"));
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::stop::stop_channel;

    fn sample(status: &str, charge: u8) -> UpsSample {
        UpsSample {
            name: "ups1".to_string(),
            status: status.to_string(),
            battery_charge: charge,
            runtime_secs: 600,
            load: 40,
            timestamp: Utc::now(),
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds::new(30, 20, 10).unwrap()
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        assert!(Thresholds::new(30, 20, 10).is_ok());
        assert!(Thresholds::new(30, 30, 30).is_ok());
        assert!(Thresholds::new(0, 0, 0).is_ok());
        assert!(Thresholds::new(20, 30, 10).is_err());
        assert!(Thresholds::new(30, 10, 20).is_err());
        assert!(Thresholds::new(101, 20, 10).is_err());
    }

    #[test]
    fn test_status_flags() {
        let s = sample("OB LB", 5);
        assert!(s.is_on_battery());
        assert!(s.is_low_battery());
        assert!(!s.is_online());
        // Substring of another token must not match.
        let s = sample("OLX", 90);
        assert!(!s.is_online());
    }

    #[test]
    fn test_power_lost_edge() {
        let prev = sample("OL", 100);
        let cur = sample("OB", 80);
        let events = derive_events(Some(&prev), &cur, &thresholds());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, UpsEventKind::PowerLost);
    }

    #[test]
    fn test_power_restored_edge() {
        let prev = sample("OB", 50);
        let cur = sample("OL", 50);
        let events = derive_events(Some(&prev), &cur, &thresholds());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, UpsEventKind::PowerRestored);
    }

    #[test]
    fn test_identical_samples_produce_no_transition() {
        let prev = sample("OL", 100);
        let cur = sample("OL", 100);
        assert!(derive_events(Some(&prev), &cur, &thresholds()).is_empty());
    }

    #[test]
    fn test_no_previous_sample_no_transition() {
        let cur = sample("OB", 80);
        assert!(derive_events(None, &cur, &thresholds()).is_empty());
    }

    #[test]
    fn test_battery_threshold_edges_inclusive() {
        let prev = sample("OB", 50);
        // Exactly at critical triggers CriticalBattery (<=, not <).
        let cur = sample("OB", 20);
        let events = derive_events(Some(&prev), &cur, &thresholds());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, UpsEventKind::CriticalBattery);
    }

    #[test]
    fn test_highest_severity_wins() {
        let prev = sample("OB", 50);
        let cur = sample("OB", 5);
        let events = derive_events(Some(&prev), &cur, &thresholds());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, UpsEventKind::Emergency);
    }

    #[test]
    fn test_zero_thresholds_emergency_at_zero_charge() {
        let t = Thresholds::new(0, 0, 0).unwrap();
        let prev = sample("OB", 1);
        let cur = sample("OB", 0);
        let events = derive_events(Some(&prev), &cur, &t);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, UpsEventKind::Emergency);
    }

    #[test]
    fn test_battery_levels_not_emitted_while_online() {
        let prev = sample("OL", 15);
        let cur = sample("OL", 15);
        assert!(derive_events(Some(&prev), &cur, &thresholds()).is_empty());
    }

    #[test]
    fn test_spec_event_sequence() {
        // Samples: online, online, OB@55, OB@25, OB@8, online.
        let t = thresholds();
        let feed = [
            sample("OL", 100),
            sample("OL", 100),
            sample("OB", 55),
            sample("OB", 25),
            sample("OB", 8),
            sample("OL", 95),
        ];
        let mut kinds = Vec::new();
        let mut prev: Option<&UpsSample> = None;
        for s in &feed {
            kinds.extend(derive_events(prev, s, &t).into_iter().map(|e| e.kind));
            prev = Some(s);
        }
        assert_eq!(
            kinds,
            vec![
                UpsEventKind::PowerLost,
                UpsEventKind::LowBattery,
                UpsEventKind::Emergency,
                UpsEventKind::PowerRestored,
            ]
        );
    }

    /// Scripted client that replays a fixed sample sequence.
    struct ScriptedUps {
        feed: Arc<Mutex<VecDeque<Result<UpsSample, MonitorError>>>>,
        connected: bool,
    }

    #[async_trait]
    impl UpsClient for ScriptedUps {
        async fn connect(&mut self) -> Result<(), MonitorError> {
            self.connected = true;
            Ok(())
        }

        async fn get_status(&mut self, _deadline: Instant) -> Result<UpsSample, MonitorError> {
            assert!(self.connected);
            self.feed
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(MonitorError::Transport("feed exhausted".to_string())))
        }

        async fn close(&mut self) {
            self.connected = false;
        }
    }

    #[tokio::test]
    async fn test_monitor_loop_emits_in_sample_order() {
        let feed = Arc::new(Mutex::new(VecDeque::from([
            Ok(sample("OL", 100)),
            Err(MonitorError::Transport("blip".to_string())),
            Ok(sample("OB", 25)),
            Ok(sample("OL", 90)),
        ])));
        let client = ScriptedUps {
            feed: Arc::clone(&feed),
            connected: false,
        };
        let (monitor, mut streams) =
            Monitor::new(client, thresholds(), Duration::from_millis(5));
        let (ctl, sig) = stop_channel();
        let task = tokio::spawn(monitor.run(sig));

        let mut kinds = Vec::new();
        while let Some(event) =
            tokio::time::timeout(Duration::from_secs(5), streams.events.recv())
                .await
                .ok()
                .flatten()
        {
            kinds.push(event.kind);
            if kinds.len() == 3 {
                break;
            }
        }
        ctl.stop();
        task.await.unwrap().unwrap();

        // The failed read in between must not fake an edge: OL -> (error)
        // -> OB is still exactly one PowerLost.
        assert_eq!(
            kinds,
            vec![
                UpsEventKind::PowerLost,
                UpsEventKind::LowBattery,
                UpsEventKind::PowerRestored,
            ]
        );
    }

    #[tokio::test]
    async fn test_monitor_stops_cleanly_and_closes_channels() {
        let feed = Arc::new(Mutex::new(VecDeque::from([Ok(sample("OL", 100))])));
        let client = ScriptedUps {
            feed,
            connected: false,
        };
        let (monitor, mut streams) =
            Monitor::new(client, thresholds(), Duration::from_millis(5));
        let (ctl, sig) = stop_channel();
        let task = tokio::spawn(monitor.run(sig));

        ctl.stop();
        task.await.unwrap().unwrap();
        // Channel must report closed once the loop is gone.
        assert!(streams.events.recv().await.is_none());
    }
}
