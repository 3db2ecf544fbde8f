//! Liveness Monitor
//!
//! Probes every subscriber and the upstream on a fixed interval. A subscriber
//! that has not answered the previous probe with a pong is terminated; the
//! rest are pinged and must answer before the next tick. The upstream is
//! pinged only while authenticated.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::services::Relay;

/// Default probe interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Longest accepted probe interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Periodic liveness probe for subscribers and the upstream.
#[derive(Debug)]
pub struct LivenessMonitor {
    interval: Duration,
    relay: Arc<Relay>,
    cancel: CancellationToken,
}

impl LivenessMonitor {
    /// Create a monitor. A zero interval falls back to [`DEFAULT_INTERVAL`];
    /// longer ones are capped at [`MAX_INTERVAL`].
    #[must_use]
    pub fn new(interval: Duration, relay: Arc<Relay>, cancel: CancellationToken) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval.min(MAX_INTERVAL)
        };
        Self {
            interval,
            relay,
            cancel,
        }
    }

    /// Probe interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until cancelled. The first probe fires one interval after start.
    pub async fn run(self) {
        let start = Instant::now()
            .checked_add(self.interval)
            .unwrap_or_else(Instant::now);
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Liveness monitor started"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Liveness monitor cancelled");
                    break;
                }
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    fn tick(&self) {
        let report = self.relay.probe_clients();
        let upstream_pinged = self.relay.probe_upstream();

        tracing::debug!(
            terminated = report.terminated,
            pinged = report.pinged,
            upstream_pinged,
            "Liveness probe"
        );
    }
}
