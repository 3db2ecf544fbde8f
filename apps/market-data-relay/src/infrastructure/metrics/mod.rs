//! Prometheus Metrics Module
//!
//! Exposes relay metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Upstream**: Session state, frames by control class, reconnects, errors
//! - **Clients**: Connected subscribers, deliveries, failures, terminations
//! - **Subscriptions**: Consolidated symbol counts and pending requests
//! - **Latency**: Fan-out duration per upstream frame
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Without an
//! installed recorder every recording call is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::session::SessionState;
use crate::domain::subscription::{Category, LedgerStats};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Repeated calls return the handle installed by the first.
///
/// # Errors
///
/// Returns `BuildError` if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Upstream
    describe_counter!(
        "relay_upstream_messages_total",
        "Upstream frame elements received, by control class"
    );
    describe_gauge!(
        "relay_upstream_state",
        "Upstream session state (0=disconnected, 1=connecting, 2=authenticating, 3=ready)"
    );
    describe_counter!(
        "relay_reconnects_total",
        "Total upstream reconnects scheduled"
    );
    describe_counter!(
        "relay_upstream_errors_total",
        "Upstream transport and protocol errors by type"
    );

    // Clients
    describe_gauge!("relay_clients", "Number of connected subscribers");
    describe_counter!(
        "relay_broadcast_deliveries_total",
        "Frames queued to subscribers"
    );
    describe_counter!(
        "relay_broadcast_failures_total",
        "Frames that could not be queued to a subscriber, by reason"
    );
    describe_counter!(
        "relay_clients_terminated_total",
        "Subscribers terminated for missing a heartbeat"
    );

    // Subscriptions
    describe_gauge!(
        "relay_subscriptions",
        "Consolidated upstream subscriptions by category"
    );
    describe_gauge!(
        "relay_pending_requests",
        "Subscriber requests waiting for the upstream to become ready"
    );

    // Latency
    describe_histogram!(
        "relay_broadcast_seconds",
        "Time to fan one upstream frame out to every subscriber"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for upstream frame classes.
#[derive(Debug, Clone, Copy)]
pub enum MessageKind {
    /// `T: success`
    Success,
    /// `T: error`
    Error,
    /// `T: subscription`
    Subscription,
    /// Market data or unknown control message.
    Opaque,
    /// Frame that could not be parsed (malformed JSON or binary).
    Unparsed,
}

impl MessageKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Subscription => "subscription",
            Self::Opaque => "opaque",
            Self::Unparsed => "unparsed",
        }
    }
}

/// Record an upstream frame element.
pub fn record_upstream_message(kind: MessageKind) {
    counter!(
        "relay_upstream_messages_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Update the upstream state gauge.
pub fn set_upstream_state(state: SessionState) {
    gauge!("relay_upstream_state").set(state.as_gauge());
}

/// Record a scheduled reconnect.
pub fn record_reconnect() {
    counter!("relay_reconnects_total").increment(1);
}

/// Record an upstream error.
pub fn record_upstream_error(error_type: &'static str) {
    counter!(
        "relay_upstream_errors_total",
        "error_type" => error_type
    )
    .increment(1);
}

/// Update the subscriber count.
#[allow(clippy::cast_precision_loss)]
pub fn set_clients(count: usize) {
    gauge!("relay_clients").set(count as f64);
}

/// Record successful deliveries of one frame.
pub fn record_deliveries(count: u64) {
    counter!("relay_broadcast_deliveries_total").increment(count);
}

/// Record a failed delivery.
pub fn record_delivery_failure(reason: &'static str) {
    counter!(
        "relay_broadcast_failures_total",
        "reason" => reason
    )
    .increment(1);
}

/// Record subscribers terminated by the liveness probe.
pub fn record_clients_terminated(count: u64) {
    counter!("relay_clients_terminated_total").increment(count);
}

/// Update the subscription and pending-queue gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_ledger_stats(stats: &LedgerStats) {
    for (category, count) in [
        (Category::Trades, stats.trades),
        (Category::Quotes, stats.quotes),
        (Category::Bars, stats.bars),
    ] {
        gauge!(
            "relay_subscriptions",
            "category" => category.as_str()
        )
        .set(count as f64);
    }
    gauge!("relay_pending_requests").set(stats.pending as f64);
}

/// Record fan-out duration.
pub fn record_broadcast_duration(duration: Duration) {
    histogram!("relay_broadcast_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_as_str() {
        assert_eq!(MessageKind::Success.as_str(), "success");
        assert_eq!(MessageKind::Error.as_str(), "error");
        assert_eq!(MessageKind::Subscription.as_str(), "subscription");
        assert_eq!(MessageKind::Opaque.as_str(), "opaque");
        assert_eq!(MessageKind::Unparsed.as_str(), "unparsed");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_upstream_message(MessageKind::Opaque);
        set_upstream_state(SessionState::Ready);
        set_clients(3);
        set_ledger_stats(&LedgerStats::default());
        record_broadcast_duration(Duration::from_millis(1));
    }
}
