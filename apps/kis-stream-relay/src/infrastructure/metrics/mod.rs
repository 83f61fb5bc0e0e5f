//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Feed**: frames received, heartbeats filtered, reconnects, errors, phase
//! - **Downstream**: connected clients, messages sent, consumers pruned
//! - **Credentials**: issuances by kind and outcome
//! - **Snapshots**: samples by outcome
//! - **Supervision**: background task restarts
//! - **Latency**: broadcast fan-out duration
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::credential::CredentialKind;
use crate::domain::streaming::{FeedPhase, MessageKind};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder is already installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
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
    // Upstream feed
    describe_counter!(
        "kis_relay_frames_received_total",
        "Total frames received from the upstream feed"
    );
    describe_counter!(
        "kis_relay_heartbeats_total",
        "Total upstream heartbeat frames filtered"
    );
    describe_counter!(
        "kis_relay_reconnects_total",
        "Total upstream reconnection attempts"
    );
    describe_counter!(
        "kis_relay_feed_errors_total",
        "Total upstream session failures by type"
    );
    describe_gauge!(
        "kis_relay_feed_phase",
        "Upstream feed phase (0 disconnected, 1 connecting, 2 subscribed, 3 streaming, 4 stopped)"
    );

    // Downstream
    describe_gauge!(
        "kis_relay_downstream_clients",
        "Number of connected downstream consumers"
    );
    describe_counter!(
        "kis_relay_messages_sent_total",
        "Total messages delivered to downstream consumers"
    );
    describe_counter!(
        "kis_relay_consumers_pruned_total",
        "Total downstream consumers dropped after a failed send"
    );

    // Credentials and snapshots
    describe_counter!(
        "kis_relay_credential_issuances_total",
        "Total credential issuance attempts by kind and outcome"
    );
    describe_counter!(
        "kis_relay_snapshots_total",
        "Total snapshot samples by outcome"
    );
    describe_counter!(
        "kis_relay_task_restarts_total",
        "Total supervised background task restarts"
    );

    describe_histogram!(
        "kis_relay_broadcast_seconds",
        "Time to fan one message out to all matching consumers"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame received from the upstream feed.
pub fn record_frame_received() {
    counter!("kis_relay_frames_received_total").increment(1);
}

/// Record a filtered heartbeat frame.
pub fn record_heartbeat_filtered() {
    counter!("kis_relay_heartbeats_total").increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("kis_relay_reconnects_total").increment(1);
}

/// Record an upstream session failure.
pub fn record_feed_error(error_type: &'static str) {
    counter!("kis_relay_feed_errors_total", "error_type" => error_type).increment(1);
}

/// Update the feed phase gauge.
pub fn set_feed_phase(phase: FeedPhase) {
    gauge!("kis_relay_feed_phase").set(f64::from(phase.code()));
}

/// Update the downstream client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_downstream_clients(count: usize) {
    gauge!("kis_relay_downstream_clients").set(count as f64);
}

/// Record messages delivered downstream.
pub fn record_messages_sent(kind: MessageKind, count: usize) {
    if count == 0 {
        return;
    }
    counter!("kis_relay_messages_sent_total", "kind" => kind.as_str())
        .increment(u64::try_from(count).unwrap_or(u64::MAX));
}

/// Record consumers dropped after a failed send.
pub fn record_consumers_pruned(count: usize) {
    if count == 0 {
        return;
    }
    counter!("kis_relay_consumers_pruned_total").increment(u64::try_from(count).unwrap_or(u64::MAX));
}

/// Record a credential issuance attempt.
pub fn record_credential_issuance(kind: CredentialKind, success: bool) {
    counter!(
        "kis_relay_credential_issuances_total",
        "kind" => kind.as_str(),
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Record a snapshot sample outcome.
pub fn record_snapshot(outcome: &'static str) {
    counter!("kis_relay_snapshots_total", "outcome" => outcome).increment(1);
}

/// Record a supervised task restart.
pub fn record_task_restart(task: &'static str) {
    counter!("kis_relay_task_restarts_total", "task" => task).increment(1);
}

/// Record fan-out duration.
pub fn record_broadcast_duration(kind: MessageKind, duration: Duration) {
    histogram!("kis_relay_broadcast_seconds", "kind" => kind.as_str())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received();
        record_heartbeat_filtered();
        record_feed_error("closed");
        set_feed_phase(FeedPhase::Streaming);
        set_downstream_clients(3);
        record_messages_sent(MessageKind::Tick, 0);
        record_messages_sent(MessageKind::Snapshot, 2);
        record_credential_issuance(CredentialKind::Approval, false);
        record_broadcast_duration(MessageKind::Tick, Duration::from_millis(1));
        record_task_restart("feed");
    }

    #[test]
    fn handle_is_none_before_init() {
        // Tests never install the global recorder.
        assert!(get_metrics_handle().is_none());
    }
}
