//! Prometheus Metrics Module
//!
//! Records streaming-client metrics through the `metrics` facade. The library
//! only records; a binary installs the Prometheus recorder once with
//! [`init_metrics`]. Without a recorder every call is a no-op.
//!
//! # Metrics Categories
//!
//! - **Frames**: frames received and messages decoded by kind
//! - **State**: deltas applied per subscription kind
//! - **Resilience**: reconnects by reason, orphaned messages, fatal errors
//! - **Gauges**: active subscriptions, connection status

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::subscription::SubscriptionKind;
use crate::infrastructure::connection::ConnectionStatus;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Recorder installation errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The exporter could not be built.
    #[error("failed to build prometheus exporter: {0}")]
    Build(#[from] BuildError),
    /// Another global recorder is already installed.
    #[error("failed to install metrics recorder: {0}")]
    Install(String),
}

/// Install the Prometheus recorder. With `listen` set, the exporter also
/// serves `/metrics` on that address. Later calls return the first handle.
///
/// # Errors
///
/// Returns an error if the recorder or the HTTP listener cannot be installed.
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = match listen {
        Some(addr) => {
            let builder = PrometheusBuilder::new().with_http_listener(addr);
            let (recorder, exporter) = builder.build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|e| MetricsError::Install(e.to_string()))?;
            tokio::spawn(exporter);
            handle
        }
        None => PrometheusBuilder::new().install_recorder()?,
    };

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
    describe_counter!(
        "brokerage_stream_frames_received_total",
        "Total binary frames received on the streaming socket"
    );
    describe_counter!(
        "brokerage_stream_messages_total",
        "Total messages decoded from frames, by kind"
    );
    describe_counter!(
        "brokerage_stream_deltas_applied_total",
        "Total deltas merged into subscription state"
    );
    describe_counter!(
        "brokerage_stream_reconnects_total",
        "Total reconnects, by reason"
    );
    describe_counter!(
        "brokerage_stream_orphaned_messages_total",
        "Total messages for unknown reference ids"
    );
    describe_counter!(
        "brokerage_stream_fatal_errors_total",
        "Total errors that disposed a streaming context"
    );

    describe_gauge!(
        "brokerage_stream_active_subscriptions",
        "Subscriptions held by live streaming contexts"
    );
    describe_gauge!(
        "brokerage_stream_connection_status",
        "Streaming connection status (0 closed, 1 connecting, 2 open, 3 closing, 4 failed)"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for decoded message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Subscription data.
    Data,
    /// `_heartbeat` control message.
    Heartbeat,
    /// `_disconnect` control message.
    Disconnect,
    /// `_resetsubscriptions` control message.
    ResetSubscriptions,
    /// Control message this client does not know.
    UnrecognizedControl,
}

impl MessageKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Heartbeat => "heartbeat",
            Self::Disconnect => "disconnect",
            Self::ResetSubscriptions => "reset_subscriptions",
            Self::UnrecognizedControl => "unrecognized_control",
        }
    }
}

/// Metric labels for reconnect causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// Server sent `_disconnect`.
    ServerDisconnect,
    /// Socket closed or reset underneath us.
    SocketClosed,
    /// A subscription missed its inactivity deadline.
    SubscriptionInactive,
    /// The whole context went quiet.
    ContextInactive,
}

impl ReconnectReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerDisconnect => "server_disconnect",
            Self::SocketClosed => "socket_closed",
            Self::SubscriptionInactive => "subscription_inactive",
            Self::ContextInactive => "context_inactive",
        }
    }
}

/// Record one received frame.
pub fn record_frame() {
    counter!("brokerage_stream_frames_received_total").increment(1);
}

/// Record one decoded message.
pub fn record_message(kind: MessageKind) {
    counter!(
        "brokerage_stream_messages_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a delta merged into a subscription.
pub fn record_delta_applied(kind: SubscriptionKind) {
    counter!(
        "brokerage_stream_deltas_applied_total",
        "subscription" => kind.as_str()
    )
    .increment(1);
}

/// Record a reconnect.
pub fn record_reconnect(reason: ReconnectReason) {
    counter!(
        "brokerage_stream_reconnects_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a message addressed to an unknown reference id.
pub fn record_orphaned_message() {
    counter!("brokerage_stream_orphaned_messages_total").increment(1);
}

/// Record an error that disposed a context.
pub fn record_fatal_error(error_type: &'static str) {
    counter!(
        "brokerage_stream_fatal_errors_total",
        "error_type" => error_type
    )
    .increment(1);
}

/// Adjust the active subscription gauge.
pub fn add_active_subscriptions(delta: f64) {
    gauge!("brokerage_stream_active_subscriptions").increment(delta);
}

/// Update the connection status gauge.
pub fn set_connection_status(status: ConnectionStatus) {
    gauge!("brokerage_stream_connection_status").set(status_value(status));
}

const fn status_value(status: ConnectionStatus) -> f64 {
    match status {
        ConnectionStatus::Closed => 0.0,
        ConnectionStatus::Connecting => 1.0,
        ConnectionStatus::Open => 2.0,
        ConnectionStatus::Closing => 3.0,
        ConnectionStatus::Failed => 4.0,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_as_str() {
        assert_eq!(MessageKind::Data.as_str(), "data");
        assert_eq!(MessageKind::Heartbeat.as_str(), "heartbeat");
        assert_eq!(MessageKind::Disconnect.as_str(), "disconnect");
        assert_eq!(MessageKind::ResetSubscriptions.as_str(), "reset_subscriptions");
        assert_eq!(MessageKind::UnrecognizedControl.as_str(), "unrecognized_control");
    }

    #[test]
    fn reconnect_reason_as_str() {
        assert_eq!(ReconnectReason::ServerDisconnect.as_str(), "server_disconnect");
        assert_eq!(ReconnectReason::SocketClosed.as_str(), "socket_closed");
        assert_eq!(ReconnectReason::SubscriptionInactive.as_str(), "subscription_inactive");
        assert_eq!(ReconnectReason::ContextInactive.as_str(), "context_inactive");
    }

    #[test]
    fn status_gauge_values_are_distinct() {
        let values = [
            ConnectionStatus::Closed,
            ConnectionStatus::Connecting,
            ConnectionStatus::Open,
            ConnectionStatus::Closing,
            ConnectionStatus::Failed,
        ]
        .map(status_value);
        for (i, a) in values.iter().enumerate() {
            for b in &values[i + 1..] {
                assert!((a - b).abs() > f64::EPSILON);
            }
        }
    }
}
