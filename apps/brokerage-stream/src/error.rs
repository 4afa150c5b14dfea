//! Crate-level error type.
//!
//! Every component error folds into [`StreamError`]. It is `Clone` so one
//! disposal cause can be handed to every subscriber and every later accessor
//! call.

use serde_json::Value;

use crate::application::ports::TransportError;
use crate::infrastructure::connection::ConnectionError;
use crate::infrastructure::stream::{CodecError, ConnectUrlError};

/// Streaming client errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    /// Socket-level failure.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Undecodable frame or control message.
    #[error("framing error: {0}")]
    Codec(#[from] CodecError),

    /// Subscribe/unsubscribe collaborator failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Connect URL could not be built.
    #[error("invalid connect url: {0}")]
    ConnectUrl(#[from] ConnectUrlError),

    /// A payload failed validation against its entity schema.
    #[error("payload for {reference_id} failed validation: {}", .diagnostics.join("; "))]
    Payload {
        /// Subscription the payload was addressed to.
        reference_id: String,
        /// Payload as received.
        payload: Value,
        /// Validation diagnostics.
        diagnostics: Vec<String>,
    },

    /// The server permanently disabled a subscription.
    #[error("subscription {reference_id} was permanently disabled by the server")]
    SubscriptionDisabled {
        /// Disabled subscription.
        reference_id: String,
    },

    /// Reconnect retries ran out.
    #[error("reconnect gave up after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// No subscription exists for the requested scope.
    #[error("no subscription for {0}")]
    UnknownScope(String),

    /// A subscription has not received its snapshot yet.
    #[error("subscription {0} has no state yet")]
    NotReady(String),

    /// The context was disposed without a recorded error.
    #[error("streaming context is disposed")]
    Disposed,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl StreamError {
    /// Short label for metrics and structured logs.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Codec(_) => "codec",
            Self::Transport(_) => "transport",
            Self::ConnectUrl(_) => "connect_url",
            Self::Payload { .. } => "payload",
            Self::SubscriptionDisabled { .. } => "subscription_disabled",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::UnknownScope(_) => "unknown_scope",
            Self::NotReady(_) => "not_ready",
            Self::Disposed => "disposed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this error is a cancellation rather than a failure.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Connection(ConnectionError::Aborted { .. } | ConnectionError::Disposed)
        )
    }
}
