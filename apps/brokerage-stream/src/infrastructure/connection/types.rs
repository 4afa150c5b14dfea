//! Connection value types: status, options, events, errors.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Status
// =============================================================================

/// Connection status. `Failed` wins over the socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Handshake in progress.
    Connecting,
    /// Socket open.
    Open,
    /// Close handshake in progress.
    Closing,
    /// No socket.
    Closed,
    /// Unrecovered error recorded; only `dispose` helps.
    Failed,
}

impl ConnectionStatus {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Current status.
    pub status: ConnectionStatus,
    /// Last URL used or configured.
    pub url: Option<String>,
    /// Whether outbound payloads are sent as binary frames.
    pub binary: bool,
    /// Generation of the current or most recent socket (0 before the first).
    pub generation: u64,
    /// When the current socket opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// When the most recent socket closed.
    pub closed_at: Option<DateTime<Utc>>,
    /// When the fatal error was recorded.
    pub error_at: Option<DateTime<Utc>>,
    /// When the last inbound message arrived.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Recorded fatal error.
    pub error: Option<String>,
}

// =============================================================================
// Options
// =============================================================================

/// Connection defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// URL used when `connect` is called without one.
    pub url: Option<String>,
    /// Send outbound payloads as binary frames.
    pub binary: bool,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// How long to wait for the peer's close frame.
    pub close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            binary: true,
            connect_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Options for one `connect` call. Unset fields fall back to the connection's
/// current values.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Target URL.
    pub url: Option<String>,
    /// Binary mode.
    pub binary: Option<bool>,
    /// Handshake timeout.
    pub timeout: Option<Duration>,
    /// Caller cancellation, combined with the connection's own token.
    pub cancel: Option<CancellationToken>,
}

impl ConnectOptions {
    /// Connect to `url`.
    #[must_use]
    pub fn to(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Abort the handshake when `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Override the handshake timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for one `close` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseOptions {
    /// Record this error; the connection becomes `Failed`.
    pub error: Option<String>,
    /// Close code (default 1000).
    pub code: Option<u16>,
    /// Close reason.
    pub reason: Option<String>,
}

impl CloseOptions {
    /// Close and record a fatal error.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Event kinds listeners register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    /// Socket opened.
    Open,
    /// Inbound message.
    Message,
    /// Socket closed.
    Close,
    /// Socket error.
    Error,
}

/// Inbound message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Binary frame.
    Binary(Vec<u8>),
    /// Text frame.
    Text(String),
}

impl InboundFrame {
    /// Raw bytes of the frame.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Binary(data) => data,
            Self::Text(text) => text.as_bytes(),
        }
    }
}

/// Connection event. Every event carries the generation of the socket it
/// came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed.
    Open {
        /// Socket generation.
        generation: u64,
    },
    /// Inbound data frame.
    Message {
        /// Socket generation.
        generation: u64,
        /// Frame body.
        frame: InboundFrame,
    },
    /// Socket gone, gracefully or not.
    Close {
        /// Socket generation.
        generation: u64,
        /// Close code from the peer, if any.
        code: Option<u16>,
        /// Close reason from the peer or the local cause.
        reason: String,
    },
    /// Read or write failure; a `Close` follows.
    Error {
        /// Socket generation.
        generation: u64,
        /// Error text.
        message: String,
    },
}

impl ConnectionEvent {
    /// Kind of this event.
    #[must_use]
    pub const fn kind(&self) -> ConnectionEventKind {
        match self {
            Self::Open { .. } => ConnectionEventKind::Open,
            Self::Message { .. } => ConnectionEventKind::Message,
            Self::Close { .. } => ConnectionEventKind::Close,
            Self::Error { .. } => ConnectionEventKind::Error,
        }
    }

    /// Socket generation this event came from.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        match self {
            Self::Open { generation }
            | Self::Message { generation, .. }
            | Self::Close { generation, .. }
            | Self::Error { generation, .. } => *generation,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Connection errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Operation not legal in the current status. Nothing was changed.
    #[error("cannot {operation} while connection is {status}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// Status at the time.
        status: ConnectionStatus,
    },

    /// A fatal error was recorded earlier.
    #[error("connection failed: {message}")]
    Failed {
        /// Recorded error.
        message: String,
    },

    /// No URL was given and none was configured.
    #[error("no url configured")]
    NoUrl,

    /// The websocket handshake failed.
    #[error("handshake failed: {message}")]
    Handshake {
        /// Handshake error.
        message: String,
    },

    /// The handshake did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// Configured timeout.
        after: Duration,
    },

    /// Cancelled by a caller or by disposal.
    #[error("{operation} aborted")]
    Aborted {
        /// Operation that was aborted.
        operation: &'static str,
    },

    /// The outbound channel is gone.
    #[error("send failed: {message}")]
    Send {
        /// Cause.
        message: String,
    },

    /// A socket task failed unexpectedly.
    #[error("socket task failed: {message}")]
    Internal {
        /// Cause.
        message: String,
    },

    /// The connection was disposed.
    #[error("connection disposed")]
    Disposed,
}

impl ConnectionError {
    /// Whether this error leaves the connection usable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::Handshake { .. }
                | Self::Timeout { .. }
                | Self::Aborted { .. }
                | Self::Send { .. }
        )
    }

    /// Whether this error came from cancellation or disposal.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. } | Self::Disposed)
    }
}
