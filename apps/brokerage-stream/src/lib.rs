#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Brokerage Stream - Resilient Push-Streaming Client
//!
//! Keeps one websocket open to a brokerage streaming service, multiplexes
//! balance, order, position and price subscriptions over it, and rebuilds each
//! subscription's state from a snapshot followed by deltas. Reconnects are
//! transparent: subscription handles and their state survive them.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Entities and the rules for updating them
//!   - `entities`: Balance, order, position, price types
//!   - `merge`: Snapshot plus delta merge engine
//!   - `subscription`: Kinds, scopes and reference ids
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Subscription transport and credentials
//!   - `services`: Streaming context and subscription handles
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `connection`: Websocket state machine, listeners, inactivity monitor
//!   - `stream`: Binary frame codec, control messages, backoff, connect URLs
//!   - `http`: REST subscription transport
//!   - `config`: Environment configuration
//!   - `metrics`, `telemetry`: Observability
//!
//! # Data Flow
//!
//! ```text
//!                 subscribe (REST)             snapshot
//! StreamingContext ───────────────► Transport ──────────┐
//!        ▲                                              ▼
//!        │ frames          ┌────────────┐   deltas  ┌──────────────┐
//! Connection ─────────────►│   Codec    │──────────►│ Subscription │──► observers
//!                          └────────────┘           └──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Entities and merge rules with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Crate-level error type.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::StreamError;

// Domain types
pub use domain::entities::{
    Balance, BuySell, ClosedPosition, ClosedPositions, Order, Orders, Position, Positions, Price,
    Quote,
};
pub use domain::merge::{EntityCollection, MergeError, StreamState};
pub use domain::subscription::{
    Instrument, ReferenceId, StreamRequest, SubscriptionKind, SubscriptionScope,
};

// Application
pub use application::ports::{
    BearerToken, SubscribeRequest, SubscribeResponse, SubscriptionTransport, TransportError,
};
pub use application::services::{
    ContextConfig, ContextState, StreamingContext, Subscription, SubscriptionEvent,
    SubscriptionId,
};

// Infrastructure
pub use infrastructure::config::{ConfigError, StreamClientConfig};
pub use infrastructure::connection::{
    Connection, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionEventKind,
    ConnectionStatus,
};
pub use infrastructure::http::{HttpSubscriptionTransport, HttpTransportConfig};
pub use infrastructure::stream::{BackoffConfig, FrameCodec, StreamMessage};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
