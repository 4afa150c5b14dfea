//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the port interfaces defined in the
//! application layer, plus the websocket plumbing they sit on.

/// Persistent websocket connection, listeners and inactivity monitor.
pub mod connection;

/// Frame codec, control messages, reconnect backoff and connect URLs.
pub mod stream;

/// REST subscription transport.
pub mod http;

/// Configuration from environment variables.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
