//! Application Layer - Use cases and port definitions.
//!
//! The streaming context lives here, along with the port it drives to
//! create and remove server-side subscriptions.

/// Port interfaces for external systems (subscription transport, credentials).
pub mod ports;

/// Streaming context orchestration and subscription handles.
pub mod services;
