//! Domain Layer - Streamed entities and the rules for updating them.
//!
//! Pure types with serialization support. Nothing here touches the network.

/// Balance, order, position and price entities.
pub mod entities;

/// Snapshot plus delta merging.
pub mod merge;

/// Subscription kinds, scopes and reference ids.
pub mod subscription;
