//! Port Interfaces
//!
//! Contracts for the collaborators a streaming context drives but does not
//! implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`SubscriptionTransport`]: creates and removes server-side subscriptions
//!   and re-authorizes the streaming connection.
//!
//! Credentials are not a trait: a context reads them from a
//! `tokio::sync::watch` channel of [`BearerToken`]s, so any token refresher can
//! publish into it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::subscription::{ReferenceId, SubscriptionScope};

// =============================================================================
// Credentials
// =============================================================================

/// OAuth bearer token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    /// Wrap a raw token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building request headers.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

// =============================================================================
// Subscription Transport
// =============================================================================

/// Subscribe call parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    /// Streaming context the subscription belongs to.
    pub context_id: String,
    /// Client-assigned reference id for the new subscription.
    pub reference_id: ReferenceId,
    /// Subscription this one supersedes, sent on server-requested resets.
    pub replace_reference_id: Option<ReferenceId>,
    /// What to subscribe to.
    pub scope: SubscriptionScope,
}

/// Subscribe call result.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeResponse {
    /// Reference id the server registered.
    pub reference_id: ReferenceId,
    /// Longest gap between messages before the subscription counts as stale.
    /// Zero disables the check.
    pub inactivity_timeout: Duration,
    /// Initial state.
    pub snapshot: Value,
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Request could not be sent or the response could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// Server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Response body did not have the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),

    /// No credential is available.
    #[error("no access token available")]
    Unauthenticated,

    /// The reference id does not name a subscription kind this client created.
    #[error("cannot route reference id {0}")]
    UnroutableReference(String),
}

/// Creates and removes server-side subscriptions.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    /// Create a subscription and return its snapshot.
    async fn subscribe(&self, request: SubscribeRequest)
    -> Result<SubscribeResponse, TransportError>;

    /// Remove one subscription.
    async fn unsubscribe(
        &self,
        context_id: &str,
        reference_id: &ReferenceId,
    ) -> Result<(), TransportError>;

    /// Remove every subscription of a context.
    async fn unsubscribe_all(&self, context_id: &str) -> Result<(), TransportError>;

    /// Re-authorize an open streaming connection with a fresh token.
    async fn reauthorize(&self, context_id: &str, token: &BearerToken)
    -> Result<(), TransportError>;
}
