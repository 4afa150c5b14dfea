//! Control messages carried on reserved reference ids.
//!
//! Reserved ids start with an underscore and are never routed to a
//! subscription handler.

use serde::Deserialize;
use serde_json::Value;

use super::codec::{CodecError, StreamMessage};

/// Periodic liveness signal for idle subscriptions.
pub const HEARTBEAT_REFERENCE_ID: &str = "_heartbeat";

/// Server request to drop and re-establish the connection.
pub const DISCONNECT_REFERENCE_ID: &str = "_disconnect";

/// Server request to re-create some or all subscriptions.
pub const RESET_SUBSCRIPTIONS_REFERENCE_ID: &str = "_resetsubscriptions";

/// Why a heartbeat was sent for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HeartbeatReason {
    /// Subscription is healthy but has nothing new.
    NoNewData,
    /// Subscription is paused server side and may resume.
    SubscriptionTemporarilyDisabled,
    /// Subscription will never deliver again.
    SubscriptionPermanentlyDisabled,
    /// Reason not known to this client.
    #[serde(other)]
    Unknown,
}

/// One heartbeat entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Heartbeat {
    /// Subscription the heartbeat is for.
    pub originating_reference_id: String,
    /// Reason code.
    pub reason: HeartbeatReason,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HeartbeatEnvelope {
    #[serde(default)]
    heartbeats: Vec<Heartbeat>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResetEnvelope {
    #[serde(default)]
    target_reference_ids: Vec<String>,
}

/// Parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Liveness signals, in payload order.
    Heartbeat(Vec<Heartbeat>),
    /// Reconnect now.
    Disconnect,
    /// Re-create the listed subscriptions; empty means all.
    ResetSubscriptions {
        /// Reference ids to reset.
        targets: Vec<String>,
    },
    /// Reserved id this client does not handle.
    Unrecognized(String),
}

impl ControlMessage {
    /// Parse a decoded message into a control message.
    ///
    /// Returns `Ok(None)` for ordinary subscription traffic.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidControl`] when a heartbeat or reset
    /// payload does not have the documented shape.
    pub fn parse(message: &StreamMessage) -> Result<Option<Self>, CodecError> {
        if !message.is_control() {
            return Ok(None);
        }

        let invalid = |e: serde_json::Error| CodecError::InvalidControl {
            reference_id: message.reference_id.clone(),
            message: e.to_string(),
        };

        let parsed = match message.reference_id.as_str() {
            HEARTBEAT_REFERENCE_ID => {
                let envelopes: Vec<HeartbeatEnvelope> =
                    entries(&message.payload).map_err(invalid)?;
                Self::Heartbeat(envelopes.into_iter().flat_map(|e| e.heartbeats).collect())
            }
            DISCONNECT_REFERENCE_ID => Self::Disconnect,
            RESET_SUBSCRIPTIONS_REFERENCE_ID => {
                let envelopes: Vec<ResetEnvelope> = entries(&message.payload).map_err(invalid)?;
                Self::ResetSubscriptions {
                    targets: envelopes
                        .into_iter()
                        .flat_map(|e| e.target_reference_ids)
                        .collect(),
                }
            }
            other => Self::Unrecognized(other.to_string()),
        };

        Ok(Some(parsed))
    }
}

/// Control payloads arrive either as an array of envelopes or a single one.
fn entries<T: for<'de> Deserialize<'de>>(payload: &Value) -> Result<Vec<T>, serde_json::Error> {
    match payload {
        Value::Array(_) => serde_json::from_value(payload.clone()),
        Value::Null => Ok(Vec::new()),
        other => serde_json::from_value(other.clone()).map(|one| vec![one]),
    }
}
