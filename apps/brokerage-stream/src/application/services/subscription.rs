//! Subscription Handles
//!
//! A [`Subscription`] is the caller-visible face of one logical subscription.
//! Its identity and state survive reconnects and server-requested resets; only
//! the server reference id behind it changes.
//!
//! Handles are read-only for callers. The owning context's actor is the only
//! writer and reaches them through the crate-private [`ManagedSubscription`]
//! trait, which erases the state type so one ordered registry can hold
//! balances, collections and prices side by side.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::domain::merge::{MergeError, StreamState};
use crate::domain::subscription::{ReferenceId, SubscriptionScope};
use crate::error::StreamError;

const EVENT_CAPACITY: usize = 256;

/// Stable subscription identity, independent of the server reference id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Events published to subscription observers.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent<S> {
    /// New state after a snapshot or delta.
    Message(Arc<S>),
    /// Terminal event. Carries the error that disposed the context, if any.
    Disposed(Option<StreamError>),
}

struct Slot<S> {
    value: Option<Arc<S>>,
    disposed: bool,
    cause: Option<StreamError>,
}

struct Shared<S> {
    id: SubscriptionId,
    scope: SubscriptionScope,
    reference_id: RwLock<ReferenceId>,
    slot: RwLock<Slot<S>>,
    events: broadcast::Sender<SubscriptionEvent<S>>,
}

/// Handle to one logical subscription.
pub struct Subscription<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Subscription<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: StreamState> Subscription<S> {
    pub(crate) fn new(id: u64, scope: SubscriptionScope, reference_id: ReferenceId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                id: SubscriptionId(id),
                scope,
                reference_id: RwLock::new(reference_id),
                slot: RwLock::new(Slot {
                    value: None,
                    disposed: false,
                    cause: None,
                }),
                events,
            }),
        }
    }

    /// Stable identity.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    /// What this subscription streams.
    #[must_use]
    pub fn scope(&self) -> &SubscriptionScope {
        &self.shared.scope
    }

    /// Reference id the server currently knows this subscription by.
    #[must_use]
    pub fn reference_id(&self) -> ReferenceId {
        self.shared.reference_id.read().clone()
    }

    /// Latest state.
    ///
    /// # Errors
    ///
    /// Returns the disposal cause (or [`StreamError::Disposed`]) once disposed,
    /// and [`StreamError::NotReady`] before the first snapshot.
    pub fn current(&self) -> Result<Arc<S>, StreamError> {
        let slot = self.shared.slot.read();
        if slot.disposed {
            return Err(slot.cause.clone().unwrap_or(StreamError::Disposed));
        }
        slot.value
            .clone()
            .ok_or_else(|| StreamError::NotReady(self.shared.scope.to_string()))
    }

    /// Whether the owning context has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.slot.read().disposed
    }

    /// Receive every future event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SubscriptionEvent<S>> {
        self.shared.events.subscribe()
    }

    /// Future events as a stream. Observers that fall behind skip the events
    /// they missed; the latest state is always available from [`Self::current`].
    pub fn stream(&self) -> impl Stream<Item = SubscriptionEvent<S>> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(Result::ok)
    }

    fn publish(&self, next: S) {
        let next = Arc::new(next);
        self.shared.slot.write().value = Some(Arc::clone(&next));
        // no receivers is fine
        let _ = self.shared.events.send(SubscriptionEvent::Message(next));
    }
}

impl<S> fmt::Debug for Subscription<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("scope", &self.shared.scope)
            .field("reference_id", &*self.shared.reference_id.read())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Actor-side access
// =============================================================================

/// Type-erased write access used by the owning context.
pub(crate) trait ManagedSubscription: Send + Sync {
    fn id(&self) -> SubscriptionId;
    fn scope(&self) -> &SubscriptionScope;
    fn reference_id(&self) -> ReferenceId;
    fn set_reference_id(&self, reference_id: ReferenceId);
    /// Replace the state wholesale.
    fn apply_snapshot(&self, snapshot: &Value) -> Result<(), MergeError>;
    /// Merge one delta onto the current state.
    fn apply_delta(&self, payload: &Value) -> Result<(), MergeError>;
    /// Mark disposed and publish the terminal event. Later calls are ignored.
    fn dispose(&self, cause: Option<StreamError>);
}

impl<S: StreamState> ManagedSubscription for Subscription<S> {
    fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    fn scope(&self) -> &SubscriptionScope {
        &self.shared.scope
    }

    fn reference_id(&self) -> ReferenceId {
        self.shared.reference_id.read().clone()
    }

    fn set_reference_id(&self, reference_id: ReferenceId) {
        *self.shared.reference_id.write() = reference_id;
    }

    fn apply_snapshot(&self, snapshot: &Value) -> Result<(), MergeError> {
        let next = S::from_snapshot(snapshot)?;
        self.publish(next);
        Ok(())
    }

    fn apply_delta(&self, payload: &Value) -> Result<(), MergeError> {
        let previous = self.shared.slot.read().value.clone();
        let next = match previous {
            Some(previous) => previous.apply_delta(payload)?,
            None => S::from_snapshot(payload)?,
        };
        self.publish(next);
        Ok(())
    }

    fn dispose(&self, cause: Option<StreamError>) {
        {
            let mut slot = self.shared.slot.write();
            if slot.disposed {
                return;
            }
            slot.disposed = true;
            slot.cause.clone_from(&cause);
        }
        let _ = self.shared.events.send(SubscriptionEvent::Disposed(cause));
    }
}
