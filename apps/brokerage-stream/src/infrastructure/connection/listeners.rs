//! Listener registry.
//!
//! Registrations are keyed by a [`ListenerId`] token handed out at
//! registration time, so the same closure can be registered twice and each
//! registration removed on its own. Callbacks run outside the registry lock
//! and may register or remove listeners themselves.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::types::{ConnectionEvent, ConnectionEventKind};

/// Listener callback.
pub type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Registration token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Registration {
    kind: ConnectionEventKind,
    listener: Listener,
    once: bool,
}

/// Persistent and one-shot listeners, dispatched in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<ListenerId, Registration>>,
}

impl ListenerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for every event of `kind`.
    pub fn add(&self, kind: ConnectionEventKind, listener: Listener) -> ListenerId {
        self.register(kind, listener, false)
    }

    /// Register for the next event of `kind` only.
    pub fn once(&self, kind: ConnectionEventKind, listener: Listener) -> ListenerId {
        self.register(kind, listener, true)
    }

    /// Whether a token is still registered.
    #[must_use]
    pub fn has(&self, id: ListenerId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Unregister one token.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Unregister everything of `kind`, or everything when `kind` is `None`.
    pub fn remove_all(&self, kind: Option<ConnectionEventKind>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| kind.is_some_and(|kind| entry.kind != kind));
        before - entries.len()
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Deliver `event` to every matching listener. One-shot registrations are
    /// removed before any callback runs, so they fire exactly once even under
    /// concurrent dispatch.
    pub(crate) fn dispatch(&self, event: &ConnectionEvent) -> usize {
        let kind = event.kind();
        let targets: Vec<Listener> = {
            let mut entries = self.entries.lock();
            let matching: Vec<ListenerId> = entries
                .iter()
                .filter(|(_, entry)| entry.kind == kind)
                .map(|(id, _)| *id)
                .collect();
            matching
                .into_iter()
                .filter_map(|id| {
                    let entry = entries.get(&id)?;
                    if entry.once {
                        entries.remove(&id).map(|entry| entry.listener)
                    } else {
                        Some(Arc::clone(&entry.listener))
                    }
                })
                .collect()
        };

        for listener in &targets {
            listener(event);
        }
        targets.len()
    }

    fn register(&self, kind: ConnectionEventKind, listener: Listener, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(
            id,
            Registration {
                kind,
                listener,
                once,
            },
        );
        id
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("registrations", &self.len())
            .finish()
    }
}
