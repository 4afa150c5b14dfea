//! Inactivity Monitor
//!
//! Fires callbacks when a connection has been silent for a configured
//! duration. There is one authoritative last-activity instant; each watcher
//! derives its deadline as `last_touched + timeout` and recomputes it whenever
//! activity is recorded. A watcher added after activity started therefore
//! fires after the remaining time, not the full timeout.
//!
//! A watcher fires at most once per idle period and rearms on the next touch.
//! Registrations outlive bindings: closing the monitor cancels every timer,
//! and binding it again restarts them from the new open instant.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::types::ConnectionStatus;

/// Inactivity callback.
pub type InactivityCallback = Arc<dyn Fn() + Send + Sync>;

/// Watcher registration token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u64);

/// Monitor errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// Already attached to a connection.
    #[error("inactivity monitor already bound to generation {0}")]
    AlreadyBound(u64),
    /// The connection is not open.
    #[error("cannot bind inactivity monitor to a {0} connection")]
    NotOpen(ConnectionStatus),
}

struct Watcher {
    timeout: Duration,
    callback: InactivityCallback,
}

struct Binding {
    generation: u64,
    activity: watch::Sender<Instant>,
    timers: BTreeMap<WatcherId, JoinHandle<()>>,
}

impl Binding {
    fn spawn(&mut self, id: WatcherId, watcher: &Watcher) {
        let handle = tokio::spawn(run_watcher(
            self.activity.subscribe(),
            watcher.timeout,
            Arc::clone(&watcher.callback),
        ));
        if let Some(previous) = self.timers.insert(id, handle) {
            previous.abort();
        }
    }

    fn cancel(self) {
        for handle in self.timers.into_values() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct MonitorState {
    watchers: BTreeMap<WatcherId, Watcher>,
    binding: Option<Binding>,
}

/// Idle-time watcher for one open connection at a time.
#[derive(Default)]
pub struct InactivityMonitor {
    next_id: AtomicU64,
    state: Mutex<MonitorState>,
}

impl InactivityMonitor {
    /// Unbound monitor with no watchers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to an open connection. The open instant counts as activity.
    ///
    /// # Errors
    ///
    /// Fails if already bound or if `status` is not `Open`.
    pub fn open(&self, generation: u64, status: ConnectionStatus) -> Result<(), MonitorError> {
        if status != ConnectionStatus::Open {
            return Err(MonitorError::NotOpen(status));
        }
        let mut state = self.state.lock();
        if let Some(binding) = &state.binding {
            return Err(MonitorError::AlreadyBound(binding.generation));
        }

        let (activity, _) = watch::channel(Instant::now());
        let mut binding = Binding {
            generation,
            activity,
            timers: BTreeMap::new(),
        };
        for (id, watcher) in &state.watchers {
            binding.spawn(*id, watcher);
        }
        state.binding = Some(binding);
        Ok(())
    }

    /// Detach and cancel every timer. Registrations are kept.
    pub fn close(&self) {
        let binding = self.state.lock().binding.take();
        if let Some(binding) = binding {
            binding.cancel();
        }
    }

    /// Record activity now. No-op while unbound.
    pub fn touch(&self) {
        if let Some(binding) = &self.state.lock().binding {
            binding.activity.send_replace(Instant::now());
        }
    }

    /// Fire `callback` after `timeout` without activity.
    pub fn add(&self, timeout: Duration, callback: InactivityCallback) -> WatcherId {
        let id = WatcherId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let watcher = Watcher { timeout, callback };
        let mut state = self.state.lock();
        let state = &mut *state;
        if let Some(binding) = state.binding.as_mut() {
            binding.spawn(id, &watcher);
        }
        state.watchers.insert(id, watcher);
        id
    }

    /// Unregister a watcher and cancel its timer.
    pub fn remove(&self, id: WatcherId) -> bool {
        let mut state = self.state.lock();
        if let Some(handle) = state
            .binding
            .as_mut()
            .and_then(|binding| binding.timers.remove(&id))
        {
            handle.abort();
        }
        state.watchers.remove(&id).is_some()
    }

    /// Generation of the bound connection.
    #[must_use]
    pub fn bound_generation(&self) -> Option<u64> {
        self.state.lock().binding.as_ref().map(|b| b.generation)
    }

    /// Last recorded activity while bound.
    #[must_use]
    pub fn last_touched(&self) -> Option<Instant> {
        self.state
            .lock()
            .binding
            .as_ref()
            .map(|binding| *binding.activity.borrow())
    }
}

impl Drop for InactivityMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for InactivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InactivityMonitor")
            .field("watchers", &state.watchers.len())
            .field("bound", &state.binding.as_ref().map(|b| b.generation))
            .finish()
    }
}

async fn run_watcher(
    mut activity: watch::Receiver<Instant>,
    timeout: Duration,
    callback: InactivityCallback,
) {
    if timeout.is_zero() {
        return;
    }
    loop {
        let deadline = *activity.borrow_and_update() + timeout;
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                callback();
                // one fire per idle period
                if activity.changed().await.is_err() {
                    return;
                }
            }
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
