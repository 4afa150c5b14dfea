//! Streaming Context
//!
//! Orchestrates one streaming session: a single [`Connection`], one
//! subscription per requested scope, and an actor task that owns every piece
//! of mutable session state.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──► Active ──► Reconnecting ──► Active ──► ... ──► Disposed
//! ```
//!
//! [`StreamingContext::open`] connects and establishes every subscription
//! before returning. From then on the actor processes, strictly in order:
//!
//! - inbound frames (decoded, then routed by reference id)
//! - close/error events of the current socket (stale generations are dropped)
//! - context-wide inactivity from the connection's monitor
//! - a periodic per-subscription staleness check
//! - credential changes, which re-authorize the open connection in place
//!
//! A fatal error (framing, payload validation, permanent disablement, backoff
//! exhaustion) ends the actor. Teardown then removes the server-side
//! subscriptions, closes the socket and hands the error to every subscription
//! handle and every later accessor call.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::subscription::{ManagedSubscription, Subscription};
use crate::application::ports::{BearerToken, SubscribeRequest, SubscriptionTransport};
use crate::domain::entities::{Balance, ClosedPositions, Orders, Positions, Price};
use crate::domain::merge::{MergeError, StreamState};
use crate::domain::subscription::{
    Instrument, ReferenceId, StreamRequest, SubscriptionKind, SubscriptionScope,
};
use crate::error::StreamError;
use crate::infrastructure::connection::{
    CloseOptions, ConnectOptions, Connection, ConnectionConfig, ConnectionEvent,
    ConnectionEventKind, ConnectionStatus,
};
use crate::infrastructure::metrics::{self, MessageKind, ReconnectReason};
use crate::infrastructure::stream::{
    Backoff, BackoffConfig, ControlMessage, FrameCodec, Heartbeat, HeartbeatReason,
    StreamMessage, connect_url,
};

// =============================================================================
// Configuration
// =============================================================================

/// Context settings.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Streaming base URL; `/connect` is appended.
    pub streaming_url: Url,
    /// Context id. A random one is generated when unset.
    pub context_id: Option<String>,
    /// Websocket handshake timeout.
    pub connect_timeout: Duration,
    /// How long to wait for close handshakes and teardown calls.
    pub close_timeout: Duration,
    /// How often subscription staleness is checked.
    pub heartbeat_check_interval: Duration,
    /// Reconnect after this long without any inbound traffic. Zero disables.
    pub context_inactivity_timeout: Duration,
    /// Backoff between failed connect attempts.
    pub reconnect: BackoffConfig,
}

impl ContextConfig {
    /// Defaults for `streaming_url`.
    #[must_use]
    pub fn new(streaming_url: Url) -> Self {
        Self {
            streaming_url,
            context_id: None,
            connect_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            heartbeat_check_interval: Duration::from_secs(1),
            context_inactivity_timeout: Duration::from_secs(120),
            reconnect: BackoffConfig::default(),
        }
    }
}

/// Random context id: 32 lowercase hex characters.
fn generate_context_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Context lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Initial connect and subscription establishment.
    Connecting,
    /// Streaming.
    Active,
    /// Replacing the socket and re-establishing subscriptions.
    Reconnecting,
    /// Terminal.
    Disposed,
}

// =============================================================================
// Handles
// =============================================================================

struct Handles {
    balance: Subscription<Balance>,
    account_balances: Vec<(String, Subscription<Balance>)>,
    orders: Subscription<Orders>,
    positions: Subscription<Positions>,
    closed_positions: Subscription<ClosedPositions>,
    prices: Vec<(Instrument, Subscription<Price>)>,
}

struct Registrar<'a> {
    sequence: &'a mut u64,
    ordered: Vec<Arc<dyn ManagedSubscription>>,
}

impl Registrar<'_> {
    fn register<S: StreamState>(&mut self, scope: SubscriptionScope) -> Subscription<S> {
        *self.sequence += 1;
        let id = u64::try_from(self.ordered.len()).unwrap_or(u64::MAX);
        let reference_id = ReferenceId::generate(scope.kind(), *self.sequence);
        let subscription = Subscription::new(id, scope, reference_id);
        self.ordered.push(Arc::new(subscription.clone()));
        subscription
    }
}

impl Handles {
    /// Create one handle per scope, in establishment order.
    fn build(
        request: &StreamRequest,
        sequence: &mut u64,
    ) -> (Self, Vec<Arc<dyn ManagedSubscription>>) {
        let client_key = &request.client_key;
        let mut registrar = Registrar {
            sequence,
            ordered: Vec::new(),
        };

        let balance = registrar.register(SubscriptionScope::Balance {
            client_key: client_key.clone(),
            account_key: None,
        });
        let account_balances = request
            .account_keys
            .iter()
            .map(|account_key| {
                let handle = registrar.register(SubscriptionScope::Balance {
                    client_key: client_key.clone(),
                    account_key: Some(account_key.clone()),
                });
                (account_key.clone(), handle)
            })
            .collect();
        let orders = registrar.register(SubscriptionScope::Orders {
            client_key: client_key.clone(),
        });
        let positions = registrar.register(SubscriptionScope::Positions {
            client_key: client_key.clone(),
        });
        let closed_positions = registrar.register(SubscriptionScope::ClosedPositions {
            client_key: client_key.clone(),
        });
        let prices = request
            .instruments
            .iter()
            .map(|instrument| {
                let handle = registrar.register(SubscriptionScope::Price {
                    instrument: instrument.clone(),
                });
                (instrument.clone(), handle)
            })
            .collect();

        let handles = Self {
            balance,
            account_balances,
            orders,
            positions,
            closed_positions,
            prices,
        };
        (handles, registrar.ordered)
    }
}

// =============================================================================
// Streaming Context
// =============================================================================

struct ContextShared {
    context_id: String,
    state: RwLock<ContextState>,
    fatal: RwLock<Option<StreamError>>,
    cancel: CancellationToken,
    terminated: CancellationToken,
    actor: Mutex<Option<JoinHandle<()>>>,
    disposal: OnceCell<Result<(), StreamError>>,
    connection: Connection,
    handles: Handles,
}

impl ContextShared {
    fn set_state(&self, state: ContextState) {
        *self.state.write() = state;
    }
}

/// A live streaming session. Cheap to clone; all clones share the session.
///
/// Dropping the last clone tears the session down in the background, as if
/// [`StreamingContext::dispose`] had been called without waiting.
#[derive(Clone)]
pub struct StreamingContext {
    shared: Arc<ContextShared>,
    _release: Arc<DropGuard>,
}

impl StreamingContext {
    /// Connect and establish every subscription `request` names.
    ///
    /// Returns once every snapshot has been applied. Credentials are read from
    /// `credentials` for the connect URL, and every later change re-authorizes
    /// the open connection.
    ///
    /// # Errors
    ///
    /// Returns the first connect, subscribe or snapshot validation error.
    /// Everything acquired so far is released before returning.
    pub async fn open(
        config: ContextConfig,
        request: StreamRequest,
        transport: Arc<dyn SubscriptionTransport>,
        credentials: watch::Receiver<Option<BearerToken>>,
    ) -> Result<Self, StreamError> {
        let context_id = config
            .context_id
            .clone()
            .unwrap_or_else(generate_context_id);
        let mut sequence = 0;
        let (handles, ordered) = Handles::build(&request, &mut sequence);

        let connection = Connection::new(ConnectionConfig {
            url: None,
            binary: true,
            connect_timeout: config.connect_timeout,
            close_timeout: config.close_timeout,
        });
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        for kind in [
            ConnectionEventKind::Message,
            ConnectionEventKind::Close,
            ConnectionEventKind::Error,
        ] {
            let tx = inbox_tx.clone();
            connection.add(
                kind,
                Arc::new(move |event: &ConnectionEvent| {
                    let _ = tx.send(Input::Connection(event.clone()));
                }),
            );
        }
        if !config.context_inactivity_timeout.is_zero() {
            let tx = inbox_tx;
            connection.monitor().add(
                config.context_inactivity_timeout,
                Arc::new(move || {
                    let _ = tx.send(Input::Inactive);
                }),
            );
        }

        let shared = Arc::new(ContextShared {
            context_id,
            state: RwLock::new(ContextState::Connecting),
            fatal: RwLock::new(None),
            cancel: CancellationToken::new(),
            terminated: CancellationToken::new(),
            actor: Mutex::new(None),
            disposal: OnceCell::new(),
            connection,
            handles,
        });

        let mut actor = Actor {
            shared: Arc::clone(&shared),
            entries: ordered
                .into_iter()
                .map(|subscription| Entry {
                    subscription,
                    inactivity_timeout: Duration::ZERO,
                    touched_at: Instant::now(),
                })
                .collect(),
            config,
            transport,
            credentials,
            inbox,
            codec: FrameCodec::new(),
            sequence,
            last_message_id: None,
            orphans: HashSet::new(),
            reconnects: 0,
        };

        info!(
            context_id = %shared.context_id,
            subscriptions = actor.entries.len(),
            "opening streaming context"
        );
        if let Err(e) = actor.activate().await {
            actor.teardown(Some(e.clone())).await;
            return Err(e);
        }

        let handle = tokio::spawn(actor.run());
        *shared.actor.lock() = Some(handle);
        let release = Arc::new(shared.cancel.clone().drop_guard());
        Ok(Self {
            shared,
            _release: release,
        })
    }

    /// Context id sent on the connect URL and every subscribe call.
    #[must_use]
    pub fn context_id(&self) -> &str {
        &self.shared.context_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContextState {
        *self.shared.state.read()
    }

    /// Status of the underlying connection.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.connection.status()
    }

    /// The error that disposed the context, if any.
    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.shared.fatal.read().clone()
    }

    /// Resolves once the context has fully torn down, for any reason.
    pub async fn terminated(&self) {
        self.shared.terminated.cancelled().await;
    }

    /// Tear everything down. Idempotent: concurrent and repeated callers all
    /// wait for the same teardown and get the same result.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that ended the context, if one was recorded.
    /// Cancellation is not an error.
    pub async fn dispose(&self) -> Result<(), StreamError> {
        self.shared
            .disposal
            .get_or_init(|| async {
                self.shared.cancel.cancel();
                let handle = self.shared.actor.lock().take();
                if let Some(handle) = handle
                    && let Err(e) = handle.await
                {
                    error!(context_id = %self.shared.context_id, error = %e, "streaming actor ended abnormally");
                    self.shared.connection.dispose().await;
                    self.shared.set_state(ContextState::Disposed);
                    self.shared.terminated.cancel();
                }
                self.error().map_or(Ok(()), Err)
            })
            .await
            .clone()
    }

    fn ensure_live(&self) -> Result<(), StreamError> {
        if let Some(e) = self.error() {
            return Err(e);
        }
        if self.shared.cancel.is_cancelled() || self.state() == ContextState::Disposed {
            return Err(StreamError::Disposed);
        }
        Ok(())
    }

    // =========================================================================
    // State accessors
    // =========================================================================

    /// Client-level balance.
    ///
    /// # Errors
    ///
    /// Fails once the context is disposed.
    pub fn balance(&self) -> Result<Arc<Balance>, StreamError> {
        self.ensure_live()?;
        self.shared.handles.balance.current()
    }

    /// Balance of one requested account.
    ///
    /// # Errors
    ///
    /// Fails once the context is disposed, or with `UnknownScope` when the
    /// account was not requested.
    pub fn account_balance(&self, account_key: &str) -> Result<Arc<Balance>, StreamError> {
        self.ensure_live()?;
        self.account_balance_subscription(account_key)
            .ok_or_else(|| StreamError::UnknownScope(format!("balance[{account_key}]")))?
            .current()
    }

    /// Open orders.
    ///
    /// # Errors
    ///
    /// Fails once the context is disposed.
    pub fn orders(&self) -> Result<Arc<Orders>, StreamError> {
        self.ensure_live()?;
        self.shared.handles.orders.current()
    }

    /// Open positions.
    ///
    /// # Errors
    ///
    /// Fails once the context is disposed.
    pub fn positions(&self) -> Result<Arc<Positions>, StreamError> {
        self.ensure_live()?;
        self.shared.handles.positions.current()
    }

    /// Closed positions.
    ///
    /// # Errors
    ///
    /// Fails once the context is disposed.
    pub fn closed_positions(&self) -> Result<Arc<ClosedPositions>, StreamError> {
        self.ensure_live()?;
        self.shared.handles.closed_positions.current()
    }

    /// Price of one requested instrument.
    ///
    /// # Errors
    ///
    /// Fails once the context is disposed, or with `UnknownScope` when the
    /// instrument was not requested.
    pub fn price(&self, instrument: &Instrument) -> Result<Arc<Price>, StreamError> {
        self.ensure_live()?;
        self.price_subscription(instrument)
            .ok_or_else(|| StreamError::UnknownScope(format!("price[{instrument}]")))?
            .current()
    }

    // =========================================================================
    // Subscription handles
    // =========================================================================

    /// Client balance subscription.
    #[must_use]
    pub fn balance_subscription(&self) -> &Subscription<Balance> {
        &self.shared.handles.balance
    }

    /// Per-account balance subscription.
    #[must_use]
    pub fn account_balance_subscription(&self, account_key: &str) -> Option<&Subscription<Balance>> {
        self.shared
            .handles
            .account_balances
            .iter()
            .find(|(key, _)| key == account_key)
            .map(|(_, handle)| handle)
    }

    /// Orders subscription.
    #[must_use]
    pub fn orders_subscription(&self) -> &Subscription<Orders> {
        &self.shared.handles.orders
    }

    /// Positions subscription.
    #[must_use]
    pub fn positions_subscription(&self) -> &Subscription<Positions> {
        &self.shared.handles.positions
    }

    /// Closed positions subscription.
    #[must_use]
    pub fn closed_positions_subscription(&self) -> &Subscription<ClosedPositions> {
        &self.shared.handles.closed_positions
    }

    /// Price subscription for one instrument.
    #[must_use]
    pub fn price_subscription(&self, instrument: &Instrument) -> Option<&Subscription<Price>> {
        self.shared
            .handles
            .prices
            .iter()
            .find(|(candidate, _)| candidate == instrument)
            .map(|(_, handle)| handle)
    }
}

impl std::fmt::Debug for StreamingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingContext")
            .field("context_id", &self.shared.context_id)
            .field("state", &self.state())
            .field("connection", &self.shared.connection.status())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Actor
// =============================================================================

enum Input {
    Connection(ConnectionEvent),
    Inactive,
}

struct Entry {
    subscription: Arc<dyn ManagedSubscription>,
    inactivity_timeout: Duration,
    touched_at: Instant,
}

struct Actor {
    shared: Arc<ContextShared>,
    config: ContextConfig,
    transport: Arc<dyn SubscriptionTransport>,
    credentials: watch::Receiver<Option<BearerToken>>,
    inbox: mpsc::UnboundedReceiver<Input>,
    codec: FrameCodec,
    entries: Vec<Entry>,
    sequence: u64,
    last_message_id: Option<u64>,
    orphans: HashSet<String>,
    reconnects: u64,
}

impl Actor {
    async fn activate(&mut self) -> Result<(), StreamError> {
        self.establish_socket(false).await?;
        self.subscribe_all(false).await?;
        metrics::add_active_subscriptions(subscription_count(self.entries.len()));
        self.shared.set_state(ContextState::Active);
        info!(context_id = %self.shared.context_id, "streaming context active");
        Ok(())
    }

    async fn run(mut self) {
        let mut staleness = tokio::time::interval(self.config.heartbeat_check_interval);
        staleness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        staleness.reset();
        let mut watch_credentials = true;

        let cause = loop {
            let reconnects = self.reconnects;
            let outcome = tokio::select! {
                biased;
                () = self.shared.cancel.cancelled() => break None,
                input = self.inbox.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => break None,
                },
                changed = self.credentials.changed(), if watch_credentials => {
                    if changed.is_ok() {
                        self.reauthorize().await;
                    } else {
                        watch_credentials = false;
                    }
                    Ok(())
                }
                _ = staleness.tick() => self.check_staleness().await,
            };
            if let Err(e) = outcome {
                break Some(e);
            }
            if self.reconnects != reconnects {
                staleness.reset();
            }
        };

        self.teardown(cause).await;
    }

    async fn handle(&mut self, input: Input) -> Result<(), StreamError> {
        let event = match input {
            Input::Inactive => return self.on_inactive().await,
            Input::Connection(event) => event,
        };
        if event.generation() != self.shared.connection.generation() {
            trace!(generation = event.generation(), "dropping event from replaced socket");
            return Ok(());
        }
        match event {
            ConnectionEvent::Message { frame, .. } => self.on_frame(frame.as_bytes()).await,
            ConnectionEvent::Close { code, reason, .. } => {
                if self.shared.cancel.is_cancelled() {
                    return Ok(());
                }
                warn!(context_id = %self.shared.context_id, ?code, %reason, "streaming socket closed");
                self.reconnect(ReconnectReason::SocketClosed).await
            }
            ConnectionEvent::Error { message, .. } => {
                if message.to_ascii_lowercase().contains("reset") {
                    warn!(context_id = %self.shared.context_id, error = %message, "streaming socket reset");
                    self.reconnect(ReconnectReason::SocketClosed).await
                } else {
                    debug!(context_id = %self.shared.context_id, error = %message, "streaming socket error");
                    Ok(())
                }
            }
            ConnectionEvent::Open { .. } => Ok(()),
        }
    }

    /// The monitor may report a socket that has since been replaced; only act
    /// when the current binding has actually been idle that long.
    async fn on_inactive(&mut self) -> Result<(), StreamError> {
        let timeout = self.config.context_inactivity_timeout;
        let idle = self
            .shared
            .connection
            .monitor()
            .last_touched()
            .is_some_and(|at| at.elapsed() >= timeout);
        if !idle {
            return Ok(());
        }
        warn!(context_id = %self.shared.context_id, ?timeout, "no traffic on streaming connection");
        self.reconnect(ReconnectReason::ContextInactive).await
    }

    async fn on_frame(&mut self, data: &[u8]) -> Result<(), StreamError> {
        metrics::record_frame();
        let messages = self.codec.decode(data)?;
        let generation = self.shared.connection.generation();
        for message in messages {
            self.last_message_id = Some(message.message_id);
            self.route(message).await?;
            if self.shared.connection.generation() != generation {
                debug!("connection replaced mid-frame; dropping the rest of it");
                break;
            }
        }
        Ok(())
    }

    async fn route(&mut self, message: StreamMessage) -> Result<(), StreamError> {
        match ControlMessage::parse(&message)? {
            Some(ControlMessage::Heartbeat(heartbeats)) => {
                metrics::record_message(MessageKind::Heartbeat);
                self.on_heartbeats(&heartbeats)
            }
            Some(ControlMessage::Disconnect) => {
                metrics::record_message(MessageKind::Disconnect);
                info!(context_id = %self.shared.context_id, "server requested disconnect");
                self.reconnect(ReconnectReason::ServerDisconnect).await
            }
            Some(ControlMessage::ResetSubscriptions { targets }) => {
                metrics::record_message(MessageKind::ResetSubscriptions);
                self.reset_subscriptions(&targets).await
            }
            Some(ControlMessage::Unrecognized(reference_id)) => {
                metrics::record_message(MessageKind::UnrecognizedControl);
                warn!(%reference_id, "ignoring unrecognized control message");
                Ok(())
            }
            None => {
                metrics::record_message(MessageKind::Data);
                self.apply_update(message)
            }
        }
    }

    fn on_heartbeats(&mut self, heartbeats: &[Heartbeat]) -> Result<(), StreamError> {
        for heartbeat in heartbeats {
            let Some(index) = self.find(&heartbeat.originating_reference_id) else {
                trace!(reference_id = %heartbeat.originating_reference_id, "heartbeat for unknown subscription");
                continue;
            };
            match heartbeat.reason {
                HeartbeatReason::SubscriptionPermanentlyDisabled => {
                    return Err(StreamError::SubscriptionDisabled {
                        reference_id: heartbeat.originating_reference_id.clone(),
                    });
                }
                HeartbeatReason::SubscriptionTemporarilyDisabled => {
                    debug!(reference_id = %heartbeat.originating_reference_id, "subscription temporarily disabled");
                }
                HeartbeatReason::Unknown => {
                    debug!(reference_id = %heartbeat.originating_reference_id, "heartbeat with unknown reason");
                }
                HeartbeatReason::NoNewData => {}
            }
            self.entries[index].touched_at = Instant::now();
        }
        Ok(())
    }

    fn apply_update(&mut self, message: StreamMessage) -> Result<(), StreamError> {
        let Some(index) = self.find(&message.reference_id) else {
            self.remove_orphan(message.reference_id);
            return Ok(());
        };
        let entry = &mut self.entries[index];
        entry.touched_at = Instant::now();
        entry
            .subscription
            .apply_delta(&message.payload)
            .map_err(|e| payload_error(&message.reference_id, &message.payload, e))?;
        metrics::record_delta_applied(entry.subscription.scope().kind());
        trace!(reference_id = %message.reference_id, message_id = message.message_id, "delta applied");
        Ok(())
    }

    /// Ask the server to drop a subscription we no longer know, once per id.
    fn remove_orphan(&mut self, reference_id: String) {
        if !self.orphans.insert(reference_id.clone()) {
            return;
        }
        metrics::record_orphaned_message();
        info!(context_id = %self.shared.context_id, %reference_id, "removing orphaned subscription");

        let transport = Arc::clone(&self.transport);
        let context_id = self.shared.context_id.clone();
        tokio::spawn(async move {
            let reference_id = ReferenceId::new(reference_id);
            if let Err(e) = transport.unsubscribe(&context_id, &reference_id).await {
                debug!(%reference_id, error = %e, "orphan removal failed");
            }
        });
    }

    async fn reset_subscriptions(&mut self, targets: &[String]) -> Result<(), StreamError> {
        let mut indices: Vec<usize> = if targets.is_empty() {
            (0..self.entries.len()).collect()
        } else {
            targets
                .iter()
                .filter_map(|target| {
                    let index = self.find(target);
                    if index.is_none() {
                        debug!(reference_id = %target, "reset target is not a live subscription");
                    }
                    index
                })
                .collect()
        };
        indices.sort_unstable();
        indices.dedup();

        info!(context_id = %self.shared.context_id, count = indices.len(), "resetting subscriptions");
        for index in indices {
            let subscription = Arc::clone(&self.entries[index].subscription);
            let next = self.next_reference_id(subscription.scope().kind());
            self.subscribe_entry(index, next, Some(subscription.reference_id()))
                .await?;
        }
        Ok(())
    }

    async fn check_staleness(&mut self) -> Result<(), StreamError> {
        let now = Instant::now();
        let stale = self.entries.iter().find(|entry| {
            !entry.inactivity_timeout.is_zero()
                && now.duration_since(entry.touched_at) > entry.inactivity_timeout
        });
        if let Some(entry) = stale {
            warn!(
                context_id = %self.shared.context_id,
                reference_id = %entry.subscription.reference_id(),
                timeout = ?entry.inactivity_timeout,
                "subscription missed its heartbeat"
            );
            return self.reconnect(ReconnectReason::SubscriptionInactive).await;
        }
        Ok(())
    }

    async fn reauthorize(&mut self) {
        let token = self.credentials.borrow_and_update().clone();
        let Some(token) = token else {
            return;
        };
        if self.shared.connection.status() != ConnectionStatus::Open {
            return;
        }
        let outcome = tokio::select! {
            biased;
            () = self.shared.cancel.cancelled() => return,
            outcome = self.transport.reauthorize(&self.shared.context_id, &token) => outcome,
        };
        match outcome {
            Ok(()) => debug!(context_id = %self.shared.context_id, "connection re-authorized"),
            Err(e) => warn!(context_id = %self.shared.context_id, error = %e, "re-authorization failed"),
        }
    }

    // =========================================================================
    // Connect and subscribe
    // =========================================================================

    async fn reconnect(&mut self, reason: ReconnectReason) -> Result<(), StreamError> {
        info!(
            context_id = %self.shared.context_id,
            reason = reason.as_str(),
            last_message_id = ?self.last_message_id,
            "reconnecting"
        );
        metrics::record_reconnect(reason);
        self.shared.set_state(ContextState::Reconnecting);

        self.establish_socket(true).await?;
        self.subscribe_all(true).await?;

        self.reconnects += 1;
        self.shared.set_state(ContextState::Active);
        info!(context_id = %self.shared.context_id, "reconnected");
        Ok(())
    }

    /// Open (or replace) the socket, retrying recoverable failures with backoff.
    async fn establish_socket(&mut self, replace: bool) -> Result<(), StreamError> {
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        loop {
            let message_id = if replace { self.last_message_id } else { None };
            let url = self.connect_url(message_id)?;
            let options = ConnectOptions::to(url)
                .with_timeout(self.config.connect_timeout)
                .with_cancel(self.shared.cancel.clone());
            let result = if replace {
                self.shared
                    .connection
                    .reconnect(options, CloseOptions::default())
                    .await
            } else {
                self.shared.connection.connect(options).await
            };
            metrics::set_connection_status(self.shared.connection.status());

            let error = match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_abort() || self.shared.cancel.is_cancelled() => {
                    return Err(StreamError::Cancelled);
                }
                Err(e) if !e.is_recoverable() => return Err(e.into()),
                Err(e) => e,
            };

            let Some(delay) = backoff.next_delay() else {
                return Err(StreamError::ReconnectExhausted {
                    attempts: backoff.attempts(),
                    last_error: error.to_string(),
                });
            };
            warn!(
                context_id = %self.shared.context_id,
                attempt = backoff.attempts(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "connect failed, retrying"
            );
            tokio::select! {
                () = self.shared.cancel.cancelled() => return Err(StreamError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Establish every subscription in order. `fresh` assigns new reference ids.
    async fn subscribe_all(&mut self, fresh: bool) -> Result<(), StreamError> {
        for index in 0..self.entries.len() {
            let kind = self.entries[index].subscription.scope().kind();
            let reference_id = if fresh {
                self.next_reference_id(kind)
            } else {
                self.entries[index].subscription.reference_id()
            };
            self.subscribe_entry(index, reference_id, None).await?;
        }
        Ok(())
    }

    async fn subscribe_entry(
        &mut self,
        index: usize,
        reference_id: ReferenceId,
        replace: Option<ReferenceId>,
    ) -> Result<(), StreamError> {
        let subscription = Arc::clone(&self.entries[index].subscription);
        let request = SubscribeRequest {
            context_id: self.shared.context_id.clone(),
            reference_id,
            replace_reference_id: replace,
            scope: subscription.scope().clone(),
        };

        let response = tokio::select! {
            biased;
            () = self.shared.cancel.cancelled() => return Err(StreamError::Cancelled),
            response = self.transport.subscribe(request) => response?,
        };

        subscription.set_reference_id(response.reference_id.clone());
        subscription
            .apply_snapshot(&response.snapshot)
            .map_err(|e| payload_error(response.reference_id.as_str(), &response.snapshot, e))?;

        let entry = &mut self.entries[index];
        entry.inactivity_timeout = response.inactivity_timeout;
        entry.touched_at = Instant::now();
        debug!(
            context_id = %self.shared.context_id,
            subscription = %subscription.scope(),
            id = subscription.id().get(),
            reference_id = %response.reference_id,
            "subscribed"
        );
        Ok(())
    }

    fn connect_url(&self, message_id: Option<u64>) -> Result<String, StreamError> {
        let token = self.credentials.borrow().clone();
        let url = connect_url(
            &self.config.streaming_url,
            &self.shared.context_id,
            token.as_ref(),
            message_id,
        )?;
        Ok(url.into())
    }

    fn next_reference_id(&mut self, kind: SubscriptionKind) -> ReferenceId {
        self.sequence += 1;
        ReferenceId::generate(kind, self.sequence)
    }

    fn find(&self, reference_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.subscription.reference_id() == *reference_id)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    async fn teardown(self, cause: Option<StreamError>) {
        let cause = cause.filter(|e| !e.is_cancellation());
        let context_id = &self.shared.context_id;
        if let Some(error) = &cause {
            error!(context_id = %context_id, error = %error, error_type = error.error_type(), "streaming context failed");
            metrics::record_fatal_error(error.error_type());
            *self.shared.fatal.write() = Some(error.clone());
        }
        self.shared.cancel.cancel();

        match tokio::time::timeout(
            self.config.close_timeout,
            self.transport.unsubscribe_all(context_id),
        )
        .await
        {
            Ok(Ok(())) => debug!(context_id = %context_id, "server-side subscriptions removed"),
            Ok(Err(e)) => warn!(context_id = %context_id, error = %e, "unsubscribe-all failed"),
            Err(_) => warn!(context_id = %context_id, "unsubscribe-all timed out"),
        }

        self.shared.connection.dispose().await;
        metrics::set_connection_status(ConnectionStatus::Closed);

        let was_active = *self.shared.state.read() != ContextState::Connecting;
        for entry in &self.entries {
            entry.subscription.dispose(cause.clone());
        }
        if was_active {
            metrics::add_active_subscriptions(-subscription_count(self.entries.len()));
        }

        self.shared.set_state(ContextState::Disposed);
        self.shared.terminated.cancel();
        info!(context_id = %context_id, "streaming context disposed");
    }
}

fn subscription_count(len: usize) -> f64 {
    f64::from(u32::try_from(len).unwrap_or(u32::MAX))
}

fn payload_error(reference_id: &str, payload: &Value, error: MergeError) -> StreamError {
    StreamError::Payload {
        reference_id: reference_id.to_string(),
        payload: payload.clone(),
        diagnostics: error.diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_follow_establishment_order() {
        let request = StreamRequest::new("C1")
            .with_accounts(["A1", "A2"])
            .with_instruments([Instrument::new(21, "FxSpot")]);
        let mut sequence = 0;

        let (handles, ordered) = Handles::build(&request, &mut sequence);

        let scopes: Vec<SubscriptionScope> = ordered.iter().map(|s| s.scope().clone()).collect();
        assert_eq!(scopes, request.scopes());
        assert_eq!(sequence, 7);
        assert_eq!(handles.account_balances.len(), 2);
        assert_eq!(handles.balance.reference_id().as_str(), "balance_1");
        assert_eq!(handles.orders.reference_id().as_str(), "orders_4");
        assert_eq!(handles.prices[0].1.reference_id().as_str(), "price_7");
    }

    #[test]
    fn generated_context_ids_are_unique_hex() {
        let a = generate_context_id();
        let b = generate_context_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn default_config_watches_context_inactivity() {
        let config = ContextConfig::new(Url::parse("wss://stream.example.com/oapi/streaming/ws").unwrap());
        assert_eq!(config.context_inactivity_timeout, Duration::from_secs(120));
        assert_eq!(config.reconnect.max_attempts, 0);
        assert_eq!(config.heartbeat_check_interval, Duration::from_secs(1));
    }
}
