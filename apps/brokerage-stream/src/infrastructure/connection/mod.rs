//! Persistent Connection
//!
//! Owns one websocket at a time and exposes a small state machine over it:
//!
//! ```text
//!            connect                  close / peer close
//! Closed ────────────► Connecting ──► Open ──────────────► Closing ──► Closed
//!   ▲                      │                                            │
//!   └──── handshake error ─┘                                            │
//!                                                                       ▼
//!                          close(error) / non-recoverable op error ──► Failed
//! ```
//!
//! `connect`, `close` and `reconnect` run one at a time through a FIFO async
//! mutex, in submission order. `send` never waits: it hands the frame to the
//! socket's writer task.
//!
//! Each physical socket gets a new generation number. Events carry it so
//! consumers can drop anything from a socket that has since been replaced.
//! Listeners and inactivity watchers are registered on the connection, not
//! the socket, and survive reconnects.

mod listeners;
mod monitor;
mod types;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub use listeners::{Listener, ListenerId, ListenerRegistry};
pub use monitor::{InactivityCallback, InactivityMonitor, MonitorError, WatcherId};
pub use types::{
    CloseOptions, ConnectOptions, ConnectionConfig, ConnectionError, ConnectionEvent,
    ConnectionEventKind, ConnectionSnapshot, ConnectionStatus, InboundFrame,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Normal closure.
const CLOSE_NORMAL: u16 = 1000;

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct State {
    url: Option<String>,
    binary: bool,
    socket: SocketState,
    error: Option<String>,
    opened_at: Option<chrono::DateTime<Utc>>,
    closed_at: Option<chrono::DateTime<Utc>>,
    error_at: Option<chrono::DateTime<Utc>>,
    last_message_at: Option<chrono::DateTime<Utc>>,
}

impl State {
    const fn status(&self) -> ConnectionStatus {
        if self.error.is_some() {
            return ConnectionStatus::Failed;
        }
        match self.socket {
            SocketState::Connecting => ConnectionStatus::Connecting,
            SocketState::Open => ConnectionStatus::Open,
            SocketState::Closing => ConnectionStatus::Closing,
            SocketState::Closed => ConnectionStatus::Closed,
        }
    }
}

/// Handles for the live socket's tasks.
struct Socket {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    ended: CancellationToken,
}

struct Inner {
    config: ConnectionConfig,
    queue: tokio::sync::Mutex<()>,
    state: RwLock<State>,
    socket: Mutex<Option<Socket>>,
    listeners: ListenerRegistry,
    monitor: InactivityMonitor,
    generation: AtomicU64,
    disposed: CancellationToken,
}

// =============================================================================
// Connection
// =============================================================================

/// Persistent websocket connection. Cheap to clone; clones share one socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create an unopened connection.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        let state = State {
            url: config.url.clone(),
            binary: config.binary,
            socket: SocketState::Closed,
            error: None,
            opened_at: None,
            closed_at: None,
            error_at: None,
            last_message_at: None,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                queue: tokio::sync::Mutex::new(()),
                state: RwLock::new(state),
                socket: Mutex::new(None),
                listeners: ListenerRegistry::new(),
                monitor: InactivityMonitor::new(),
                generation: AtomicU64::new(0),
                disposed: CancellationToken::new(),
            }),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.read().status()
    }

    /// Generation of the current or most recent socket.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Point-in-time view of status, timestamps and error.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.inner.state.read();
        ConnectionSnapshot {
            status: state.status(),
            url: state.url.clone(),
            binary: state.binary,
            generation: self.generation(),
            opened_at: state.opened_at,
            closed_at: state.closed_at,
            error_at: state.error_at,
            last_message_at: state.last_message_at,
            error: state.error.clone(),
        }
    }

    /// Inactivity monitor bound to this connection's sockets.
    #[must_use]
    pub fn monitor(&self) -> &InactivityMonitor {
        &self.inner.monitor
    }

    /// Listener registry.
    #[must_use]
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    /// Register a persistent listener.
    pub fn add(&self, kind: ConnectionEventKind, listener: Listener) -> ListenerId {
        self.inner.listeners.add(kind, listener)
    }

    /// Register a one-shot listener.
    pub fn once(&self, kind: ConnectionEventKind, listener: Listener) -> ListenerId {
        self.inner.listeners.once(kind, listener)
    }

    /// Whether a listener token is registered.
    #[must_use]
    pub fn has(&self, id: ListenerId) -> bool {
        self.inner.listeners.has(id)
    }

    /// Remove one listener.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Remove every listener of `kind`, or all listeners.
    pub fn remove_all(&self, kind: Option<ConnectionEventKind>) -> usize {
        self.inner.listeners.remove_all(kind)
    }

    /// Open a socket. Legal only while `Closed`.
    ///
    /// The handshake races the caller's token, disposal and the timeout; the
    /// half-open socket is dropped when any of them wins.
    ///
    /// # Errors
    ///
    /// `InvalidState` when not closed, `Failed` after a recorded error,
    /// `Aborted`, `Timeout` or `Handshake` when the socket could not be opened.
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), ConnectionError> {
        let _turn = self.inner.acquire().await?;
        self.inner.ensure_not_failed()?;
        let result = self.inner.connect_locked(options).await;
        self.inner.settle(result)
    }

    /// Close the socket and wait for the peer's close frame, bounded by the
    /// close timeout. No-op without a socket.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` when the connection was disposed while waiting.
    pub async fn close(&self, options: CloseOptions) -> Result<(), ConnectionError> {
        let _turn = self.inner.acquire().await?;
        let result = self.inner.close_locked(options).await;
        self.inner.settle(result)
    }

    /// Close then connect as one queued operation.
    ///
    /// # Errors
    ///
    /// Fails fast with `Failed` when an error is recorded; otherwise as
    /// [`connect`](Self::connect).
    pub async fn reconnect(
        &self,
        connect: ConnectOptions,
        close: CloseOptions,
    ) -> Result<(), ConnectionError> {
        let _turn = self.inner.acquire().await?;
        self.inner.ensure_not_failed()?;
        let result = async {
            self.inner.close_locked(close).await?;
            self.inner.ensure_not_failed()?;
            self.inner.connect_locked(connect).await
        }
        .await;
        self.inner.settle(result)
    }

    /// Queue a frame for sending. Binary mode sends binary frames; text mode
    /// requires UTF-8.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless open, `Failed` after a recorded error, `Send`
    /// when the payload or writer is unusable.
    pub fn send(&self, data: impl AsRef<[u8]>) -> Result<&Self, ConnectionError> {
        self.inner.ensure_not_failed()?;
        let (status, binary) = {
            let state = self.inner.state.read();
            (state.status(), state.binary)
        };
        if status != ConnectionStatus::Open {
            return Err(ConnectionError::InvalidState {
                operation: "send",
                status,
            });
        }

        let data = data.as_ref();
        let message = if binary {
            Message::Binary(data.to_vec().into())
        } else {
            let text = std::str::from_utf8(data).map_err(|e| ConnectionError::Send {
                message: format!("text frame is not UTF-8: {e}"),
            })?;
            Message::Text(text.to_owned().into())
        };

        let slot = self.inner.socket.lock();
        let socket = slot.as_ref().ok_or(ConnectionError::InvalidState {
            operation: "send",
            status: ConnectionStatus::Closed,
        })?;
        socket
            .outbound
            .send(message)
            .map_err(|_| ConnectionError::Send {
                message: "socket writer has stopped".to_string(),
            })?;
        Ok(self)
    }

    /// Cancel pending operations, close the socket and drop all listeners.
    /// Later operations fail with `Disposed`.
    pub async fn dispose(&self) {
        self.inner.disposed.cancel();
        let _turn = self.inner.queue.lock().await;
        if let Err(e) = self.inner.close_locked(CloseOptions::default()).await {
            tracing::debug!(error = %e, "close during dispose failed");
        }
        self.inner.monitor.close();
        self.inner.listeners.remove_all(None);
    }

    /// Whether `dispose` has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Queued Operations
// =============================================================================

impl Inner {
    /// Wait for our turn in the operation queue, or for disposal.
    async fn acquire(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, ConnectionError> {
        let turn = tokio::select! {
            biased;
            () = self.disposed.cancelled() => return Err(ConnectionError::Disposed),
            turn = self.queue.lock() => turn,
        };
        if self.disposed.is_cancelled() {
            return Err(ConnectionError::Disposed);
        }
        Ok(turn)
    }

    fn ensure_not_failed(&self) -> Result<(), ConnectionError> {
        match &self.state.read().error {
            Some(message) => Err(ConnectionError::Failed {
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Record non-recoverable operation errors.
    fn settle(&self, result: Result<(), ConnectionError>) -> Result<(), ConnectionError> {
        if let Err(e) = &result
            && !e.is_recoverable()
            && !matches!(e, ConnectionError::Failed { .. } | ConnectionError::Disposed)
        {
            self.record_failure(e.to_string());
        }
        result
    }

    fn record_failure(&self, message: String) {
        tracing::error!(error = %message, "connection failed");
        let mut state = self.state.write();
        state.error = Some(message);
        state.error_at = Some(Utc::now());
    }

    async fn connect_locked(self: &Arc<Self>, options: ConnectOptions) -> Result<(), ConnectionError> {
        let url = {
            let mut state = self.state.write();
            let status = state.status();
            if status != ConnectionStatus::Closed {
                return Err(ConnectionError::InvalidState {
                    operation: "connect",
                    status,
                });
            }
            let url = options
                .url
                .or_else(|| state.url.clone())
                .ok_or(ConnectionError::NoUrl)?;
            state.url = Some(url.clone());
            if let Some(binary) = options.binary {
                state.binary = binary;
            }
            state.socket = SocketState::Connecting;
            url
        };

        let timeout = options.timeout.unwrap_or(self.config.connect_timeout);
        tracing::debug!(url = %redact(&url), ?timeout, "opening socket");

        let handshake = tokio::select! {
            biased;
            () = self.disposed.cancelled() => Err(ConnectionError::Aborted { operation: "connect" }),
            () = cancelled(options.cancel.as_ref()) => Err(ConnectionError::Aborted { operation: "connect" }),
            result = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())) => match result {
                Err(_) => Err(ConnectionError::Timeout { operation: "connect", after: timeout }),
                Ok(Err(e)) => Err(ConnectionError::Handshake { message: e.to_string() }),
                Ok(Ok((ws, _response))) => Ok(ws),
            },
        };

        let ws = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                self.state.write().socket = SocketState::Closed;
                tracing::warn!(error = %e, "socket did not open");
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (ready, ready_rx) = oneshot::channel();

        {
            let mut slot = self.socket.lock();
            let writer = tokio::spawn(write_loop(Arc::clone(self), generation, sink, outbound_rx));
            let reader = tokio::spawn(read_loop(
                Arc::clone(self),
                generation,
                stream,
                outbound.clone(),
                ready_rx,
            ));
            *slot = Some(Socket {
                generation,
                outbound,
                reader,
                writer,
                ended: CancellationToken::new(),
            });
            let mut state = self.state.write();
            state.socket = SocketState::Open;
            state.opened_at = Some(Utc::now());
        }

        if let Err(e) = self.monitor.open(generation, ConnectionStatus::Open) {
            self.finish_socket(generation, None, e.to_string(), true);
            return Err(ConnectionError::Internal {
                message: e.to_string(),
            });
        }

        tracing::info!(generation, "socket open");
        self.listeners.dispatch(&ConnectionEvent::Open { generation });
        let _ = ready.send(());
        Ok(())
    }

    async fn close_locked(&self, options: CloseOptions) -> Result<(), ConnectionError> {
        if let Some(error) = options.error {
            self.record_failure(error);
        }

        let current = self
            .socket
            .lock()
            .as_ref()
            .map(|s| (s.generation, s.outbound.clone(), s.ended.clone()));
        let Some((generation, outbound, ended)) = current else {
            return Ok(());
        };

        self.state.write().socket = SocketState::Closing;
        let frame = CloseFrame {
            code: CloseCode::from(options.code.unwrap_or(CLOSE_NORMAL)),
            reason: options.reason.unwrap_or_default().into(),
        };
        if outbound.send(Message::Close(Some(frame))).is_err() {
            self.finish_socket(generation, None, "socket writer has stopped".to_string(), true);
            return Ok(());
        }

        let timeout = self.config.close_timeout;
        if tokio::time::timeout(timeout, ended.cancelled()).await.is_err() {
            tracing::warn!(generation, ?timeout, "peer did not confirm close; dropping socket");
            self.finish_socket(generation, None, "close timed out".to_string(), true);
        }
        Ok(())
    }

    // =========================================================================
    // Socket Callbacks
    // =========================================================================

    fn on_frame(&self, generation: u64, frame: InboundFrame) {
        self.state.write().last_message_at = Some(Utc::now());
        self.monitor.touch();
        self.listeners
            .dispatch(&ConnectionEvent::Message { generation, frame });
    }

    /// Tear down the socket of `generation` once. Later calls are no-ops.
    fn finish_socket(&self, generation: u64, code: Option<u16>, reason: String, abort_reader: bool) {
        let socket = {
            let mut slot = self.socket.lock();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        let Some(socket) = socket else {
            return;
        };

        socket.writer.abort();
        if abort_reader {
            socket.reader.abort();
        }
        {
            let mut state = self.state.write();
            state.socket = SocketState::Closed;
            state.closed_at = Some(Utc::now());
        }
        self.monitor.close();

        tracing::info!(generation, ?code, reason = %reason, "socket closed");
        self.listeners.dispatch(&ConnectionEvent::Close {
            generation,
            code,
            reason,
        });
        socket.ended.cancel();
    }
}

// =============================================================================
// Socket Tasks
// =============================================================================

async fn read_loop(
    inner: Arc<Inner>,
    generation: u64,
    mut stream: SplitStream<WsStream>,
    outbound: mpsc::UnboundedSender<Message>,
    ready: oneshot::Receiver<()>,
) {
    // the Open event goes out before any message
    let _ = ready.await;

    let mut code = None;
    let mut reason = String::new();

    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Binary(data)) => inner.on_frame(generation, InboundFrame::Binary(data.to_vec())),
            Ok(Message::Text(text)) => inner.on_frame(generation, InboundFrame::Text(text.to_string())),
            Ok(Message::Ping(payload)) => {
                inner.monitor.touch();
                let _ = outbound.send(Message::Pong(payload));
            }
            Ok(Message::Pong(_)) => inner.monitor.touch(),
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    code = Some(u16::from(frame.code));
                    reason = frame.reason.to_string();
                }
                tracing::debug!(generation, ?code, "close frame received");
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(generation, error = %message, "socket read failed");
                inner.listeners.dispatch(&ConnectionEvent::Error {
                    generation,
                    message: message.clone(),
                });
                if reason.is_empty() {
                    reason = message;
                }
                break;
            }
        }
    }

    drop(outbound);
    inner.finish_socket(generation, code, reason, false);
}

async fn write_loop(
    inner: Arc<Inner>,
    generation: u64,
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            let message = e.to_string();
            tracing::warn!(generation, error = %message, "socket write failed");
            inner
                .listeners
                .dispatch(&ConnectionEvent::Error { generation, message });
            return;
        }
        if closing {
            return;
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Strip the query string, which may carry a bearer token.
fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
