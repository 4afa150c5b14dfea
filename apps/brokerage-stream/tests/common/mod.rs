//! Shared fixtures: an in-process streaming server speaking the binary frame
//! format, and a scripted subscription transport.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use brokerage_stream::{
    BackoffConfig, BearerToken, ContextConfig, FrameCodec, ReferenceId, StreamMessage,
    StreamRequest, StreamingContext, SubscribeRequest, SubscribeResponse, SubscriptionKind,
    SubscriptionTransport, TransportError,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Streaming Server
// =============================================================================

/// Websocket server that hands every accepted connection to the test.
pub struct StreamingServer {
    base_url: Url,
    sessions: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerSession>>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl StreamingServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (sessions_tx, sessions) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let sessions_tx = sessions_tx.clone();
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mut uri = String::new();
                    let capture = |request: &Request, response: Response| {
                        uri = request.uri().to_string();
                        Ok(response)
                    };
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, capture).await else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    serve(ws, uri, &sessions_tx).await;
                });
            }
        });

        Self {
            base_url: Url::parse(&format!("ws://{addr}/streaming")).unwrap(),
            sessions: tokio::sync::Mutex::new(sessions),
            accepted,
            task,
        }
    }

    /// Streaming base URL; the client appends `/connect`.
    pub fn url(&self) -> Url {
        self.base_url.clone()
    }

    /// Handshakes completed so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub async fn next_session(&self) -> ServerSession {
        let mut sessions = self.sessions.lock().await;
        tokio::time::timeout(WAIT, sessions.recv())
            .await
            .expect("no connection within timeout")
            .expect("server stopped")
    }

    /// Stop accepting; later connects are refused.
    pub fn stop_accepting(&self) {
        self.task.abort();
    }
}

impl Drop for StreamingServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    uri: String,
    sessions: &mpsc::UnboundedSender<ServerSession>,
) {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (inbound_tx, inbound) = mpsc::unbounded_channel::<Message>();
    let kill = CancellationToken::new();
    let closed = CancellationToken::new();

    let session = ServerSession {
        uri,
        outbound,
        inbound,
        kill: kill.clone(),
        closed: closed.clone(),
    };
    if sessions.send(session).is_err() {
        return;
    }

    let (mut sink, mut source) = ws.split();
    tokio::select! {
        () = kill.cancelled() => {}
        () = async {
            loop {
                tokio::select! {
                    Some(message) = outbound_rx.recv() => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    incoming = source.next() => match incoming {
                        Some(Ok(message)) => {
                            let _ = inbound_tx.send(message);
                        }
                        _ => break,
                    },
                }
            }
        } => {}
    }
    drop(sink);
    drop(source);
    closed.cancel();
}

/// Server side of one accepted connection.
pub struct ServerSession {
    uri: String,
    outbound: mpsc::UnboundedSender<Message>,
    inbound: mpsc::UnboundedReceiver<Message>,
    kill: CancellationToken,
    closed: CancellationToken,
}

impl ServerSession {
    /// Request target of the handshake, e.g. `/streaming/connect?contextId=..`.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn path(&self) -> String {
        self.parsed_uri().path().to_string()
    }

    pub fn query(&self, key: &str) -> Option<String> {
        self.parsed_uri()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    fn parsed_uri(&self) -> Url {
        Url::parse(&format!("http://localhost{}", self.uri)).unwrap()
    }

    /// Send one binary frame carrying `messages`.
    pub fn send_messages(&self, messages: &[(u64, &str, Value)]) {
        self.send_binary(frame(messages));
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        self.outbound.send(Message::Binary(data.into())).unwrap();
    }

    pub fn send_text(&self, text: &str) {
        self.outbound.send(Message::Text(text.to_string().into())).unwrap();
    }

    /// Start a graceful close handshake.
    pub fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }

    /// Drop the TCP connection without a close handshake.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Wait until the connection is gone.
    pub async fn closed(&self) {
        tokio::time::timeout(WAIT, self.closed.cancelled())
            .await
            .expect("session did not close within timeout");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Next data frame the client sent.
    pub async fn next_data(&mut self) -> Vec<u8> {
        loop {
            let message = tokio::time::timeout(WAIT, self.inbound.recv())
                .await
                .expect("no message within timeout")
                .expect("session ended");
            match message {
                Message::Binary(data) => return data.to_vec(),
                Message::Text(text) => return text.as_bytes().to_vec(),
                _ => {}
            }
        }
    }
}

/// Encode `(message id, reference id, payload)` triples into one frame.
pub fn frame(messages: &[(u64, &str, Value)]) -> Vec<u8> {
    let messages: Vec<StreamMessage> = messages
        .iter()
        .map(|(message_id, reference_id, payload)| StreamMessage {
            message_id: *message_id,
            reference_id: (*reference_id).to_string(),
            payload: payload.clone(),
        })
        .collect();
    FrameCodec::new().encode(&messages).unwrap()
}

// =============================================================================
// Scripted Transport
// =============================================================================

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Subscribe(SubscribeRequest),
    Unsubscribe(String),
    UnsubscribeAll(String),
    Reauthorize { context_id: String, token: String },
}

/// Transport that echoes the requested reference id and answers with a
/// canned snapshot per subscription kind.
pub struct FakeTransport {
    calls: Mutex<Vec<TransportCall>>,
    snapshots: Mutex<HashMap<SubscriptionKind, Value>>,
    inactivity_timeout: Mutex<Duration>,
    subscribe_error: Mutex<Option<TransportError>>,
    reauthorize_delay: Mutex<Duration>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let snapshots = HashMap::from([
            (
                SubscriptionKind::Balance,
                json!({"CashBalance": 1000, "Currency": "EUR", "TotalValue": 1500}),
            ),
            (SubscriptionKind::Orders, json!([])),
            (SubscriptionKind::Positions, json!({"Data": []})),
            (SubscriptionKind::ClosedPositions, json!([])),
            (
                SubscriptionKind::Price,
                json!({"Uic": 21, "AssetType": "FxSpot", "Quote": {"Bid": 1.1, "Ask": 1.2}}),
            ),
        ]);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            snapshots: Mutex::new(snapshots),
            inactivity_timeout: Mutex::new(Duration::ZERO),
            subscribe_error: Mutex::new(None),
            reauthorize_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_snapshot(&self, kind: SubscriptionKind, snapshot: Value) {
        self.snapshots.lock().insert(kind, snapshot);
    }

    pub fn set_inactivity_timeout(&self, timeout: Duration) {
        *self.inactivity_timeout.lock() = timeout;
    }

    pub fn fail_subscribe(&self, error: TransportError) {
        *self.subscribe_error.lock() = Some(error);
    }

    /// Make every reauthorize call hang for `delay` after being recorded.
    pub fn delay_reauthorize(&self, delay: Duration) {
        *self.reauthorize_delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn subscribes(&self) -> Vec<SubscribeRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Subscribe(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| matches(call)).count()
    }
}

#[async_trait]
impl SubscriptionTransport for FakeTransport {
    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<SubscribeResponse, TransportError> {
        self.calls.lock().push(TransportCall::Subscribe(request.clone()));
        if let Some(error) = self.subscribe_error.lock().clone() {
            return Err(error);
        }
        let snapshot = self
            .snapshots
            .lock()
            .get(&request.scope.kind())
            .cloned()
            .unwrap_or(Value::Null);
        Ok(SubscribeResponse {
            reference_id: request.reference_id,
            inactivity_timeout: *self.inactivity_timeout.lock(),
            snapshot,
        })
    }

    async fn unsubscribe(
        &self,
        _context_id: &str,
        reference_id: &ReferenceId,
    ) -> Result<(), TransportError> {
        self.calls
            .lock()
            .push(TransportCall::Unsubscribe(reference_id.to_string()));
        Ok(())
    }

    async fn unsubscribe_all(&self, context_id: &str) -> Result<(), TransportError> {
        self.calls
            .lock()
            .push(TransportCall::UnsubscribeAll(context_id.to_string()));
        Ok(())
    }

    async fn reauthorize(
        &self,
        context_id: &str,
        token: &BearerToken,
    ) -> Result<(), TransportError> {
        self.calls.lock().push(TransportCall::Reauthorize {
            context_id: context_id.to_string(),
            token: token.expose().to_string(),
        });
        let delay = *self.reauthorize_delay.lock();
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Context settings with short timeouts and fast retries.
pub fn test_config(server: &StreamingServer) -> ContextConfig {
    ContextConfig {
        connect_timeout: Duration::from_secs(2),
        close_timeout: Duration::from_millis(500),
        heartbeat_check_interval: Duration::from_millis(50),
        reconnect: BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
            max_attempts: 3,
            ..BackoffConfig::default()
        },
        ..ContextConfig::new(server.url())
    }
}

/// A live context plus the server side of its first connection.
pub struct Harness {
    pub context: StreamingContext,
    pub transport: Arc<FakeTransport>,
    pub session: ServerSession,
    pub credentials: watch::Sender<Option<BearerToken>>,
}

pub async fn open_context(
    server: &StreamingServer,
    config: ContextConfig,
    request: StreamRequest,
    transport: Arc<FakeTransport>,
) -> Harness {
    let (credentials, credentials_rx) = watch::channel(Some(BearerToken::new("token-1")));
    let context = StreamingContext::open(config, request, transport.clone(), credentials_rx)
        .await
        .expect("context should open");
    let session = server.next_session().await;
    Harness {
        context,
        transport,
        session,
        credentials,
    }
}

/// Poll `condition` until it holds, failing the test after [`WAIT`].
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
