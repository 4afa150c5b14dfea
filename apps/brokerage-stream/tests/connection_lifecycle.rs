//! Connection Lifecycle Integration Tests
//!
//! Drives a real websocket against the in-process streaming server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use brokerage_stream::infrastructure::connection::{
    CloseOptions, ConnectOptions, Connection, ConnectionConfig, ConnectionError, ConnectionEvent,
    ConnectionEventKind, ConnectionStatus, InboundFrame,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{StreamingServer, WAIT};

fn connection() -> Connection {
    Connection::new(ConnectionConfig {
        connect_timeout: Duration::from_secs(2),
        close_timeout: Duration::from_millis(500),
        ..ConnectionConfig::default()
    })
}

/// Forward every event of every kind into a channel.
fn record(connection: &Connection) -> mpsc::UnboundedReceiver<ConnectionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [
        ConnectionEventKind::Open,
        ConnectionEventKind::Message,
        ConnectionEventKind::Close,
        ConnectionEventKind::Error,
    ] {
        let tx = tx.clone();
        connection.add(
            kind,
            Arc::new(move |event: &ConnectionEvent| {
                let _ = tx.send(event.clone());
            }),
        );
    }
    rx
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no event within timeout")
        .expect("listener dropped")
}

/// A TCP listener that accepts but never answers the websocket handshake.
async fn silent_listener() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (format!("ws://{addr}/streaming"), handle)
}

// =============================================================================
// Connect
// =============================================================================

#[tokio::test]
async fn test_connect_opens_socket_and_emits_open() {
    let server = StreamingServer::start().await;
    let connection = connection();
    let mut events = record(&connection);

    connection
        .connect(ConnectOptions::to(server.url().as_str()))
        .await
        .unwrap();

    assert_eq!(connection.status(), ConnectionStatus::Open);
    assert_eq!(connection.generation(), 1);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Open { generation: 1 });

    let session = server.next_session().await;
    assert_eq!(session.path(), "/streaming");

    let snapshot = connection.snapshot();
    assert!(snapshot.opened_at.is_some());
    assert_eq!(snapshot.error, None);
}

#[tokio::test]
async fn test_connect_while_open_is_rejected() {
    let server = StreamingServer::start().await;
    let connection = connection();
    connection
        .connect(ConnectOptions::to(server.url().as_str()))
        .await
        .unwrap();

    let err = connection
        .connect(ConnectOptions::to(server.url().as_str()))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ConnectionError::InvalidState {
            operation: "connect",
            status: ConnectionStatus::Open
        }
    );
    assert_eq!(connection.status(), ConnectionStatus::Open);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_concurrent_connects_run_one_at_a_time() {
    let server = StreamingServer::start().await;
    let connection = connection();
    let url = server.url().to_string();

    let (first, second) = tokio::join!(
        connection.connect(ConnectOptions::to(url.clone())),
        connection.connect(ConnectOptions::to(url)),
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(ConnectionError::InvalidState { .. })));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_connect_timeout_leaves_connection_usable() {
    let (url, _listener) = silent_listener().await;
    let connection = connection();

    let err = connection
        .connect(ConnectOptions::to(url).with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectionError::Timeout { operation: "connect", .. }));
    assert!(err.is_recoverable());
    assert_eq!(connection.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_connect_aborted_by_caller_token() {
    let (url, _listener) = silent_listener().await;
    let connection = connection();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = connection
        .connect(ConnectOptions::to(url).with_cancel(cancel))
        .await
        .unwrap_err();

    assert_eq!(err, ConnectionError::Aborted { operation: "connect" });
    assert!(err.is_abort());
    assert_eq!(connection.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_refused_handshake_is_recoverable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let connection = connection();

    let err = connection
        .connect(ConnectOptions::to(format!("ws://{addr}/streaming")))
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectionError::Handshake { .. }));
    assert_eq!(connection.status(), ConnectionStatus::Closed);
}

// =============================================================================
// Traffic
// =============================================================================

#[tokio::test]
async fn test_inbound_frames_are_dispatched_in_order() {
    let server = StreamingServer::start().await;
    let connection = connection();
    let mut events = record(&connection);
    connection
        .connect(ConnectOptions::to(server.url().as_str()))
        .await
        .unwrap();
    let session = server.next_session().await;
    let _open = next_event(&mut events).await;

    session.send_binary(vec![1, 2, 3]);
    session.send_text("hello");

    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Message {
            generation: 1,
            frame: InboundFrame::Binary(vec![1, 2, 3])
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Message {
            generation: 1,
            frame: InboundFrame::Text("hello".to_string())
        }
    );
    assert!(connection.monitor().last_touched().is_some());
    assert!(connection.snapshot().last_message_at.is_some());
}

#[tokio::test]
async fn test_send_reaches_peer() {
    let server = StreamingServer::start().await;
    let connection = connection();
    connection
        .connect(ConnectOptions::to(server.url().as_str()))
        .await
        .unwrap();
    let mut session = server.next_session().await;

    connection.send(b"first").unwrap().send(b"second").unwrap();

    assert_eq!(session.next_data().await, b"first");
    assert_eq!(session.next_data().await, b"second");
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test]
async fn test_peer_close_emits_close_and_allows_connect() {
    let server = StreamingServer::start().await;
    let connection = connection();
    let mut events = record(&connection);
    connection
        .connect(ConnectOptions::to(server.url().as_str()))
        .await
        .unwrap();
    let session = server.next_session().await;
    let _open = next_event(&mut events).await;

    session.close(4000, "maintenance");

    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Close {
            generation: 1,
            code: Some(4000),
            reason: "maintenance".to_string()
        }
    );
    assert_eq!(connection.status(), ConnectionStatus::Closed);

    connection.connect(ConnectOptions::default()).await.unwrap();
    assert_eq!(connection.generation(), 2);
}

#[tokio::test]
async fn test_local_close_completes_handshake() {
    let server = StreamingServer::start().await;
    let connection = connection();
    let mut events = record(&connection);
    connection
        .connect(ConnectOptions::to(server.url().as_str()))
        .await
        .unwrap();
    let session = server.next_session().await;
    let _open = next_event(&mut events).await;

    connection.close(CloseOptions::default()).await.unwrap();

    assert_eq!(connection.status(), ConnectionStatus::Closed);
    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Close { generation: 1, .. }
    ));
    session.closed().await;
}

#[tokio::test]
async fn test_close_with_error_fails_connection() {
    let server = StreamingServer::start().await;
    let connection = connection();
    connection
        .connect(ConnectOptions::to(server.url().as_str()))
        .await
        .unwrap();
    let session = server.next_session().await;

    connection
        .close(CloseOptions::failed("payload rejected"))
        .await
        .unwrap();

    assert_eq!(connection.status(), ConnectionStatus::Failed);
    session.closed().await;
    let err = connection.connect(ConnectOptions::default()).await.unwrap_err();
    assert_eq!(
        err,
        ConnectionError::Failed {
            message: "payload rejected".to_string()
        }
    );
    assert!(matches!(
        connection.send(b"x"),
        Err(ConnectionError::Failed { .. })
    ));
}

// =============================================================================
// Reconnect and Dispose
// =============================================================================

#[tokio::test]
async fn test_reconnect_replaces_socket_with_new_generation() {
    let server = StreamingServer::start().await;
    let connection = connection();
    let mut events = record(&connection);
    let opens = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&opens);
    let once = connection.once(
        ConnectionEventKind::Open,
        Arc::new(move |_: &ConnectionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    connection
        .connect(ConnectOptions::to(server.url().as_str()))
        .await
        .unwrap();
    let first = server.next_session().await;
    assert!(!connection.has(once));

    connection
        .reconnect(ConnectOptions::default(), CloseOptions::default())
        .await
        .unwrap();
    let _second = server.next_session().await;

    first.closed().await;
    assert_eq!(connection.generation(), 2);
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Open { generation: 1 });
    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Close { generation: 1, .. }
    ));
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Open { generation: 2 });
}

#[tokio::test]
async fn test_dispose_aborts_pending_connect() {
    let (url, _listener) = silent_listener().await;
    let connection = connection();

    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.connect(ConnectOptions::to(url)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    connection.dispose().await;

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, ConnectionError::Aborted { operation: "connect" });
    assert!(connection.is_disposed());
    assert_eq!(connection.listeners().len(), 0);
    assert_eq!(
        connection.close(CloseOptions::default()).await,
        Err(ConnectionError::Disposed)
    );
}

#[tokio::test]
async fn test_dispose_closes_open_socket() {
    let server = StreamingServer::start().await;
    let connection = connection();
    connection
        .connect(ConnectOptions::to(server.url().as_str()))
        .await
        .unwrap();
    let session = server.next_session().await;

    connection.dispose().await;

    session.closed().await;
    assert_eq!(connection.status(), ConnectionStatus::Closed);
}
