use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use axon::transport::{ConnectionState, TransportConnection, TransportError};

/// Accepts a single websocket and forwards every text frame it receives
/// until the peer closes.
async fn spawn_capture_server() -> (SocketAddr, UnboundedReceiver<String>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        while let Some(Ok(frame)) = ws.next().await {
            match frame {
                WsMessage::Text(text) => {
                    let _ = tx.send(text);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    (addr, rx)
}

fn watch_states(conn: &TransportConnection) -> UnboundedReceiver<ConnectionState> {
    let (tx, rx) = unbounded_channel();

    conn.on_state_change(Box::new(move |state, _| {
        let _ = tx.send(state);
    }));

    rx
}

#[tokio::test]
async fn enqueued_payloads_hit_the_wire_in_order_exactly_once() {
    let (addr, mut wire) = spawn_capture_server().await;

    let conn = TransportConnection::new(format!("ws://{}", addr));
    let mut states = watch_states(&conn);
    conn.connect();

    assert_eq!(states.recv().await, Some(ConnectionState::Connected));

    for i in 0..50 {
        conn.send_text(format!("msg-{}", i)).unwrap();
    }

    conn.disconnect().await;

    let mut seen = Vec::new();
    while let Some(text) = wire.recv().await {
        seen.push(text);
    }

    let expected: Vec<String> = (0..50).map(|i| format!("msg-{}", i)).collect();
    assert_eq!(seen, expected);

    assert_eq!(states.recv().await, Some(ConnectionState::Closing));
    assert_eq!(states.recv().await, Some(ConnectionState::Closed));
}

#[tokio::test]
async fn binary_frame_aborts_the_receive_loop() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        ws.send(WsMessage::Binary(vec![1, 2, 3])).await.unwrap();

        // Keep the socket open; the client aborts on its own.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let conn = TransportConnection::new(format!("ws://{}", addr));
    let mut states = watch_states(&conn);
    conn.connect();

    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered_clone = Arc::clone(&delivered);

    let result = timeout(
        Duration::from_secs(5),
        conn.receive(move |_| {
            delivered_clone.fetch_add(1, Ordering::Relaxed);
        }),
    )
    .await
    .unwrap();

    assert!(matches!(result, Err(TransportError::UnsupportedFrame)));
    assert_eq!(delivered.load(Ordering::Relaxed), 0);

    assert_eq!(states.recv().await, Some(ConnectionState::Connected));
    assert_eq!(states.recv().await, Some(ConnectionState::Error));
}

#[tokio::test]
async fn handshake_failure_reports_error_state() {
    // Bind then drop so the port is known-dead.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let conn = TransportConnection::new(format!("ws://{}", addr));
    let mut states = watch_states(&conn);
    conn.connect();

    let state = timeout(Duration::from_secs(5), states.recv()).await.unwrap();
    assert_eq!(state, Some(ConnectionState::Error));
}

#[tokio::test]
async fn server_close_frame_triggers_graceful_shutdown() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        ws.send(WsMessage::Close(None)).await.unwrap();
    });

    let conn = TransportConnection::new(format!("ws://{}", addr));
    let mut states = watch_states(&conn);
    conn.connect();

    let result = timeout(Duration::from_secs(5), conn.receive(|_| {}))
        .await
        .unwrap();
    assert!(result.is_ok());

    assert_eq!(states.recv().await, Some(ConnectionState::Connected));
    assert_eq!(states.recv().await, Some(ConnectionState::Closing));
    assert_eq!(states.recv().await, Some(ConnectionState::Closed));
}

#[tokio::test]
async fn enqueue_after_dispose_is_rejected_loudly() {
    let conn = TransportConnection::new("ws://127.0.0.1:1");

    conn.dispose();
    conn.dispose(); // idempotent

    let result = conn.send_text("too late".to_string());
    assert!(matches!(result, Err(TransportError::QueueClosed)));

    assert_eq!(conn.queue_depth(), 0);
}

#[test]
fn state_machine_reachability() {
    use ConnectionState::*;

    // From Connecting only Connected or Error.
    assert!(Connecting.can_transition_to(Connected));
    assert!(Connecting.can_transition_to(Error));
    assert!(!Connecting.can_transition_to(Closing));
    assert!(!Connecting.can_transition_to(Closed));

    // From Connected only Error or Closing.
    assert!(Connected.can_transition_to(Error));
    assert!(Connected.can_transition_to(Closing));
    assert!(!Connected.can_transition_to(Connecting));
    assert!(!Connected.can_transition_to(Closed));

    // Closing always reaches Closed and nothing else.
    assert!(Closing.can_transition_to(Closed));
    assert!(!Closing.can_transition_to(Error));

    // Error and Closed are terminal.
    for next in [Connecting, Connected, Error, Closing, Closed] {
        assert!(!Error.can_transition_to(next));
        assert!(!Closed.can_transition_to(next));
    }
}

#[tokio::test]
async fn queue_depth_tracks_pending_items() {
    // Never connected, so nothing drains the queue.
    let conn = TransportConnection::new("ws://127.0.0.1:1");

    assert_eq!(conn.queue_depth(), 0);

    conn.send_text("one".to_string()).unwrap();
    conn.send_text("two".to_string()).unwrap();

    assert_eq!(conn.queue_depth(), 2);
}
