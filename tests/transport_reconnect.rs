//! Transport-level behavior against raw loopback WebSocket servers:
//! reconnect queueing, retry exhaustion, heartbeat aborts, and intentional
//! disconnects.

use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use tether::protocol;
use tether::{Context, Envelope, MessageType, TransportConfig, TransportEvent, WsTransport};
use tether::{BridgeError, TransportState};

/// Install a subscriber once so `RUST_LOG=debug cargo test` shows the
/// transport's tracing output alongside failures.
fn init_tracing() {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

async fn bind_server() -> (TcpListener, std::net::SocketAddr) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    (listener, addr)
}

fn note(marker: &str) -> Envelope {
    Envelope::new(MessageType::Notification, "test").with_context(Context {
        summary: Some(marker.to_string()),
        ..Context::default()
    })
}

fn marker_of(text: &str) -> String {
    protocol::deserialize(text)
        .expect("valid frame")
        .context
        .and_then(|context| context.summary)
        .unwrap_or_default()
}

async fn wait_for_event<F>(
    events: &mut mpsc::Receiver<TransportEvent>,
    mut predicate: F,
) -> TransportEvent
where
    F: FnMut(&TransportEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("event in time")
            .expect("event channel open");
        if predicate(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn queued_messages_flush_in_order_after_reconnect() {
    let (listener, addr) = bind_server().await;
    let (frames_tx, mut frames_rx) = mpsc::channel::<String>(8);

    let server = tokio::spawn(async move {
        // First connection: read the probe, then drop the socket.
        let (stream, _) = listener.accept().await.expect("accept one");
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("ws accept");
        let _ = ws.next().await;
        drop(ws);

        // Second connection: collect the flushed queue.
        let (stream, _) = listener.accept().await.expect("accept two");
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("ws accept");
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                if frames_tx.send(marker_of(&text)).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut cfg = TransportConfig::new(format!("ws://{addr}"));
    cfg.reconnect_interval = Duration::from_millis(500);
    cfg.max_reconnect_attempts = 20;
    cfg.heartbeat_interval = Duration::from_secs(60);
    let (transport, mut events) = WsTransport::connect(cfg).await.expect("connect");

    transport.send(note("probe")).await.expect("probe send");
    wait_for_event(&mut events, |event| {
        matches!(event, TransportEvent::Disconnected { will_retry: true })
    })
    .await;

    // Sends while offline are acknowledged and queued.
    for marker in ["m1", "m2", "m3"] {
        transport.send(note(marker)).await.expect("queued send");
    }
    assert_eq!(transport.queued(), 3);

    let mut flushed = Vec::new();
    for _ in 0..3 {
        let marker = tokio::time::timeout(Duration::from_secs(10), frames_rx.recv())
            .await
            .expect("flushed frame in time")
            .expect("server channel open");
        flushed.push(marker);
    }
    assert_eq!(flushed, vec!["m1", "m2", "m3"]);
    for _ in 0..100 {
        if transport.queued() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(transport.queued(), 0);
    assert_eq!(transport.state(), TransportState::Connected);

    transport.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn exhausted_reconnects_surface_and_land_disconnected() {
    let (listener, addr) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("ws accept");
        // Drop the connection and the listener; every retry gets refused.
        drop(ws);
        drop(listener);
    });

    let mut cfg = TransportConfig::new(format!("ws://{addr}"));
    cfg.reconnect_interval = Duration::from_millis(50);
    cfg.max_reconnect_attempts = 3;
    cfg.heartbeat_interval = Duration::from_secs(60);
    let (transport, mut events) = WsTransport::connect(cfg).await.expect("connect");

    let event = wait_for_event(&mut events, |event| {
        matches!(event, TransportEvent::Error(BridgeError::MaxReconnectsExhausted { .. }))
    })
    .await;
    match event {
        TransportEvent::Error(BridgeError::MaxReconnectsExhausted { attempts }) => {
            assert_eq!(attempts, 3);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(transport.state(), TransportState::Disconnected);

    match transport.send(note("too late")).await {
        Err(BridgeError::NotConnected) => {}
        other => panic!("expected NotConnected, got {other:?}"),
    }

    server.await.expect("server task");
}

#[tokio::test]
async fn silent_server_trips_the_heartbeat() {
    let (listener, addr) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let _ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("ws accept");
        // Hold the connection open but never read; pings go unanswered.
        std::future::pending::<()>().await;
    });

    let mut cfg = TransportConfig::new(format!("ws://{addr}"));
    cfg.reconnect = false;
    cfg.heartbeat_interval = Duration::from_millis(100);
    cfg.heartbeat_timeout = Duration::from_millis(50);
    let (transport, mut events) = WsTransport::connect(cfg).await.expect("connect");

    wait_for_event(&mut events, |event| {
        matches!(event, TransportEvent::Disconnected { will_retry: false })
    })
    .await;
    assert_eq!(transport.state(), TransportState::Disconnected);

    server.abort();
}

#[tokio::test]
async fn intentional_disconnect_drops_the_queue() {
    let (listener, addr) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("ws accept");
        let _ = ws.next().await;
        drop(ws);
        // No second accept: the client stays offline.
        std::future::pending::<()>().await;
    });

    let mut cfg = TransportConfig::new(format!("ws://{addr}"));
    cfg.reconnect_interval = Duration::from_secs(5);
    cfg.max_reconnect_attempts = 10;
    cfg.heartbeat_interval = Duration::from_secs(60);
    let (transport, mut events) = WsTransport::connect(cfg).await.expect("connect");

    transport.send(note("probe")).await.expect("probe send");
    wait_for_event(&mut events, |event| {
        matches!(event, TransportEvent::Disconnected { will_retry: true })
    })
    .await;

    transport.send(note("q1")).await.expect("queued send");
    transport.send(note("q2")).await.expect("queued send");
    assert_eq!(transport.queued(), 2);

    transport.disconnect().await;
    assert_eq!(transport.queued(), 0);
    assert_eq!(transport.state(), TransportState::Disconnected);

    match transport.send(note("after close")).await {
        Err(BridgeError::NotConnected) => {}
        other => panic!("expected NotConnected, got {other:?}"),
    }

    server.abort();
}
