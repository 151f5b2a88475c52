//! End-to-end bridge scenarios over real loopback WebSocket connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use tether::{
    Bridge, BridgeConfig, BridgeError, BridgeMode, ConnectConfig, ContextEngine,
    ContextEngineConfig, ListenConfig, MessageType, RankedContextHandler, TaskHandler,
    TaskRequest, TaskResult, TaskScope,
};

/// Install a subscriber once so `RUST_LOG=debug cargo test` shows the
/// bridge's tracing output alongside failures.
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

async fn start_host(name: &str) -> (Bridge, u16) {
    init_tracing();
    let config = BridgeConfig::new(BridgeMode::Host, name).with_listen(ListenConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
    });
    let bridge = Bridge::new(config).expect("host config");
    bridge.start().await.expect("host start");
    let port = bridge.local_addr().expect("bound address").port();
    (bridge, port)
}

async fn connect_client(name: &str, port: u16) -> Bridge {
    let config = BridgeConfig::new(BridgeMode::Client, name).with_connect(ConnectConfig {
        url: Some(format!("ws://127.0.0.1:{port}")),
        reconnect: false,
        ..ConnectConfig::default()
    });
    let bridge = Bridge::new(config).expect("client config");
    bridge.start().await.expect("client start");
    bridge
}

async fn wait_for_peers(bridge: &Bridge, count: usize) {
    for _ in 0..500 {
        if bridge.peer_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer count never reached {count}");
}

/// Echoes the task id back, sleeping a per-task (or default) delay first.
struct EchoHandler {
    delays_ms: HashMap<String, u64>,
    default_delay_ms: u64,
}

impl EchoHandler {
    fn immediate() -> Self {
        Self {
            delays_ms: HashMap::new(),
            default_delay_ms: 0,
        }
    }

    fn slow(default_delay_ms: u64) -> Self {
        Self {
            delays_ms: HashMap::new(),
            default_delay_ms,
        }
    }

    fn with_delays(delays_ms: &[(&str, u64)]) -> Self {
        Self {
            delays_ms: delays_ms
                .iter()
                .map(|(id, ms)| (id.to_string(), *ms))
                .collect(),
            default_delay_ms: 0,
        }
    }
}

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle_task(
        &self,
        task: TaskRequest,
        _peer_id: Uuid,
    ) -> Result<TaskResult, BridgeError> {
        let delay = self
            .delays_ms
            .get(&task.id)
            .copied()
            .unwrap_or(self.default_delay_ms);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(TaskResult {
            task_id: None,
            success: true,
            data: json!({"echoId": task.id}),
            artifacts: None,
            follow_up: None,
            error: None,
        })
    }
}

fn task(id: &str) -> TaskRequest {
    TaskRequest::new(id, "exercise the bridge", TaskScope::Execute)
}

#[tokio::test]
async fn echo_task_delegation() {
    let (host, port) = start_host("host").await;
    host.on_task_received(Arc::new(EchoHandler::immediate()));
    let client = connect_client("client", port).await;
    wait_for_peers(&host, 1).await;

    let result = client
        .delegate_task(task("t-1"), None)
        .await
        .expect("task result");

    assert_eq!(result.task_id.as_deref(), Some("t-1"));
    assert!(result.success);
    assert_eq!(result.data["echoId"], "t-1");

    client.stop().await.expect("client stop");
    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn parallel_tasks_correlate_independently() {
    let (host, port) = start_host("host").await;
    host.on_task_received(Arc::new(EchoHandler::with_delays(&[
        ("p-1", 100),
        ("p-2", 50),
        ("p-3", 75),
    ])));
    let client = connect_client("client", port).await;
    wait_for_peers(&host, 1).await;

    let (first, second, third) = tokio::join!(
        client.delegate_task(task("p-1"), None),
        client.delegate_task(task("p-2"), None),
        client.delegate_task(task("p-3"), None),
    );

    assert_eq!(first.expect("p-1").data["echoId"], "p-1");
    assert_eq!(second.expect("p-2").data["echoId"], "p-2");
    assert_eq!(third.expect("p-3").data["echoId"], "p-3");

    client.stop().await.expect("client stop");
    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn slow_handler_times_out_and_late_response_is_dropped() {
    let (host, port) = start_host("host").await;
    host.on_task_received(Arc::new(EchoHandler::slow(5_000)));
    let client = connect_client("client", port).await;
    wait_for_peers(&host, 1).await;

    let mut slow = task("t-slow");
    slow.timeout = Some(200);

    let started = std::time::Instant::now();
    let outcome = client.delegate_task(slow, None).await;
    let elapsed = started.elapsed();

    match outcome {
        Err(BridgeError::Timeout { id, timeout_ms }) => {
            assert_eq!(id, "t-slow");
            assert_eq!(timeout_ms, 200);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(elapsed < Duration::from_secs(2), "timeout took {elapsed:?}");

    client.stop().await.expect("client stop");
    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn host_stop_fails_the_pending_task() {
    let (host, port) = start_host("host").await;
    host.on_task_received(Arc::new(EchoHandler::slow(5_000)));
    let client = connect_client("client", port).await;
    wait_for_peers(&host, 1).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.delegate_task(task("t-doomed"), None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    host.stop().await.expect("host stop");

    let outcome = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending resolves")
        .expect("join");
    match outcome {
        Err(BridgeError::PeerDisconnected { .. }) | Err(BridgeError::ShuttingDown) => {}
        other => panic!("expected disconnect-shaped failure, got {other:?}"),
    }

    client.stop().await.expect("client stop");
}

#[tokio::test]
async fn context_request_returns_ranked_chunks() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("auth.ts"), "export const login = () => {};\n")
        .expect("write");
    std::fs::write(dir.path().join("utils.ts"), "export const misc = 1;\n").expect("write");
    std::fs::write(dir.path().join("login.ts"), "export const page = 2;\n").expect("write");

    let (host, port) = start_host("host").await;
    let engine =
        Arc::new(ContextEngine::new(ContextEngineConfig::new(dir.path())).expect("engine"));
    host.on_context_requested(Arc::new(RankedContextHandler::new(engine, 4_000)));
    let client = connect_client("client", port).await;
    wait_for_peers(&host, 1).await;

    let chunks = client
        .request_context("fix the auth bug", None, None)
        .await
        .expect("chunks");

    assert!(!chunks.is_empty());
    assert_eq!(chunks[0].path, "auth.ts");

    client.stop().await.expect("client stop");
    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn no_handler_and_no_forward_target_is_an_error() {
    let (host, port) = start_host("host").await;
    let client = connect_client("client", port).await;
    wait_for_peers(&host, 1).await;

    match client.delegate_task(task("t-nohandler"), None).await {
        Err(BridgeError::HandlerFailed { message }) => {
            assert!(message.contains("No task handler registered"));
        }
        other => panic!("expected handler failure, got {other:?}"),
    }

    client.stop().await.expect("client stop");
    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn unhandled_task_is_forwarded_one_hop() {
    let (host, port) = start_host("relay").await;
    let caller = connect_client("caller", port).await;
    wait_for_peers(&host, 1).await;
    let worker = connect_client("worker", port).await;
    wait_for_peers(&host, 2).await;
    worker.on_task_received(Arc::new(EchoHandler::immediate()));

    // The relay has no handler; the task crosses exactly one hop to the
    // worker and the response finds its way back.
    let result = caller
        .delegate_task(task("t-forward"), None)
        .await
        .expect("forwarded result");
    assert!(result.success);
    assert_eq!(result.data["echoId"], "t-forward");

    caller.stop().await.expect("caller stop");
    worker.stop().await.expect("worker stop");
    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn notifications_fan_out_to_message_observers() {
    let (host, port) = start_host("host").await;
    let (seen_tx, mut seen_rx) = mpsc::channel::<(MessageType, Option<String>)>(4);
    host.on_message(Arc::new(move |envelope, _peer| {
        let summary = envelope.context.as_ref().and_then(|c| c.summary.clone());
        let _ = seen_tx.try_send((envelope.kind, summary));
    }));
    let client = connect_client("client", port).await;
    wait_for_peers(&host, 1).await;

    client
        .send_notification(None, "status", "build finished")
        .await
        .expect("notify");

    let (kind, summary) = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("notification in time")
        .expect("channel open");
    assert_eq!(kind, MessageType::Notification);
    assert_eq!(summary.as_deref(), Some("build finished"));

    client.stop().await.expect("client stop");
    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn context_sync_reaches_context_observers() {
    let (host, port) = start_host("host").await;
    let (seen_tx, mut seen_rx) = mpsc::channel::<Option<String>>(4);
    host.on_context_received(Arc::new(move |context, _peer| {
        let _ = seen_tx.try_send(context.summary.clone());
    }));
    let client = connect_client("client", port).await;
    wait_for_peers(&host, 1).await;

    client
        .sync_context(
            Some(tether::Context {
                summary: Some("three files changed".to_string()),
                ..tether::Context::default()
            }),
            None,
        )
        .await
        .expect("sync");

    let summary = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("sync in time")
        .expect("channel open");
    assert_eq!(summary.as_deref(), Some("three files changed"));

    client.stop().await.expect("client stop");
    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn delegate_with_no_peers_fails_fast() {
    let (host, _port) = start_host("lonely").await;
    match host.delegate_task(task("t-nobody"), None).await {
        Err(BridgeError::NoPeersConnected) => {}
        other => panic!("expected NoPeersConnected, got {other:?}"),
    }
    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (host, _port) = start_host("host").await;
    host.stop().await.expect("first stop");
    host.stop().await.expect("second stop is a no-op");
    host.stop_auto_sync();
    host.stop_auto_sync();
}

#[tokio::test]
async fn disconnect_from_peer_twice_reports_peer_not_found() {
    let (host, port) = start_host("host").await;
    let client = connect_client("client", port).await;
    wait_for_peers(&host, 1).await;

    let peer_id = client.get_peers()[0].id;
    client
        .disconnect_from_peer(peer_id)
        .await
        .expect("first disconnect");
    match client.disconnect_from_peer(peer_id).await {
        Err(BridgeError::PeerNotFound { .. }) => {}
        other => panic!("expected PeerNotFound, got {other:?}"),
    }

    client.stop().await.expect("client stop");
    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn peer_lifecycle_callbacks_fire() {
    let (host, port) = start_host("host").await;
    let (connected_tx, mut connected_rx) = mpsc::channel::<String>(4);
    let (gone_tx, mut gone_rx) = mpsc::channel::<Uuid>(4);
    host.on_peer_connected(Arc::new(move |info| {
        let _ = connected_tx.try_send(info.name.clone());
    }));
    host.on_peer_disconnected(Arc::new(move |info| {
        let _ = gone_tx.try_send(info.id);
    }));

    let client = connect_client("client", port).await;
    let name = tokio::time::timeout(Duration::from_secs(5), connected_rx.recv())
        .await
        .expect("connected callback in time")
        .expect("channel open");
    assert_eq!(name, "client");

    client.stop().await.expect("client stop");
    tokio::time::timeout(Duration::from_secs(5), gone_rx.recv())
        .await
        .expect("disconnected callback in time")
        .expect("channel open");

    host.stop().await.expect("host stop");
}

#[tokio::test]
async fn status_report_reflects_the_peer_set() {
    let (host, port) = start_host("host").await;
    let client = connect_client("client", port).await;
    wait_for_peers(&host, 1).await;

    let report = host.status_report();
    assert_eq!(report.port, Some(port));
    assert_eq!(report.instance_name, "host");
    assert_eq!(report.peers.len(), 1);

    let serialized = serde_json::to_value(&report).expect("serializable");
    assert_eq!(serialized["instanceName"], "host");
    assert_eq!(serialized["mode"], "host");

    client.stop().await.expect("client stop");
    host.stop().await.expect("host stop");
}
