//! Bridge core: lifecycle, peer wiring, and the public RPC surface.
//!
//! A [`Bridge`] hosts the listener (host/peer mode), the dialed transport
//! (client/peer mode), one reader and one writer task per accepted peer, and
//! the correlation tables. Everything pending is failed explicitly on peer
//! disconnect and on shutdown — no request future is ever left dangling.

mod autosync;
mod correlator;
mod handlers;
mod registry;
mod router;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

use crate::auth::{AUTH_REJECT_CLOSE_CODE, AllowAll, AuthDecision, Authenticator, ConnectionAttempt};
use crate::config::{BridgeConfig, BridgeMode, ConnectConfig, DEFAULT_CONTEXT_TIMEOUT};
use crate::error::BridgeError;
use crate::protocol::{self, Context, Envelope, FileChunk, MessageType, TaskRequest, TaskResult};
use crate::transport::{TransportConfig, TransportEvent, WsTransport};

use correlator::Correlator;
use registry::{OutFrame, PEER_CHANNEL_CAPACITY, PeerHandle, PeerRecord, PeerRegistry, PeerSender};
use router::Router;

pub use handlers::{
    ContextCallback, ContextProvider, ContextRequestHandler, MessageCallback, PeerCallback,
    TaskHandler,
};
pub use registry::PeerInfo;

/// Keepalive ping cadence for accepted connections.
const SERVER_PING_INTERVAL: Duration = Duration::from_secs(30);

/// The status document persisted by an embedding daemon on peer-set changes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub port: Option<u16>,
    pub instance_name: String,
    pub mode: BridgeMode,
    pub peers: Vec<PeerInfo>,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    shutting_down: bool,
    local_addr: Option<SocketAddr>,
    listener_task: Option<JoinHandle<()>>,
    autosync: Option<JoinHandle<()>>,
}

pub(crate) struct BridgeInner {
    pub(crate) config: BridgeConfig,
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<PeerRegistry>,
    sender: PeerSender,
    correlator: Arc<Correlator>,
    handlers: Arc<handlers::HandlerRegistry>,
    router: Arc<Router>,
    lifecycle: Mutex<Lifecycle>,
}

/// One bridge instance. Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Validate the configuration and assemble a stopped bridge.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        Self::with_authenticator(config, Arc::new(AllowAll))
    }

    pub fn with_authenticator(
        config: BridgeConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let registry = Arc::new(PeerRegistry::new());
        let sender = PeerSender::new(registry.clone(), config.task_timeout);
        let correlator = Correlator::new();
        let handlers = Arc::new(handlers::HandlerRegistry::default());
        let router = Router::new(
            config.instance_name.clone(),
            registry.clone(),
            sender.clone(),
            correlator.clone(),
            handlers.clone(),
        );
        Ok(Self {
            inner: Arc::new(BridgeInner {
                config,
                authenticator,
                registry,
                sender,
                correlator,
                handlers,
                router,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    // -- lifecycle -----------------------------------------------------------

    /// Open the listener and/or dial the configured peer. Fails atomically:
    /// partial progress is rolled back before the error is returned.
    pub async fn start(&self) -> Result<(), BridgeError> {
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            if lifecycle.started {
                return Err(BridgeError::AlreadyStarted);
            }
            if lifecycle.shutting_down {
                return Err(BridgeError::ShuttingDown);
            }
            lifecycle.started = true;
        }

        if let Err(err) = self.start_impl().await {
            teardown(&self.inner).await;
            self.inner.lifecycle.lock().unwrap().started = false;
            return Err(err);
        }

        // A stop() that raced start() wins: release everything and fail.
        let stopped = {
            let lifecycle = self.inner.lifecycle.lock().unwrap();
            !lifecycle.started || lifecycle.shutting_down
        };
        if stopped {
            teardown(&self.inner).await;
            return Err(BridgeError::ShuttingDown);
        }

        if self.inner.config.context_sharing.auto_sync {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            lifecycle.autosync = Some(autosync::spawn(self.inner.clone(), None));
        }

        tracing::info!(
            mode = %self.inner.config.mode,
            instance = %self.inner.config.instance_name,
            "bridge started"
        );
        Ok(())
    }

    async fn start_impl(&self) -> Result<(), BridgeError> {
        if let Some(listen) = &self.inner.config.listen {
            let addr = format!("{}:{}", listen.host, listen.port);
            let listener =
                TcpListener::bind(&addr)
                    .await
                    .map_err(|e| BridgeError::BindFailed {
                        addr: addr.clone(),
                        message: e.to_string(),
                    })?;
            let local_addr = listener.local_addr().ok();
            let task = tokio::spawn(accept_loop(self.inner.clone(), listener));
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            lifecycle.local_addr = local_addr;
            lifecycle.listener_task = Some(task);
            tracing::info!(addr = %addr, "listening for peers");
        }

        if let Some(connect) = &self.inner.config.connect {
            dial(&self.inner, connect).await?;
        }

        Ok(())
    }

    /// Shut everything down: fail all pending requests, close every peer
    /// with code 1000 "Bridge stopping", close the listener, clear the
    /// registry. Idempotent — a second call is a no-op.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            if !lifecycle.started || lifecycle.shutting_down {
                return Ok(());
            }
            lifecycle.shutting_down = true;
        }

        teardown(&self.inner).await;

        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        lifecycle.started = false;
        lifecycle.shutting_down = false;
        tracing::info!(instance = %self.inner.config.instance_name, "bridge stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        let lifecycle = self.inner.lifecycle.lock().unwrap();
        lifecycle.started && !lifecycle.shutting_down
    }

    pub fn mode(&self) -> BridgeMode {
        self.inner.config.mode
    }

    pub fn instance_name(&self) -> &str {
        &self.inner.config.instance_name
    }

    /// Bound listener address, once started in a listening mode.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lifecycle.lock().unwrap().local_addr
    }

    // -- peers ---------------------------------------------------------------

    pub fn get_peers(&self) -> Vec<PeerInfo> {
        self.inner.registry.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            port: self.local_addr().map(|addr| addr.port()),
            instance_name: self.inner.config.instance_name.clone(),
            mode: self.inner.config.mode,
            peers: self.inner.registry.snapshot(),
        }
    }

    /// Dial an additional peer at runtime.
    pub async fn connect_to_peer(&self, url: &str) -> Result<Uuid, BridgeError> {
        self.ensure_started()?;
        let mut connect = self.inner.config.connect.clone().unwrap_or_default();
        connect.url = Some(url.to_string());
        dial(&self.inner, &connect).await
    }

    /// Close one peer. A second call for the same id fails with
    /// `PeerNotFound`.
    pub async fn disconnect_from_peer(&self, peer_id: Uuid) -> Result<(), BridgeError> {
        self.ensure_started()?;
        let record = self
            .inner
            .registry
            .remove(peer_id)
            .ok_or(BridgeError::PeerNotFound { peer_id })?;
        close_peer(&record, 1000, "Disconnect requested").await;
        self.inner.correlator.fail_by_peer(peer_id);
        self.inner.handlers.notify_peer_disconnected(&record.info());
        if let Some(task) = record.reader {
            task.abort();
        }
        tracing::info!(peer_id = %peer_id, "peer disconnected by request");
        Ok(())
    }

    // -- messaging -----------------------------------------------------------

    pub async fn send_to_peer(&self, peer_id: Uuid, envelope: Envelope) -> Result<(), BridgeError> {
        self.ensure_started()?;
        self.inner.sender.send(peer_id, &envelope).await
    }

    /// Send to every peer; per-peer failures are logged, not returned.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<(), BridgeError> {
        self.ensure_started()?;
        self.inner.broadcast_envelope(envelope).await;
        Ok(())
    }

    /// Delegate a task and wait for its result.
    ///
    /// Targets the first peer by iteration order when `peer_id` is not
    /// given. The timeout is `task.timeout`, falling back to the configured
    /// task timeout.
    pub async fn delegate_task(
        &self,
        task: TaskRequest,
        peer_id: Option<Uuid>,
    ) -> Result<TaskResult, BridgeError> {
        self.ensure_started()?;
        let target = self.resolve_target(peer_id)?;
        let timeout_ms = task
            .timeout
            .unwrap_or(self.inner.config.task_timeout.as_millis() as u64);
        let task_id = task.id.clone();
        let rx = self
            .inner
            .correlator
            .register_task(&task_id, target, timeout_ms)?;
        let envelope = Envelope::new(MessageType::TaskDelegate, &self.inner.config.instance_name)
            .with_task(task);
        if let Err(err) = self.inner.sender.send(target, &envelope).await {
            self.inner.correlator.discard_task(&task_id);
            return Err(err);
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::ShuttingDown),
        }
    }

    /// Ask a peer for ranked context for `query`.
    pub async fn request_context(
        &self,
        query: impl Into<String>,
        peer_id: Option<Uuid>,
        timeout: Option<Duration>,
    ) -> Result<Vec<FileChunk>, BridgeError> {
        self.ensure_started()?;
        let target = self.resolve_target(peer_id)?;
        let timeout_ms = timeout.unwrap_or(DEFAULT_CONTEXT_TIMEOUT).as_millis() as u64;
        let envelope = Envelope::new(MessageType::Request, &self.inner.config.instance_name)
            .with_context(Context {
                summary: Some(query.into()),
                ..Context::default()
            });
        let request_id = envelope.id.to_string();
        let rx = self
            .inner
            .correlator
            .register_context(&request_id, target, timeout_ms)?;
        if let Err(err) = self.inner.sender.send(target, &envelope).await {
            self.inner.correlator.discard_context(&request_id);
            return Err(err);
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::ShuttingDown),
        }
    }

    /// Share context: unicast when `peer_id` is given, broadcast otherwise.
    pub async fn sync_context(
        &self,
        context: Option<Context>,
        peer_id: Option<Uuid>,
    ) -> Result<(), BridgeError> {
        self.ensure_started()?;
        let envelope = Envelope::new(MessageType::ContextSync, &self.inner.config.instance_name)
            .with_context(context.unwrap_or_default());
        match peer_id {
            Some(id) => self.inner.sender.send(id, &envelope).await,
            None => {
                self.inner.broadcast_envelope(envelope).await;
                Ok(())
            }
        }
    }

    /// Send a human-readable notice; `category` travels as
    /// `context.variables.notificationType`.
    pub async fn send_notification(
        &self,
        peer_id: Option<Uuid>,
        category: &str,
        text: &str,
    ) -> Result<(), BridgeError> {
        self.ensure_started()?;
        let mut variables = serde_json::Map::new();
        variables.insert(
            "notificationType".to_string(),
            serde_json::Value::String(category.to_string()),
        );
        let envelope = Envelope::new(MessageType::Notification, &self.inner.config.instance_name)
            .with_context(Context {
                summary: Some(text.to_string()),
                variables: Some(variables),
                ..Context::default()
            });
        match peer_id {
            Some(id) => self.inner.sender.send(id, &envelope).await,
            None => {
                self.inner.broadcast_envelope(envelope).await;
                Ok(())
            }
        }
    }

    // -- auto-sync -----------------------------------------------------------

    /// (Re)arm the periodic context broadcast. Replaces a running schedule.
    pub fn start_auto_sync(
        &self,
        provider: Option<Arc<dyn ContextProvider>>,
    ) -> Result<(), BridgeError> {
        self.ensure_started()?;
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if let Some(task) = lifecycle.autosync.take() {
            task.abort();
        }
        lifecycle.autosync = Some(autosync::spawn(self.inner.clone(), provider));
        Ok(())
    }

    /// Cancel the periodic broadcast. Idempotent.
    pub fn stop_auto_sync(&self) {
        if let Some(task) = self.inner.lifecycle.lock().unwrap().autosync.take() {
            task.abort();
        }
    }

    // -- handler registration ------------------------------------------------

    /// Single slot; the most recent registration wins.
    pub fn on_task_received(&self, handler: Arc<dyn TaskHandler>) {
        self.inner.handlers.set_task_handler(handler);
    }

    /// Single slot; the most recent registration wins.
    pub fn on_context_requested(&self, handler: Arc<dyn ContextRequestHandler>) {
        self.inner.handlers.set_context_handler(handler);
    }

    pub fn on_peer_connected(&self, callback: PeerCallback) {
        self.inner.handlers.add_peer_connected(callback);
    }

    pub fn on_peer_disconnected(&self, callback: PeerCallback) {
        self.inner.handlers.add_peer_disconnected(callback);
    }

    pub fn on_context_received(&self, callback: ContextCallback) {
        self.inner.handlers.add_context_received(callback);
    }

    pub fn on_message(&self, callback: MessageCallback) {
        self.inner.handlers.add_message_received(callback);
    }

    // -- internals -----------------------------------------------------------

    fn ensure_started(&self) -> Result<(), BridgeError> {
        let lifecycle = self.inner.lifecycle.lock().unwrap();
        if lifecycle.shutting_down {
            return Err(BridgeError::ShuttingDown);
        }
        if !lifecycle.started {
            return Err(BridgeError::NotStarted);
        }
        Ok(())
    }

    fn resolve_target(&self, peer_id: Option<Uuid>) -> Result<Uuid, BridgeError> {
        match peer_id {
            Some(id) => {
                if self.inner.registry.contains(id) {
                    Ok(id)
                } else {
                    Err(BridgeError::PeerNotFound { peer_id: id })
                }
            }
            None => self
                .inner
                .registry
                .first_id()
                .ok_or(BridgeError::NoPeersConnected),
        }
    }
}

impl BridgeInner {
    pub(crate) async fn broadcast_envelope(&self, envelope: Envelope) {
        for peer_id in self.registry.ids() {
            if let Err(err) = self.sender.send(peer_id, &envelope).await {
                tracing::warn!(peer_id = %peer_id, error = %err, "broadcast send failed");
            }
        }
    }

    pub(crate) async fn auto_sync_tick(&self, context: Option<Context>) {
        let envelope = Envelope::new(MessageType::ContextSync, &self.config.instance_name)
            .with_context(context.unwrap_or_default());
        self.broadcast_envelope(envelope).await;
    }
}

/// Full teardown shared by `stop()` and failed `start()`.
async fn teardown(inner: &Arc<BridgeInner>) {
    let (listener_task, autosync) = {
        let mut lifecycle = inner.lifecycle.lock().unwrap();
        lifecycle.local_addr = None;
        (lifecycle.listener_task.take(), lifecycle.autosync.take())
    };
    if let Some(task) = autosync {
        task.abort();
    }
    inner.correlator.fail_all();
    if let Some(task) = listener_task {
        task.abort();
    }
    for record in inner.registry.drain_all() {
        close_peer(&record, 1000, "Bridge stopping").await;
        if let Some(task) = record.reader {
            task.abort();
        }
    }
}

async fn close_peer(record: &PeerRecord, code: u16, reason: &str) {
    match &record.handle {
        PeerHandle::Accepted(tx) => {
            let _ = tx
                .send(OutFrame::Close {
                    code,
                    reason: reason.to_string(),
                })
                .await;
        }
        PeerHandle::Dialed(transport) => transport.disconnect().await,
    }
}

// -- dialed side --------------------------------------------------------------

async fn dial(inner: &Arc<BridgeInner>, connect: &ConnectConfig) -> Result<Uuid, BridgeError> {
    let mut transport_cfg = TransportConfig::from_connect(connect)?;
    transport_cfg.send_deadline = inner.config.task_timeout;
    let url = transport_cfg.url.clone();
    let (transport, events) = WsTransport::connect(transport_cfg).await?;
    let transport = Arc::new(transport);

    let peer_id = Uuid::new_v4();
    let record = PeerRecord::new(peer_id, "server", PeerHandle::Dialed(transport));
    let info = record.info();
    inner.registry.add(record);
    inner.handlers.notify_peer_connected(&info);
    tracing::info!(peer_id = %peer_id, url = %url, "connected to peer");

    let pump = tokio::spawn(transport_pump(inner.clone(), peer_id, events));
    inner.registry.set_reader(peer_id, pump);
    Ok(peer_id)
}

async fn transport_pump(
    inner: Arc<BridgeInner>,
    peer_id: Uuid,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(envelope) => inner.router.route(peer_id, envelope).await,
            TransportEvent::Connected => {
                tracing::info!(peer_id = %peer_id, "peer connection restored");
            }
            TransportEvent::Reconnecting {
                attempt,
                max_attempts,
            } => {
                tracing::warn!(peer_id = %peer_id, attempt, max_attempts, "reconnecting to peer");
            }
            TransportEvent::Disconnected { will_retry } => {
                // Responses cannot arrive for the dropped connection.
                inner.correlator.fail_by_peer(peer_id);
                if !will_retry {
                    remove_and_notify(&inner, peer_id);
                }
            }
            TransportEvent::Error(err) => {
                if matches!(err, BridgeError::MaxReconnectsExhausted { .. }) {
                    tracing::error!(peer_id = %peer_id, error = %err, "giving up on peer");
                    remove_and_notify(&inner, peer_id);
                } else {
                    tracing::warn!(peer_id = %peer_id, error = %err, "transport error");
                }
            }
        }
    }
}

fn remove_and_notify(inner: &Arc<BridgeInner>, peer_id: Uuid) {
    if let Some(record) = inner.registry.remove(peer_id) {
        inner.correlator.fail_by_peer(peer_id);
        inner.handlers.notify_peer_disconnected(&record.info());
        tracing::info!(peer_id = %peer_id, "peer removed");
    }
}

// -- accepting side -----------------------------------------------------------

async fn accept_loop(inner: Arc<BridgeInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_accept(inner, stream, remote).await {
                        tracing::debug!(remote = %remote, error = %err, "connection setup failed");
                    }
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_accept(
    inner: Arc<BridgeInner>,
    stream: TcpStream,
    remote: SocketAddr,
) -> Result<(), BridgeError> {
    // The upgrade callback runs before the handshake response is written;
    // capture what the authenticator needs, accept any path.
    let captured: Arc<Mutex<(String, Option<String>)>> =
        Arc::new(Mutex::new(("/".to_string(), None)));
    let capture = captured.clone();
    let mut ws = tokio_tungstenite::accept_hdr_async(
        stream,
        move |request: &HandshakeRequest, response: HandshakeResponse| {
            let mut slot = capture.lock().unwrap();
            slot.0 = request.uri().path().to_string();
            slot.1 = request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            Ok(response)
        },
    )
    .await
    .map_err(|e| BridgeError::ConnectFailed {
        url: remote.to_string(),
        message: e.to_string(),
    })?;

    let (path, authorization) = {
        let slot = captured.lock().unwrap();
        (slot.0.clone(), slot.1.clone())
    };
    let attempt = ConnectionAttempt {
        remote_addr: remote,
        path,
        authorization,
    };
    match inner.authenticator.authenticate(&attempt).await {
        AuthDecision::Accept { method } => {
            tracing::debug!(remote = %remote, method = ?method, "connection authenticated");
        }
        AuthDecision::Reject { reason } => {
            tracing::warn!(remote = %remote, reason = %reason, "connection rejected");
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::from(AUTH_REJECT_CLOSE_CODE),
                    reason: reason.into(),
                }))
                .await;
            return Ok(());
        }
    }

    let stopping = {
        let lifecycle = inner.lifecycle.lock().unwrap();
        !lifecycle.started || lifecycle.shutting_down
    };
    if stopping {
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::from(1000u16),
                reason: "Bridge stopping".into(),
            }))
            .await;
        return Ok(());
    }

    let (sink, stream_half) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
    // The writer exits on its own once the close frame is written or every
    // sender is gone; no handle to keep.
    tokio::spawn(peer_writer(sink, out_rx));

    let peer_id = Uuid::new_v4();
    let record = PeerRecord::new(peer_id, "client", PeerHandle::Accepted(out_tx.clone()));
    let info = record.info();
    inner.registry.add(record);
    inner.handlers.notify_peer_connected(&info);
    tracing::info!(peer_id = %peer_id, remote = %remote, "peer connected");

    let reader = tokio::spawn(peer_reader(inner.clone(), peer_id, stream_half, out_tx));
    inner.registry.set_reader(peer_id, reader);
    Ok(())
}

async fn peer_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::Receiver<OutFrame>,
) {
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + SERVER_PING_INTERVAL,
        SERVER_PING_INTERVAL,
    );
    loop {
        tokio::select! {
            maybe_frame = out_rx.recv() => match maybe_frame {
                Some(OutFrame::Frame(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(OutFrame::Pong(payload)) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(OutFrame::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn peer_reader(
    inner: Arc<BridgeInner>,
    peer_id: Uuid,
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    out_tx: mpsc::Sender<OutFrame>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match protocol::deserialize(&text) {
                Ok(envelope) => inner.router.route(peer_id, envelope).await,
                Err(err) => {
                    // Frame-level failures never cost the connection.
                    tracing::warn!(peer_id = %peer_id, error = %err, "dropping undecodable frame");
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = out_tx.try_send(OutFrame::Pong(payload));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(peer_id = %peer_id, error = %err, "socket error");
                break;
            }
        }
    }
    remove_and_notify(&inner, peer_id);
}
