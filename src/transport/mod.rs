//! Client-side WebSocket transport.
//!
//! A [`WsTransport`] owns exactly one dialed connection and is driven by a
//! background event loop: commands (send, disconnect) enter over an mpsc
//! channel, everything observable (inbound messages, state changes, errors)
//! leaves over the event channel handed back from [`WsTransport::connect`].
//!
//! The loop also owns the reconnect machinery: while reconnecting, sends are
//! queued FIFO and flushed serially once a new connection is up. An
//! intentional disconnect drops the queue and suppresses reconnection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::{ConnectConfig, DEFAULT_TASK_TIMEOUT};
use crate::error::BridgeError;
use crate::protocol::{self, Envelope};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CMD_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 256;
/// Queue depth at which we start warning about an absent peer.
const QUEUE_WARN_THRESHOLD: usize = 10_000;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Everything a transport reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection was re-established after a drop.
    Connected,
    Message(Envelope),
    /// The connection went away. `will_retry` is false for intentional
    /// disconnects and once reconnection is disabled or exhausted.
    Disconnected { will_retry: bool },
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// Per-frame decode failures and terminal reconnect exhaustion. Decode
    /// failures never kill the connection.
    Error(BridgeError),
}

/// Settings for one dialed connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub reconnect: bool,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// How long a producer may wait for the command channel before the send
    /// fails with backpressure.
    pub send_deadline: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: true,
            reconnect_interval: Duration::from_millis(1_000),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            send_deadline: DEFAULT_TASK_TIMEOUT,
        }
    }

    /// Derive transport settings from a bridge `connect` section.
    pub fn from_connect(connect: &ConnectConfig) -> Result<Self, BridgeError> {
        Ok(Self {
            url: connect.endpoint()?,
            reconnect: connect.reconnect,
            reconnect_interval: connect.reconnect_interval,
            max_reconnect_attempts: connect.max_reconnect_attempts,
            heartbeat_interval: connect.heartbeat_interval,
            heartbeat_timeout: connect.heartbeat_timeout,
            send_deadline: DEFAULT_TASK_TIMEOUT,
        })
    }
}

enum TransportCmd {
    Send {
        envelope: Envelope,
        ack: oneshot::Sender<Result<(), BridgeError>>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to a running transport event loop.
pub struct WsTransport {
    cmd_tx: mpsc::Sender<TransportCmd>,
    state: Arc<Mutex<TransportState>>,
    queue_len: Arc<AtomicUsize>,
    send_deadline: Duration,
    url: String,
}

impl WsTransport {
    /// Dial `cfg.url` and start the event loop.
    ///
    /// The initial attempt fails fast even when reconnection is enabled;
    /// reconnects only cover connections that were once established.
    pub async fn connect(
        cfg: TransportConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), BridgeError> {
        let url = cfg.url.clone();
        let (ws, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|e| BridgeError::ConnectFailed {
                    url: url.clone(),
                    message: e.to_string(),
                })?;

        let state = Arc::new(Mutex::new(TransportState::Connected));
        let queue_len = Arc::new(AtomicUsize::new(0));
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        let transport = Self {
            cmd_tx,
            state: state.clone(),
            queue_len: queue_len.clone(),
            send_deadline: cfg.send_deadline,
            url,
        };

        tokio::spawn(run_loop(cfg, ws, cmd_rx, event_tx, state, queue_len));

        Ok((transport, event_rx))
    }

    /// Send one envelope.
    ///
    /// Connected: written immediately, write errors surface here.
    /// Reconnecting: enqueued FIFO and acknowledged. Otherwise the transport
    /// is gone and the send fails with `NotConnected`.
    pub async fn send(&self, envelope: Envelope) -> Result<(), BridgeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send_timeout(
                TransportCmd::Send {
                    envelope,
                    ack: ack_tx,
                },
                self.send_deadline,
            )
            .await
            .map_err(|err| match err {
                mpsc::error::SendTimeoutError::Timeout(_) => BridgeError::SendBackpressure,
                mpsc::error::SendTimeoutError::Closed(_) => BridgeError::NotConnected,
            })?;
        match ack_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::NotConnected),
        }
    }

    /// Intentional close: clears the queue, suppresses reconnection, closes
    /// the connection with code 1000. Idempotent.
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TransportCmd::Disconnect { ack: ack_tx })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    /// Frames currently queued for flush after reconnect.
    pub fn queued(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn set_state(state: &Arc<Mutex<TransportState>>, next: TransportState) {
    *state.lock().unwrap() = next;
}

fn sync_queue_len(queue_len: &AtomicUsize, queue: &VecDeque<Envelope>) {
    queue_len.store(queue.len(), Ordering::Relaxed);
}

fn close_frame(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}

async fn write_envelope(ws: &mut WsStream, envelope: &Envelope) -> Result<(), BridgeError> {
    let frame = protocol::serialize(envelope)?;
    ws.send(Message::Text(frame))
        .await
        .map_err(|e| BridgeError::SendFailed {
            message: e.to_string(),
        })
}

async fn run_loop(
    cfg: TransportConfig,
    mut ws: WsStream,
    mut cmd_rx: mpsc::Receiver<TransportCmd>,
    event_tx: mpsc::Sender<TransportEvent>,
    state: Arc<Mutex<TransportState>>,
    queue_len: Arc<AtomicUsize>,
) {
    let mut queue: VecDeque<Envelope> = VecDeque::new();
    let mut attempt: u32 = 0;

    loop {
        set_state(&state, TransportState::Connected);

        // Serial flush of frames queued while offline. The first failure
        // puts the frame back at the front and re-enters the reconnect path.
        let mut flush_failed = false;
        while let Some(envelope) = queue.pop_front() {
            if let Err(err) = write_envelope(&mut ws, &envelope).await {
                tracing::debug!(error = %err, "queue flush failed; frame requeued");
                queue.push_front(envelope);
                flush_failed = true;
                break;
            }
            sync_queue_len(&queue_len, &queue);
        }
        sync_queue_len(&queue_len, &queue);

        let mut intentional = false;
        if !flush_failed {
            intentional =
                run_session(&cfg, &mut ws, &mut cmd_rx, &event_tx, &mut queue, &queue_len).await;
        }
        if intentional {
            set_state(&state, TransportState::Disconnected);
            return;
        }

        let will_retry = cfg.reconnect && attempt < cfg.max_reconnect_attempts;
        let _ = event_tx
            .send(TransportEvent::Disconnected { will_retry })
            .await;
        if !cfg.reconnect {
            set_state(&state, TransportState::Disconnected);
            return;
        }

        loop {
            attempt += 1;
            if attempt > cfg.max_reconnect_attempts {
                set_state(&state, TransportState::Disconnected);
                let _ = event_tx
                    .send(TransportEvent::Error(BridgeError::MaxReconnectsExhausted {
                        attempts: cfg.max_reconnect_attempts,
                    }))
                    .await;
                return;
            }
            set_state(&state, TransportState::Reconnecting);
            let _ = event_tx
                .send(TransportEvent::Reconnecting {
                    attempt,
                    max_attempts: cfg.max_reconnect_attempts,
                })
                .await;

            if wait_out_interval(&cfg, &mut cmd_rx, &event_tx, &state, &mut queue, &queue_len).await
            {
                return;
            }

            set_state(&state, TransportState::Connecting);
            match connect_async(cfg.url.as_str()).await {
                Ok((new_ws, _response)) => {
                    tracing::info!(url = %cfg.url, attempt, "reconnected");
                    ws = new_ws;
                    attempt = 0;
                    let _ = event_tx.send(TransportEvent::Connected).await;
                    break;
                }
                Err(err) => {
                    tracing::debug!(url = %cfg.url, attempt, error = %err, "reconnect attempt failed");
                }
            }
        }
    }
}

/// Drive one established connection. Returns true when the loop should end
/// for good (intentional disconnect or the handle was dropped).
async fn run_session(
    cfg: &TransportConfig,
    ws: &mut WsStream,
    cmd_rx: &mut mpsc::Receiver<TransportCmd>,
    event_tx: &mpsc::Sender<TransportEvent>,
    queue: &mut VecDeque<Envelope>,
    queue_len: &AtomicUsize,
) -> bool {
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + cfg.heartbeat_interval,
        cfg.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong = false;
    let mut pong_deadline = Instant::now();

    loop {
        tokio::select! {
            maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                Some(TransportCmd::Send { envelope, ack }) => {
                    let _ = ack.send(write_envelope(ws, &envelope).await);
                }
                Some(TransportCmd::Disconnect { ack }) => {
                    queue.clear();
                    queue_len.store(0, Ordering::Relaxed);
                    let _ = ws.close(Some(close_frame(1000, "Disconnect requested"))).await;
                    let _ = event_tx
                        .send(TransportEvent::Disconnected { will_retry: false })
                        .await;
                    let _ = ack.send(());
                    return true;
                }
                None => {
                    let _ = ws.close(None).await;
                    return true;
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => match protocol::deserialize(&text) {
                    Ok(envelope) => {
                        let _ = event_tx.send(TransportEvent::Message(envelope)).await;
                    }
                    Err(err) => {
                        // Bad frames are dropped; the connection survives.
                        let _ = event_tx.send(TransportEvent::Error(err)).await;
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    awaiting_pong = false;
                }
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "socket error");
                    return false;
                }
            },
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    tracing::warn!(url = %cfg.url, "heartbeat unanswered by next interval; aborting connection");
                    return false;
                }
                if ws.send(Message::Ping(Vec::new())).await.is_err() {
                    return false;
                }
                awaiting_pong = true;
                pong_deadline = Instant::now() + cfg.heartbeat_timeout;
            }
            _ = tokio::time::sleep_until(pong_deadline), if awaiting_pong => {
                tracing::warn!(url = %cfg.url, "heartbeat timed out; aborting connection");
                return false;
            }
        }
    }
}

/// Sit out the reconnect interval while still accepting commands: sends are
/// enqueued, a disconnect ends the loop. Returns true when the loop should
/// end for good.
async fn wait_out_interval(
    cfg: &TransportConfig,
    cmd_rx: &mut mpsc::Receiver<TransportCmd>,
    event_tx: &mpsc::Sender<TransportEvent>,
    state: &Arc<Mutex<TransportState>>,
    queue: &mut VecDeque<Envelope>,
    queue_len: &AtomicUsize,
) -> bool {
    let wait = tokio::time::sleep(cfg.reconnect_interval);
    tokio::pin!(wait);

    loop {
        tokio::select! {
            _ = &mut wait => return false,
            maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                Some(TransportCmd::Send { envelope, ack }) => {
                    queue.push_back(envelope);
                    sync_queue_len(queue_len, queue);
                    if queue.len() == QUEUE_WARN_THRESHOLD {
                        tracing::warn!(
                            url = %cfg.url,
                            queued = queue.len(),
                            "reconnect queue is growing unusually large"
                        );
                    }
                    let _ = ack.send(Ok(()));
                }
                Some(TransportCmd::Disconnect { ack }) => {
                    queue.clear();
                    queue_len.store(0, Ordering::Relaxed);
                    set_state(state, TransportState::Disconnected);
                    let _ = event_tx
                        .send(TransportEvent::Disconnected { will_retry: false })
                        .await;
                    let _ = ack.send(());
                    return true;
                }
                None => {
                    set_state(state, TransportState::Disconnected);
                    return true;
                }
            },
        }
    }
}
