//! Connected-peer bookkeeping.
//!
//! The registry is an insertion-ordered, key-unique map from peer id to peer
//! record. Accepted connections and dialed transports sit behind the same
//! [`PeerHandle`], so everything downstream sends to a peer without caring
//! how it joined.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::protocol::{self, Envelope};
use crate::transport::WsTransport;

/// Capacity of each accepted peer's writer channel.
pub(crate) const PEER_CHANNEL_CAPACITY: usize = 1024;

/// A frame on its way out to an accepted peer's writer task.
#[derive(Debug)]
pub(crate) enum OutFrame {
    Frame(String),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Unified outbound handle regardless of connection provenance.
#[derive(Clone)]
pub(crate) enum PeerHandle {
    /// Writer channel of an accepted connection.
    Accepted(mpsc::Sender<OutFrame>),
    /// Dialed transport with its own queue and reconnect machinery.
    Dialed(Arc<WsTransport>),
}

pub(crate) struct PeerRecord {
    pub id: Uuid,
    /// Peer-reported name; best-effort informational only.
    pub name: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub handle: PeerHandle,
    /// Reader task (accepted peers) or event pump (dialed peers).
    pub reader: Option<JoinHandle<()>>,
}

impl PeerRecord {
    pub fn new(id: Uuid, name: impl Into<String>, handle: PeerHandle) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            connected_at: now,
            last_activity: now,
            handle,
            reader: None,
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            name: self.name.clone(),
            connected_at: self.connected_at,
            last_activity: self.last_activity,
        }
    }
}

/// Public snapshot of one peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: Uuid,
    pub name: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    order: Vec<Uuid>,
    peers: HashMap<Uuid, PeerRecord>,
}

/// Insertion-ordered peer map shared across the bridge's tasks.
#[derive(Default)]
pub(crate) struct PeerRegistry {
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: PeerRecord) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.peers.contains_key(&record.id) {
            inner.order.push(record.id);
        }
        inner.peers.insert(record.id, record);
    }

    pub fn remove(&self, id: Uuid) -> Option<PeerRecord> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.peers.remove(&id)?;
        inner.order.retain(|entry| *entry != id);
        Some(record)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.lock().unwrap().peers.contains_key(&id)
    }

    /// First peer by insertion order; the default delegation target.
    pub fn first_id(&self) -> Option<Uuid> {
        self.inner.lock().unwrap().order.first().copied()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.inner.lock().unwrap().order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    /// Bump `last_activity`; called for every inbound frame.
    pub fn touch(&self, id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.peers.get_mut(&id) {
            record.last_activity = Utc::now();
        }
    }

    pub fn handle_of(&self, id: Uuid) -> Option<PeerHandle> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .get(&id)
            .map(|record| record.handle.clone())
    }

    pub fn info(&self, id: Uuid) -> Option<PeerInfo> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .get(&id)
            .map(PeerRecord::info)
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|id| inner.peers.get(id).map(PeerRecord::info))
            .collect()
    }

    /// Attach the reader/pump task after the record was registered.
    pub fn set_reader(&self, id: Uuid, task: JoinHandle<()>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.peers.get_mut(&id) {
            record.reader = Some(task);
        } else {
            // Peer vanished between registration and spawn.
            task.abort();
        }
    }

    /// Remove every peer, preserving insertion order. Used by shutdown.
    pub fn drain_all(&self) -> Vec<PeerRecord> {
        let mut inner = self.inner.lock().unwrap();
        let order = std::mem::take(&mut inner.order);
        order
            .into_iter()
            .filter_map(|id| inner.peers.remove(&id))
            .collect()
    }
}

/// Serializes envelopes and hands them to a peer's outbound path, with a
/// bounded wait before reporting backpressure.
#[derive(Clone)]
pub(crate) struct PeerSender {
    registry: Arc<PeerRegistry>,
    deadline: Duration,
}

impl PeerSender {
    pub fn new(registry: Arc<PeerRegistry>, deadline: Duration) -> Self {
        Self { registry, deadline }
    }

    pub async fn send(&self, peer_id: Uuid, envelope: &Envelope) -> Result<(), BridgeError> {
        let handle = self
            .registry
            .handle_of(peer_id)
            .ok_or(BridgeError::PeerNotFound { peer_id })?;
        match handle {
            PeerHandle::Accepted(tx) => {
                let frame = protocol::serialize(envelope)?;
                tx.send_timeout(OutFrame::Frame(frame), self.deadline)
                    .await
                    .map_err(|err| match err {
                        mpsc::error::SendTimeoutError::Timeout(_) => BridgeError::SendBackpressure,
                        mpsc::error::SendTimeoutError::Closed(_) => {
                            BridgeError::PeerDisconnected { peer_id }
                        }
                    })
            }
            PeerHandle::Dialed(transport) => transport.send(envelope.clone()).await,
        }
    }
}
