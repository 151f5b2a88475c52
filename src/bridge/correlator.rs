//! In-flight request correlation.
//!
//! Two pending tables (tasks and context requests) plus the single-hop
//! forward maps, all under one lock. Every pending entry owns a deadline
//! timer and resolves exactly once: response, timeout, peer disconnect, or
//! shutdown — whichever fires first wins, later completions are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::protocol::{FileChunk, TaskResult};

pub(crate) type TaskOutcome = Result<TaskResult, BridgeError>;
pub(crate) type ContextOutcome = Result<Vec<FileChunk>, BridgeError>;

struct PendingEntry<T> {
    peer_id: Uuid,
    tx: oneshot::Sender<T>,
    timer: JoinHandle<()>,
}

/// Where a forwarded request came from, so its response can be routed back.
#[derive(Debug, Clone)]
pub(crate) struct ForwardEntry {
    pub originator: Uuid,
    #[allow(dead_code)]
    pub issued_at: DateTime<Utc>,
}

#[derive(Default)]
struct CorrelatorInner {
    pending_tasks: HashMap<String, PendingEntry<TaskOutcome>>,
    pending_context: HashMap<String, PendingEntry<ContextOutcome>>,
    forward_tasks: HashMap<String, ForwardEntry>,
    forward_context: HashMap<String, ForwardEntry>,
}

#[derive(Default)]
pub(crate) struct Correlator {
    inner: Mutex<CorrelatorInner>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a pending task. Fails on id collision. The returned receiver
    /// resolves with the terminal outcome.
    pub fn register_task(
        self: &Arc<Self>,
        id: &str,
        peer_id: Uuid,
        timeout_ms: u64,
    ) -> Result<oneshot::Receiver<TaskOutcome>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_tasks.contains_key(id) {
            return Err(BridgeError::DuplicateRequest { id: id.to_string() });
        }
        let timer = {
            let this = Arc::clone(self);
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                this.complete_task(
                    &id,
                    Err(BridgeError::Timeout {
                        id: id.clone(),
                        timeout_ms,
                    }),
                );
            })
        };
        inner
            .pending_tasks
            .insert(id.to_string(), PendingEntry { peer_id, tx, timer });
        Ok(rx)
    }

    /// Register a pending context request; same contract as tasks.
    pub fn register_context(
        self: &Arc<Self>,
        id: &str,
        peer_id: Uuid,
        timeout_ms: u64,
    ) -> Result<oneshot::Receiver<ContextOutcome>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_context.contains_key(id) {
            return Err(BridgeError::DuplicateRequest { id: id.to_string() });
        }
        let timer = {
            let this = Arc::clone(self);
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                this.complete_context(
                    &id,
                    Err(BridgeError::Timeout {
                        id: id.clone(),
                        timeout_ms,
                    }),
                );
            })
        };
        inner
            .pending_context
            .insert(id.to_string(), PendingEntry { peer_id, tx, timer });
        Ok(rx)
    }

    /// Resolve a pending task. Returns false when the id is unknown, which
    /// covers both late responses after a timeout and stray responses.
    pub fn complete_task(&self, id: &str, outcome: TaskOutcome) -> bool {
        let entry = self.inner.lock().unwrap().pending_tasks.remove(id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.tx.send(outcome);
                true
            }
            None => {
                tracing::debug!(task_id = %id, "dropping completion for unknown task");
                false
            }
        }
    }

    pub fn complete_context(&self, id: &str, outcome: ContextOutcome) -> bool {
        let entry = self.inner.lock().unwrap().pending_context.remove(id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.tx.send(outcome);
                true
            }
            None => {
                tracing::debug!(request_id = %id, "dropping completion for unknown request");
                false
            }
        }
    }

    /// Remove a pending task without resolving it; the send-error path where
    /// the caller propagates its own error.
    pub fn discard_task(&self, id: &str) {
        if let Some(entry) = self.inner.lock().unwrap().pending_tasks.remove(id) {
            entry.timer.abort();
        }
    }

    pub fn discard_context(&self, id: &str) {
        if let Some(entry) = self.inner.lock().unwrap().pending_context.remove(id) {
            entry.timer.abort();
        }
    }

    /// Fail every pending entry waiting on `peer_id` and drop the forward
    /// mappings it originated.
    pub fn fail_by_peer(&self, peer_id: Uuid) {
        let (tasks, contexts) = {
            let mut inner = self.inner.lock().unwrap();
            let task_ids: Vec<String> = inner
                .pending_tasks
                .iter()
                .filter(|(_, entry)| entry.peer_id == peer_id)
                .map(|(id, _)| id.clone())
                .collect();
            let tasks: Vec<PendingEntry<TaskOutcome>> = task_ids
                .iter()
                .filter_map(|id| inner.pending_tasks.remove(id))
                .collect();
            let context_ids: Vec<String> = inner
                .pending_context
                .iter()
                .filter(|(_, entry)| entry.peer_id == peer_id)
                .map(|(id, _)| id.clone())
                .collect();
            let contexts: Vec<PendingEntry<ContextOutcome>> = context_ids
                .iter()
                .filter_map(|id| inner.pending_context.remove(id))
                .collect();
            inner
                .forward_tasks
                .retain(|_, entry| entry.originator != peer_id);
            inner
                .forward_context
                .retain(|_, entry| entry.originator != peer_id);
            (tasks, contexts)
        };
        for entry in tasks {
            entry.timer.abort();
            let _ = entry.tx.send(Err(BridgeError::PeerDisconnected { peer_id }));
        }
        for entry in contexts {
            entry.timer.abort();
            let _ = entry.tx.send(Err(BridgeError::PeerDisconnected { peer_id }));
        }
    }

    /// Fail everything; used during shutdown.
    pub fn fail_all(&self) {
        let (tasks, contexts) = {
            let mut inner = self.inner.lock().unwrap();
            let tasks: Vec<PendingEntry<TaskOutcome>> =
                inner.pending_tasks.drain().map(|(_, entry)| entry).collect();
            let contexts: Vec<PendingEntry<ContextOutcome>> = inner
                .pending_context
                .drain()
                .map(|(_, entry)| entry)
                .collect();
            inner.forward_tasks.clear();
            inner.forward_context.clear();
            (tasks, contexts)
        };
        for entry in tasks {
            entry.timer.abort();
            let _ = entry.tx.send(Err(BridgeError::ShuttingDown));
        }
        for entry in contexts {
            entry.timer.abort();
            let _ = entry.tx.send(Err(BridgeError::ShuttingDown));
        }
    }

    /// Record a task forward. A collision means the id already went through
    /// one hop; refusing enforces single-hop forwarding.
    pub fn note_forward_task(&self, id: &str, originator: Uuid) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.forward_tasks.contains_key(id) {
            return Err(BridgeError::DuplicateRequest { id: id.to_string() });
        }
        inner.forward_tasks.insert(
            id.to_string(),
            ForwardEntry {
                originator,
                issued_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn take_forward_task(&self, id: &str) -> Option<ForwardEntry> {
        self.inner.lock().unwrap().forward_tasks.remove(id)
    }

    pub fn note_forward_context(&self, id: &str, originator: Uuid) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.forward_context.contains_key(id) {
            return Err(BridgeError::DuplicateRequest { id: id.to_string() });
        }
        inner.forward_context.insert(
            id.to_string(),
            ForwardEntry {
                originator,
                issued_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn take_forward_context(&self, id: &str) -> Option<ForwardEntry> {
        self.inner.lock().unwrap().forward_context.remove(id)
    }

    /// Pending entries (both kinds) waiting on one peer.
    pub fn pending_for_peer(&self, peer_id: Uuid) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .pending_tasks
            .values()
            .filter(|entry| entry.peer_id == peer_id)
            .count()
            + inner
                .pending_context
                .values()
                .filter(|entry| entry.peer_id == peer_id)
                .count()
    }
}
