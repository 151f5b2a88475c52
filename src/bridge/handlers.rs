//! Handler registration.
//!
//! Task and context-request handlers are single-slot (most-recent wins);
//! the observation hooks are fan-out lists. Callbacks are cloned out of the
//! slot before they run — no user code executes under an internal lock.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::bridge::PeerInfo;
use crate::error::BridgeError;
use crate::protocol::{Context, Envelope, FileChunk, TaskRequest, TaskResult};

/// Executes tasks delegated by remote peers.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle_task(
        &self,
        task: TaskRequest,
        peer_id: Uuid,
    ) -> Result<TaskResult, BridgeError>;
}

/// Answers context queries from remote peers.
#[async_trait]
pub trait ContextRequestHandler: Send + Sync {
    async fn handle_context_request(
        &self,
        query: String,
        peer_id: Uuid,
    ) -> Result<Vec<FileChunk>, BridgeError>;
}

/// Supplies the context payload for auto-sync broadcasts.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn provide(&self) -> Result<Context, BridgeError>;
}

pub type PeerCallback = Arc<dyn Fn(&PeerInfo) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Envelope, Uuid) + Send + Sync>;
pub type ContextCallback = Arc<dyn Fn(&Context, Uuid) + Send + Sync>;

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    task: Mutex<Option<Arc<dyn TaskHandler>>>,
    context: Mutex<Option<Arc<dyn ContextRequestHandler>>>,
    peer_connected: Mutex<Vec<PeerCallback>>,
    peer_disconnected: Mutex<Vec<PeerCallback>>,
    context_received: Mutex<Vec<ContextCallback>>,
    message_received: Mutex<Vec<MessageCallback>>,
}

impl HandlerRegistry {
    pub fn set_task_handler(&self, handler: Arc<dyn TaskHandler>) {
        *self.task.lock().unwrap() = Some(handler);
    }

    pub fn task_handler(&self) -> Option<Arc<dyn TaskHandler>> {
        self.task.lock().unwrap().clone()
    }

    pub fn set_context_handler(&self, handler: Arc<dyn ContextRequestHandler>) {
        *self.context.lock().unwrap() = Some(handler);
    }

    pub fn context_handler(&self) -> Option<Arc<dyn ContextRequestHandler>> {
        self.context.lock().unwrap().clone()
    }

    pub fn add_peer_connected(&self, callback: PeerCallback) {
        self.peer_connected.lock().unwrap().push(callback);
    }

    pub fn add_peer_disconnected(&self, callback: PeerCallback) {
        self.peer_disconnected.lock().unwrap().push(callback);
    }

    pub fn add_context_received(&self, callback: ContextCallback) {
        self.context_received.lock().unwrap().push(callback);
    }

    pub fn add_message_received(&self, callback: MessageCallback) {
        self.message_received.lock().unwrap().push(callback);
    }

    pub fn notify_peer_connected(&self, info: &PeerInfo) {
        let callbacks = self.peer_connected.lock().unwrap().clone();
        for callback in callbacks {
            callback(info);
        }
    }

    pub fn notify_peer_disconnected(&self, info: &PeerInfo) {
        let callbacks = self.peer_disconnected.lock().unwrap().clone();
        for callback in callbacks {
            callback(info);
        }
    }

    pub fn notify_context_received(&self, context: &Context, peer_id: Uuid) {
        let callbacks = self.context_received.lock().unwrap().clone();
        for callback in callbacks {
            callback(context, peer_id);
        }
    }

    pub fn notify_message_received(&self, envelope: &Envelope, peer_id: Uuid) {
        let callbacks = self.message_received.lock().unwrap().clone();
        for callback in callbacks {
            callback(envelope, peer_id);
        }
    }
}
