//! Inbound message dispatch.
//!
//! Every frame read from a peer lands here, strictly in the order it
//! arrived. Request-shaped messages either run the registered handler (on a
//! spawned task, so a slow handler never blocks the reader) or get forwarded
//! exactly one hop to another connected peer. Responses are matched against
//! the forward maps first, then the pending tables.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::bridge::correlator::{ContextOutcome, Correlator, TaskOutcome};
use crate::bridge::handlers::HandlerRegistry;
use crate::bridge::registry::{PeerRegistry, PeerSender};
use crate::error::BridgeError;
use crate::protocol::{Context, Envelope, MessageType, TaskResult};

const NO_TASK_HANDLER: &str = "No task handler registered on peer";
const NO_CONTEXT_HANDLER: &str = "No context handler registered on peer";

pub(crate) struct Router {
    instance_name: String,
    registry: Arc<PeerRegistry>,
    sender: PeerSender,
    correlator: Arc<Correlator>,
    handlers: Arc<HandlerRegistry>,
}

impl Router {
    pub fn new(
        instance_name: String,
        registry: Arc<PeerRegistry>,
        sender: PeerSender,
        correlator: Arc<Correlator>,
        handlers: Arc<HandlerRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_name,
            registry,
            sender,
            correlator,
            handlers,
        })
    }

    /// Dispatch one inbound frame from `peer_id`.
    pub async fn route(self: &Arc<Self>, peer_id: Uuid, envelope: Envelope) {
        self.registry.touch(peer_id);
        match envelope.kind {
            MessageType::TaskDelegate => self.route_task_delegate(peer_id, envelope).await,
            MessageType::Response => self.route_response(peer_id, envelope).await,
            MessageType::Request => self.route_request(peer_id, envelope).await,
            MessageType::ContextSync => {
                if let Some(context) = &envelope.context {
                    self.handlers.notify_context_received(context, peer_id);
                }
            }
            MessageType::Notification => {
                self.handlers.notify_message_received(&envelope, peer_id);
            }
        }
    }

    async fn route_task_delegate(self: &Arc<Self>, peer_id: Uuid, envelope: Envelope) {
        let Some(task) = envelope.task.clone() else {
            tracing::warn!(peer_id = %peer_id, "task_delegate without a task payload");
            return;
        };

        if let Some(handler) = self.handlers.task_handler() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let task_id = task.id.clone();
                let result = match handler.handle_task(task, peer_id).await {
                    Ok(mut result) => {
                        result.task_id = Some(task_id);
                        result
                    }
                    Err(err) => TaskResult::failure(Some(task_id), err.to_string()),
                };
                this.send_result(peer_id, result).await;
            });
            return;
        }

        // No local handler: relay to any other connected peer, one hop only.
        let target = self.forward_target(peer_id);
        match target {
            Some(target)
                if self
                    .correlator
                    .note_forward_task(&task.id, peer_id)
                    .is_ok() =>
            {
                tracing::debug!(
                    task_id = %task.id,
                    from = %peer_id,
                    to = %target,
                    "forwarding task"
                );
                if let Err(err) = self.sender.send(target, &envelope).await {
                    tracing::warn!(task_id = %task.id, error = %err, "task forward failed");
                    self.correlator.take_forward_task(&task.id);
                    self.send_result(
                        peer_id,
                        TaskResult::failure(
                            Some(task.id.clone()),
                            format!("failed to forward task: {err}"),
                        ),
                    )
                    .await;
                }
            }
            _ => {
                self.send_result(
                    peer_id,
                    TaskResult::failure(Some(task.id.clone()), NO_TASK_HANDLER),
                )
                .await;
            }
        }
    }

    async fn route_response(self: &Arc<Self>, peer_id: Uuid, envelope: Envelope) {
        if let Some(result) = &envelope.result {
            if let Some(task_id) = result.task_id.clone() {
                if let Some(forward) = self.correlator.take_forward_task(&task_id) {
                    if let Err(err) = self.sender.send(forward.originator, &envelope).await {
                        tracing::warn!(
                            task_id = %task_id,
                            originator = %forward.originator,
                            error = %err,
                            "failed to relay task response"
                        );
                    }
                    return;
                }
                self.correlator
                    .complete_task(&task_id, task_outcome(result.clone()));
                return;
            }
        }

        if let Some(context) = &envelope.context {
            let Some(request_id) = context.variable_str("requestId").map(str::to_string) else {
                self.handlers.notify_message_received(&envelope, peer_id);
                return;
            };
            if let Some(forward) = self.correlator.take_forward_context(&request_id) {
                if let Err(err) = self.sender.send(forward.originator, &envelope).await {
                    tracing::warn!(
                        request_id = %request_id,
                        originator = %forward.originator,
                        error = %err,
                        "failed to relay context response"
                    );
                }
                return;
            }
            self.correlator
                .complete_context(&request_id, context_outcome(context));
            return;
        }

        self.handlers.notify_message_received(&envelope, peer_id);
    }

    async fn route_request(self: &Arc<Self>, peer_id: Uuid, envelope: Envelope) {
        let query = envelope
            .context
            .as_ref()
            .and_then(|c| c.summary.clone())
            .unwrap_or_default();
        if query.is_empty() {
            self.handlers.notify_message_received(&envelope, peer_id);
            return;
        }

        if let Some(handler) = self.handlers.context_handler() {
            let this = Arc::clone(self);
            let request_id = envelope.id;
            tokio::spawn(async move {
                let context = match handler.handle_context_request(query, peer_id).await {
                    Ok(chunks) => context_reply(request_id, Some(chunks), None),
                    Err(err) => context_reply(request_id, None, Some(err.to_string())),
                };
                this.send_context(peer_id, context).await;
            });
            return;
        }

        let key = envelope.id.to_string();
        let target = self.forward_target(peer_id);
        match target {
            Some(target) if self.correlator.note_forward_context(&key, peer_id).is_ok() => {
                tracing::debug!(
                    request_id = %key,
                    from = %peer_id,
                    to = %target,
                    "forwarding context request"
                );
                if let Err(err) = self.sender.send(target, &envelope).await {
                    tracing::warn!(request_id = %key, error = %err, "context forward failed");
                    self.correlator.take_forward_context(&key);
                    self.send_context(
                        peer_id,
                        context_reply(
                            envelope.id,
                            None,
                            Some(format!("failed to forward context request: {err}")),
                        ),
                    )
                    .await;
                }
            }
            _ => {
                self.send_context(
                    peer_id,
                    context_reply(envelope.id, None, Some(NO_CONTEXT_HANDLER.to_string())),
                )
                .await;
            }
        }
    }

    /// Any other connected peer, in registry iteration order.
    fn forward_target(&self, excluding: Uuid) -> Option<Uuid> {
        self.registry.ids().into_iter().find(|id| *id != excluding)
    }

    async fn send_result(&self, peer_id: Uuid, result: TaskResult) {
        let envelope =
            Envelope::new(MessageType::Response, &self.instance_name).with_result(result);
        if let Err(err) = self.sender.send(peer_id, &envelope).await {
            tracing::warn!(peer_id = %peer_id, error = %err, "failed to send task response");
        }
    }

    async fn send_context(&self, peer_id: Uuid, context: Context) {
        let envelope =
            Envelope::new(MessageType::Response, &self.instance_name).with_context(context);
        if let Err(err) = self.sender.send(peer_id, &envelope).await {
            tracing::warn!(peer_id = %peer_id, error = %err, "failed to send context response");
        }
    }
}

fn task_outcome(result: TaskResult) -> TaskOutcome {
    match (&result.error, result.success) {
        (Some(message), false) => Err(BridgeError::HandlerFailed {
            message: message.clone(),
        }),
        _ => Ok(result),
    }
}

fn context_outcome(context: &Context) -> ContextOutcome {
    if let Some(message) = context.variable_str("error") {
        return Err(BridgeError::HandlerFailed {
            message: message.to_string(),
        });
    }
    Ok(context.files.clone().unwrap_or_default())
}

/// Build the context payload of a query response.
fn context_reply(
    request_id: Uuid,
    files: Option<Vec<crate::protocol::FileChunk>>,
    error: Option<String>,
) -> Context {
    let mut variables = serde_json::Map::new();
    variables.insert(
        "requestId".to_string(),
        Value::String(request_id.to_string()),
    );
    if let Some(message) = error {
        variables.insert("error".to_string(), Value::String(message));
    }
    Context {
        files,
        tree: None,
        summary: None,
        variables: Some(variables),
    }
}
