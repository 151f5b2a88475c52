//! Bridge protocol messages.
//!
//! Defines the wire format for inter-agent communication: one JSON text
//! frame per message, every frame an [`Envelope`] with exactly one payload
//! field populated for its [`MessageType`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BridgeError;

mod validate;

pub use validate::validate_envelope;

/// Closed set of message kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Context query; the response correlates via `context.variables.requestId`.
    Request,
    /// Response to a `request` or `task_delegate`.
    Response,
    /// Fire-and-forget context broadcast.
    ContextSync,
    /// Task handed to a peer; the response correlates via `result.taskId`.
    TaskDelegate,
    /// Fire-and-forget human-readable notice.
    Notification,
}

/// The message envelope. `id` is globally unique and doubles as the
/// correlation key for request-shaped messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Instance name of the sending bridge.
    pub source: String,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl Envelope {
    /// Create an empty envelope with a fresh UUIDv4 and the current time.
    pub fn new(kind: MessageType, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source: source.into(),
            timestamp: Utc::now().timestamp_millis(),
            context: None,
            task: None,
            result: None,
        }
    }

    pub fn with_task(mut self, task: TaskRequest) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_result(mut self, result: TaskResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }
}

/// What a delegated task is allowed to do on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskScope {
    Execute,
    Analyze,
    Suggest,
}

/// How much of the task output the delegator wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnFormat {
    Full,
    Summary,
    Diff,
}

/// A task handed to a remote peer for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub id: String,
    pub description: String,
    pub scope: TaskScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_format: Option<ReturnFormat>,
    /// Per-task timeout in milliseconds; falls back to the bridge default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, Value>>,
}

impl TaskRequest {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        scope: TaskScope,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            scope,
            constraints: None,
            return_format: None,
            timeout: None,
            data: None,
        }
    }
}

/// What happened to a file while a task ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactAction {
    Created,
    Modified,
    Deleted,
}

/// A file the remote task touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub path: String,
    pub action: ArtifactAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Outcome of a delegated task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Echo of the originating task id; the correlation key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Artifact>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    /// A failure result carrying only an error message.
    pub fn failure(task_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            data: Value::Null,
            artifacts: None,
            follow_up: None,
            error: Some(message.into()),
        }
    }
}

/// A slice of a file shared across the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub path: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// File or directory marker for [`DirectoryTree`] nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNodeType {
    File,
    Directory,
}

/// Recursive directory listing shared as part of a context payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryTree {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: TreeNodeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<DirectoryTree>>,
}

/// Project context payload: any combination of file excerpts, a directory
/// tree, a free-text summary, and untyped variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileChunk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree: Option<DirectoryTree>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Map<String, Value>>,
}

impl Context {
    /// Read a string-valued entry out of `variables`.
    pub fn variable_str(&self, key: &str) -> Option<&str> {
        self.variables
            .as_ref()
            .and_then(|vars| vars.get(key))
            .and_then(Value::as_str)
    }
}

/// Serialize an envelope to a single JSON text frame.
///
/// Never silently drops fields; fails only when a payload value cannot be
/// encoded.
pub fn serialize(envelope: &Envelope) -> Result<String, BridgeError> {
    serde_json::to_string(envelope).map_err(|e| BridgeError::SerializeFailed {
        message: e.to_string(),
    })
}

/// Decode and validate one inbound frame.
///
/// Frames that are not JSON fail with `ParseError`; JSON that does not
/// satisfy the envelope schema fails with `SchemaError` listing every
/// violation. Unknown fields are ignored.
pub fn deserialize(frame: &str) -> Result<Envelope, BridgeError> {
    let value: Value = serde_json::from_str(frame).map_err(|e| BridgeError::ParseError {
        message: e.to_string(),
    })?;
    let issues = validate_envelope(&value);
    if !issues.is_empty() {
        return Err(BridgeError::SchemaError { issues });
    }
    serde_json::from_value(value).map_err(|e| BridgeError::ParseError {
        message: e.to_string(),
    })
}
