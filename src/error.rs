//! Error taxonomy for the bridge.
//!
//! Every failure surfaced to a caller is a `BridgeError`. Each variant maps
//! to a stable machine-readable code (`BridgeError::code`) and carries the
//! identifiers a caller needs to act on the failure.

use thiserror::Error;
use uuid::Uuid;

/// A single schema violation found while validating an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    /// JSON path of the offending field, e.g. `task.scope`.
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn join_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(SchemaIssue::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum BridgeError {
    // -- configuration --
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    // -- connection --
    #[error("failed to connect to {url}: {message}")]
    ConnectFailed { url: String, message: String },
    #[error("failed to bind listener on {addr}: {message}")]
    BindFailed { addr: String, message: String },
    #[error("not connected to any peer. Call connect() first")]
    NotConnected,
    #[error("transport is already connected")]
    AlreadyConnected,
    #[error("gave up reconnecting after {attempts} attempts")]
    MaxReconnectsExhausted { attempts: u32 },

    // -- peers --
    #[error("peer {peer_id} not found")]
    PeerNotFound { peer_id: Uuid },
    #[error("no peers connected")]
    NoPeersConnected,
    #[error("peer {peer_id} disconnected")]
    PeerDisconnected { peer_id: Uuid },

    // -- requests --
    #[error("request {id} timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },
    #[error("remote handler failed: {message}")]
    HandlerFailed { message: String },
    #[error("send to peer failed: {message}")]
    SendFailed { message: String },
    #[error("send queue full; peer is not draining")]
    SendBackpressure,
    #[error("duplicate pending request id {id}")]
    DuplicateRequest { id: String },

    // -- protocol --
    #[error("invalid frame: {message}")]
    ParseError { message: String },
    #[error("message failed schema validation: {}", join_issues(.issues))]
    SchemaError { issues: Vec<SchemaIssue> },
    #[error("serialization failed: {message}")]
    SerializeFailed { message: String },

    // -- lifecycle --
    #[error("bridge is already started")]
    AlreadyStarted,
    #[error("bridge is not started. Call start() first")]
    NotStarted,
    #[error("bridge is shutting down")]
    ShuttingDown,

    // -- context engine --
    #[error("snapshot {id} not found")]
    SnapshotNotFound { id: Uuid },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Stable code for logs and wire-visible error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration { .. } => "invalid_configuration",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::BindFailed { .. } => "bind_failed",
            Self::NotConnected => "not_connected",
            Self::AlreadyConnected => "already_connected",
            Self::MaxReconnectsExhausted { .. } => "max_reconnects_exhausted",
            Self::PeerNotFound { .. } => "peer_not_found",
            Self::NoPeersConnected => "no_peers_connected",
            Self::PeerDisconnected { .. } => "peer_disconnected",
            Self::Timeout { .. } => "timeout",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::SendFailed { .. } => "send_failed",
            Self::SendBackpressure => "send_backpressure",
            Self::DuplicateRequest { .. } => "duplicate_request",
            Self::ParseError { .. } => "parse_error",
            Self::SchemaError { .. } => "schema_error",
            Self::SerializeFailed { .. } => "serialize_failed",
            Self::AlreadyStarted => "already_started",
            Self::NotStarted => "not_started",
            Self::ShuttingDown => "shutting_down",
            Self::SnapshotNotFound { .. } => "snapshot_not_found",
            Self::Io(_) => "io",
        }
    }
}
