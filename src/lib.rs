//! Tether — bidirectional message bridge between cooperating agents.
//!
//! Couples two or more agents running in different environments over one
//! long-lived WebSocket connection per peer, and makes remote agents look
//! local: delegate tasks, request ranked project context, broadcast context
//! updates, observe peer lifecycle.
//!
//! # Architecture
//!
//! - **Protocol**: envelope-based typed messaging, one JSON text frame per
//!   message.
//! - **Transport**: WebSocket (via `tokio-tungstenite`) with heartbeat,
//!   reconnect, and an offline send queue on the dialing side.
//! - **Bridge**: peer registry, request correlation with per-request
//!   deadlines, handler dispatch, and single-hop forwarding of requests no
//!   local handler claims.
//! - **Context engine**: filtered directory walks, query ranking,
//!   token-budgeted excerpts, and snapshot deltas.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tether::{Bridge, BridgeConfig, BridgeMode, ListenConfig};
//!
//! # async fn example() -> Result<(), tether::BridgeError> {
//! let config = BridgeConfig::new(BridgeMode::Host, "build-host")
//!     .with_listen(ListenConfig { host: "127.0.0.1".into(), port: 8790 });
//! let bridge = Bridge::new(config)?;
//! bridge.start().await?;
//! // ... peers connect, tasks and context flow ...
//! bridge.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod protocol;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use auth::{AllowAll, AuthDecision, Authenticator, ConnectionAttempt, TokenAuthenticator};
pub use bridge::{
    Bridge, ContextProvider, ContextRequestHandler, PeerInfo, StatusReport, TaskHandler,
};
pub use config::{BridgeConfig, BridgeMode, ConnectConfig, ContextSharingConfig, ListenConfig};
pub use context::{
    ChangeAction, ContextChange, ContextEngine, ContextEngineConfig, RankedContextHandler,
    Snapshot, estimate_tokens, truncate_to_budget, word_count,
};
pub use error::{BridgeError, SchemaIssue};
pub use protocol::{
    Artifact, ArtifactAction, Context, DirectoryTree, Envelope, FileChunk, MessageType,
    ReturnFormat, TaskRequest, TaskResult, TaskScope, TreeNodeType,
};
pub use transport::{TransportConfig, TransportEvent, TransportState, WsTransport};
