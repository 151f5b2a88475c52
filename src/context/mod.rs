//! Project context engine.
//!
//! Builds a filtered view of a directory tree, ranks files against a
//! free-text query, assembles token-budgeted excerpts, and tracks file-state
//! snapshots for delta computation. The engine never interprets file
//! contents; it only reads, counts, and compares.

mod ranking;
mod snapshot;
mod tokens;
mod walker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::bridge::ContextRequestHandler;
use crate::error::BridgeError;
use crate::protocol::{DirectoryTree, FileChunk};

pub use snapshot::{ChangeAction, ContextChange, Snapshot};
pub use tokens::{estimate_tokens, truncate_to_budget, word_count};

use walker::PathFilters;

#[derive(Debug, Clone)]
pub struct ContextEngineConfig {
    /// Absolute base of the project.
    pub root_path: PathBuf,
    /// Glob patterns; empty means include everything not excluded.
    pub include_patterns: Vec<String>,
    /// Checked before include.
    pub exclude_patterns: Vec<String>,
    pub max_depth: usize,
}

impl ContextEngineConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            max_depth: 10,
        }
    }
}

pub struct ContextEngine {
    config: ContextEngineConfig,
    filters: PathFilters,
    snapshots: Mutex<HashMap<Uuid, Snapshot>>,
}

impl ContextEngine {
    pub fn new(config: ContextEngineConfig) -> Result<Self, BridgeError> {
        let filters = PathFilters::new(&config.include_patterns, &config.exclude_patterns)?;
        Ok(Self {
            config,
            filters,
            snapshots: Mutex::new(HashMap::new()),
        })
    }

    pub fn root_path(&self) -> &PathBuf {
        &self.config.root_path
    }

    /// Filtered directory tree under the root.
    pub fn build_tree(&self) -> DirectoryTree {
        walker::walk(&self.config.root_path, self.config.max_depth, &self.filters).tree
    }

    /// Matching files, relative to the root, in walk order.
    pub fn collect_files(&self) -> Vec<String> {
        walker::walk(&self.config.root_path, self.config.max_depth, &self.filters).files
    }

    /// Files ordered best-first for `query`.
    pub fn rank_files(&self, query: &str) -> Vec<String> {
        ranking::rank(&self.collect_files(), query)
    }

    /// Ranked excerpts whose aggregate token estimate fits `token_budget`.
    pub fn gather_context(&self, query: &str, token_budget: usize) -> Vec<FileChunk> {
        let ranked = self.rank_files(query);
        ranking::assemble_chunks(&self.config.root_path, &ranked, token_budget)
    }

    /// Capture the current file state. Snapshots are retained in memory
    /// until the engine is dropped.
    pub fn snapshot(&self) -> Snapshot {
        let walked = walker::walk(&self.config.root_path, self.config.max_depth, &self.filters);
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            summary: snapshot::summarize(&walked.files),
            key_files: snapshot::key_files(&walked.files),
            files: snapshot::stamp_files(&self.config.root_path, &walked.files),
            tree: walked.tree,
        };
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.id, snapshot.clone());
        snapshot
    }

    /// Changes between snapshot `from_id` and the file system now.
    pub fn delta(&self, from_id: Uuid) -> Result<Vec<ContextChange>, BridgeError> {
        let old = {
            let snapshots = self.snapshots.lock().unwrap();
            snapshots
                .get(&from_id)
                .map(|snapshot| snapshot.files.clone())
                .ok_or(BridgeError::SnapshotNotFound { id: from_id })?
        };
        let walked = walker::walk(&self.config.root_path, self.config.max_depth, &self.filters);
        let now = snapshot::stamp_files(&self.config.root_path, &walked.files);
        Ok(snapshot::compute_delta(&self.config.root_path, &old, &now))
    }
}

/// Bridges context queries straight into an engine: ranked, budgeted
/// excerpts for whatever query a peer sends.
pub struct RankedContextHandler {
    engine: Arc<ContextEngine>,
    token_budget: usize,
}

impl RankedContextHandler {
    pub fn new(engine: Arc<ContextEngine>, token_budget: usize) -> Self {
        Self {
            engine,
            token_budget,
        }
    }
}

#[async_trait]
impl ContextRequestHandler for RankedContextHandler {
    async fn handle_context_request(
        &self,
        query: String,
        _peer_id: Uuid,
    ) -> Result<Vec<FileChunk>, BridgeError> {
        Ok(self.engine.gather_context(&query, self.token_budget))
    }
}
