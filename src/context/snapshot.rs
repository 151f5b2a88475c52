//! File-state snapshots and deltas.

use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::protocol::DirectoryTree;

/// Bytes of current content carried as the diff of a modified file.
const DIFF_LIMIT: usize = 1000;

/// Basenames that anchor a project regardless of where they sit.
const KEY_BASENAMES: &[&str] = &[
    "package.json",
    "tsconfig.json",
    "index.ts",
    "index.js",
    "main.ts",
    "main.js",
    "app.ts",
    "app.js",
    "README.md",
    "CLAUDE.md",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileStamp {
    pub mtime_ms: i64,
    pub size: u64,
}

/// Immutable record of the file set at one point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tree: DirectoryTree,
    /// One line: file count plus the top extensions.
    pub summary: String,
    pub key_files: Vec<String>,
    pub(crate) files: HashMap<String, FileStamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Added,
    Modified,
    Deleted,
}

/// One entry of a snapshot delta.
#[derive(Debug, Clone, Serialize)]
pub struct ContextChange {
    pub path: String,
    pub action: ChangeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Stat every file; entries that fail to stat are dropped.
pub(crate) fn stamp_files(root: &Path, rel_files: &[String]) -> HashMap<String, FileStamp> {
    let mut stamps = HashMap::new();
    for rel in rel_files {
        let Ok(meta) = std::fs::metadata(root.join(rel)) else {
            continue;
        };
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0);
        stamps.insert(
            rel.clone(),
            FileStamp {
                mtime_ms,
                size: meta.len(),
            },
        );
    }
    stamps
}

/// One-line description: count plus top-5 extensions by frequency.
pub(crate) fn summarize(rel_files: &[String]) -> String {
    let mut by_extension: HashMap<&str, usize> = HashMap::new();
    for rel in rel_files {
        if let Some((_, extension)) = rel.rsplit_once('.') {
            *by_extension.entry(extension).or_default() += 1;
        }
    }
    let mut counts: Vec<(&str, usize)> = by_extension.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    counts.truncate(5);
    let extensions = counts
        .iter()
        .map(|(extension, count)| format!("{extension} ({count})"))
        .collect::<Vec<_>>()
        .join(", ");
    if extensions.is_empty() {
        format!("{} files", rel_files.len())
    } else {
        format!("{} files; top extensions: {extensions}", rel_files.len())
    }
}

pub(crate) fn key_files(rel_files: &[String]) -> Vec<String> {
    rel_files
        .iter()
        .filter(|rel| {
            let basename = rel.rsplit('/').next().unwrap_or(rel);
            KEY_BASENAMES.contains(&basename)
        })
        .cloned()
        .collect()
}

/// Compare a prior stamp map against the current one.
pub(crate) fn compute_delta(
    root: &Path,
    old: &HashMap<String, FileStamp>,
    now: &HashMap<String, FileStamp>,
) -> Vec<ContextChange> {
    let mut changes = Vec::new();

    let mut current: Vec<&String> = now.keys().collect();
    current.sort();
    for path in current {
        match old.get(path) {
            None => changes.push(ContextChange {
                path: path.clone(),
                action: ChangeAction::Added,
                diff: None,
            }),
            Some(previous) if previous != &now[path] => changes.push(ContextChange {
                path: path.clone(),
                action: ChangeAction::Modified,
                diff: read_diff(root, path),
            }),
            Some(_) => {}
        }
    }

    let mut gone: Vec<&String> = old.keys().filter(|path| !now.contains_key(*path)).collect();
    gone.sort();
    for path in gone {
        changes.push(ContextChange {
            path: path.clone(),
            action: ChangeAction::Deleted,
            diff: None,
        });
    }

    changes
}

/// First `DIFF_LIMIT` bytes of current content, `"..."`-suffixed when cut.
fn read_diff(root: &Path, rel: &str) -> Option<String> {
    let bytes = std::fs::read(root.join(rel)).ok()?;
    let truncated = bytes.len() > DIFF_LIMIT;
    let slice = &bytes[..bytes.len().min(DIFF_LIMIT)];
    let mut text = String::from_utf8_lossy(slice).into_owned();
    if truncated {
        text.push_str("...");
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_top_extensions() {
        let files = vec![
            "a.ts".to_string(),
            "b.ts".to_string(),
            "c.rs".to_string(),
            "README.md".to_string(),
        ];
        let summary = summarize(&files);
        assert!(summary.starts_with("4 files"));
        assert!(summary.contains("ts (2)"));
        assert!(summary.contains("rs (1)"));
    }

    #[test]
    fn key_files_match_on_basename_anywhere() {
        let files = vec![
            "package.json".to_string(),
            "src/index.ts".to_string(),
            "src/util.ts".to_string(),
            "docs/README.md".to_string(),
        ];
        assert_eq!(
            key_files(&files),
            vec![
                "package.json".to_string(),
                "src/index.ts".to_string(),
                "docs/README.md".to_string(),
            ]
        );
    }

    #[test]
    fn delta_classifies_added_modified_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("kept.ts"), "same").expect("write");
        std::fs::write(dir.path().join("changed.ts"), "now longer content").expect("write");

        let mut old = HashMap::new();
        old.insert(
            "kept.ts".to_string(),
            FileStamp {
                mtime_ms: 1,
                size: 4,
            },
        );
        old.insert(
            "changed.ts".to_string(),
            FileStamp {
                mtime_ms: 1,
                size: 1,
            },
        );
        old.insert(
            "removed.ts".to_string(),
            FileStamp {
                mtime_ms: 1,
                size: 9,
            },
        );

        let mut now = HashMap::new();
        now.insert(
            "kept.ts".to_string(),
            FileStamp {
                mtime_ms: 1,
                size: 4,
            },
        );
        now.insert(
            "changed.ts".to_string(),
            FileStamp {
                mtime_ms: 1,
                size: 18,
            },
        );
        now.insert(
            "fresh.ts".to_string(),
            FileStamp {
                mtime_ms: 2,
                size: 3,
            },
        );

        let changes = compute_delta(dir.path(), &old, &now);
        assert_eq!(changes.len(), 3);
        assert!(changes
            .iter()
            .any(|c| c.path == "fresh.ts" && c.action == ChangeAction::Added));
        assert!(changes
            .iter()
            .any(|c| c.path == "changed.ts"
                && c.action == ChangeAction::Modified
                && c.diff.as_deref() == Some("now longer content")));
        assert!(changes
            .iter()
            .any(|c| c.path == "removed.ts" && c.action == ChangeAction::Deleted));
    }

    #[test]
    fn long_diffs_are_truncated_with_ellipsis() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = "x".repeat(1500);
        std::fs::write(dir.path().join("big.ts"), &content).expect("write");

        let diff = read_diff(dir.path(), "big.ts").expect("diff");
        assert_eq!(diff.len(), 1003);
        assert!(diff.ends_with("..."));
    }
}
