//! Filtered directory traversal.
//!
//! Depth-first with a visited set over canonical paths, so symlink cycles
//! terminate. Unreadable entries and broken symlinks are skipped silently.
//! Children sort directories-first, then byte order.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::BridgeError;
use crate::protocol::{DirectoryTree, TreeNodeType};

/// Compiled include/exclude patterns. Exclude is checked before include;
/// an empty include list means everything not excluded.
pub(crate) struct PathFilters {
    include_raw: Vec<String>,
    include: GlobSet,
    exclude: GlobSet,
}

impl PathFilters {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, BridgeError> {
        Ok(Self {
            include_raw: include.to_vec(),
            include: build_set(include)?,
            exclude: build_set(exclude)?,
        })
    }

    pub fn file_matches(&self, rel: &str) -> bool {
        if self.exclude.is_match(rel) {
            return false;
        }
        self.include_raw.is_empty() || self.include.is_match(rel)
    }

    /// Could `rel_dir` plausibly contain a matching file? Compares the
    /// directory's segments against each include pattern's leading segments;
    /// a `**` anywhere in the prefix keeps the directory alive.
    pub fn dir_could_match(&self, rel_dir: &str) -> bool {
        if self.include_raw.is_empty() {
            return true;
        }
        self.include_raw.iter().any(|pattern| {
            if pattern.starts_with("**") {
                return true;
            }
            let pattern_segments: Vec<&str> = pattern.split('/').collect();
            for (i, dir_segment) in rel_dir.split('/').enumerate() {
                match pattern_segments.get(i) {
                    None => return false,
                    Some(&"**") => return true,
                    Some(pattern_segment) => {
                        if !segment_matches(pattern_segment, dir_segment) {
                            return false;
                        }
                    }
                }
            }
            true
        })
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, BridgeError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| BridgeError::InvalidConfiguration {
                message: format!("bad glob pattern {pattern:?}: {e}"),
            })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| BridgeError::InvalidConfiguration {
            message: format!("glob set: {e}"),
        })
}

/// Match one path segment against one pattern segment (`*` and `?` only).
fn segment_matches(pattern: &str, segment: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = segment.chars().collect();
    // Iterative wildcard match with a single backtrack point.
    let (mut pi, mut si) = (0usize, 0usize);
    let (mut star, mut star_si) = (None::<usize>, 0usize);
    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_si = si;
            pi += 1;
        } else if let Some(star_pi) = star {
            pi = star_pi + 1;
            star_si += 1;
            si = star_si;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

pub(crate) struct WalkedFiles {
    pub tree: DirectoryTree,
    /// Matching files, relative to the root, '/'-separated, walk order.
    pub files: Vec<String>,
}

pub(crate) fn walk(root: &Path, max_depth: usize, filters: &PathFilters) -> WalkedFiles {
    let mut visited: HashSet<PathBuf> = HashSet::new();
    if let Ok(canonical) = root.canonicalize() {
        visited.insert(canonical);
    }
    let mut files = Vec::new();
    let children = walk_dir(root, "", 0, max_depth, filters, &mut visited, &mut files);
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string());
    WalkedFiles {
        tree: DirectoryTree {
            name,
            node_type: TreeNodeType::Directory,
            children: Some(children),
        },
        files,
    }
}

#[allow(clippy::too_many_arguments)]
fn walk_dir(
    dir: &Path,
    rel_prefix: &str,
    depth: usize,
    max_depth: usize,
    filters: &PathFilters,
    visited: &mut HashSet<PathBuf>,
    files: &mut Vec<String>,
) -> Vec<DirectoryTree> {
    let Ok(read) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut entries: Vec<(String, bool, PathBuf)> = Vec::new();
    for entry in read.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        // metadata() follows symlinks; broken links fail and are skipped.
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        entries.push((name, meta.is_dir(), path));
    }
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_bytes().cmp(b.0.as_bytes())));

    let mut nodes = Vec::new();
    for (name, is_dir, path) in entries {
        let rel = if rel_prefix.is_empty() {
            name.clone()
        } else {
            format!("{rel_prefix}/{name}")
        };
        if is_dir {
            if depth + 1 > max_depth || !filters.dir_could_match(&rel) {
                continue;
            }
            let Ok(canonical) = path.canonicalize() else {
                continue;
            };
            if !visited.insert(canonical) {
                continue; // symlink cycle; already walked
            }
            let children = walk_dir(&path, &rel, depth + 1, max_depth, filters, visited, files);
            nodes.push(DirectoryTree {
                name,
                node_type: TreeNodeType::Directory,
                children: Some(children),
            });
        } else if filters.file_matches(&rel) {
            files.push(rel);
            nodes.push(DirectoryTree {
                name,
                node_type: TreeNodeType::File,
                children: None,
            });
        }
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn filters(include: &[&str], exclude: &[&str]) -> PathFilters {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        PathFilters::new(&include, &exclude).expect("filters")
    }

    #[test]
    fn segment_wildcards() {
        assert!(segment_matches("*", "anything"));
        assert!(segment_matches("src*", "srcgen"));
        assert!(segment_matches("?rc", "src"));
        assert!(!segment_matches("src", "lib"));
        assert!(segment_matches("*.ts", ".hidden.ts"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let f = filters(&["**/*.ts"], &["**/generated/**"]);
        assert!(f.file_matches("src/app.ts"));
        assert!(!f.file_matches("src/generated/app.ts"));
    }

    #[test]
    fn empty_include_means_everything_not_excluded() {
        let f = filters(&[], &["*.log"]);
        assert!(f.file_matches("src/main.rs"));
        assert!(!f.file_matches("debug.log"));
    }

    #[test]
    fn dir_pruning_follows_pattern_prefixes() {
        let f = filters(&["src/*.ts"], &[]);
        assert!(f.dir_could_match("src"));
        assert!(!f.dir_could_match("vendor"));

        let f = filters(&["**/*.ts"], &[]);
        assert!(f.dir_could_match("anything/at/all"));

        let f = filters(&["src/**/*.ts"], &[]);
        assert!(f.dir_could_match("src"));
        assert!(f.dir_could_match("src/deep/nested"));
        assert!(!f.dir_could_match("test"));
    }

    #[test]
    fn walk_sorts_directories_before_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("zz.txt"), "z").expect("write");
        fs::create_dir(dir.path().join("aa")).expect("mkdir");
        fs::create_dir(dir.path().join("bb")).expect("mkdir");
        fs::write(dir.path().join("aa/inner.txt"), "i").expect("write");

        let f = filters(&[], &[]);
        let walked = walk(dir.path(), 10, &f);
        let children = walked.tree.children.expect("children");
        let names: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["aa", "bb", "zz.txt"]);
        assert_eq!(walked.files, vec!["aa/inner.txt", "zz.txt"]);
    }

    #[test]
    fn max_depth_caps_recursion() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("a/b/c")).expect("mkdirs");
        fs::write(dir.path().join("a/b/c/deep.txt"), "d").expect("write");
        fs::write(dir.path().join("a/shallow.txt"), "s").expect("write");

        let f = filters(&[], &[]);
        let walked = walk(dir.path(), 2, &f);
        assert_eq!(walked.files, vec!["a/shallow.txt"]);
    }
}
