//! Query-driven file ranking and budgeted chunk assembly.

use std::path::Path;

use crate::context::tokens::estimate_tokens;
use crate::protocol::FileChunk;

/// Lowercased whitespace tokens longer than two characters.
pub(crate) fn keywords(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|word| word.len() > 2)
        .map(str::to_string)
        .collect()
}

/// 10 per keyword found in the lowercased path, +5 for entrypoint
/// basenames, +3 for package.json.
pub(crate) fn score(rel_path: &str, keywords: &[String]) -> i64 {
    let lower = rel_path.to_lowercase();
    let mut score = 10 * keywords
        .iter()
        .filter(|keyword| lower.contains(keyword.as_str()))
        .count() as i64;
    let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    if matches!(basename, "index.ts" | "index.js" | "main.ts" | "main.js") {
        score += 5;
    }
    if basename == "package.json" {
        score += 3;
    }
    score
}

/// Sort descending by score, ties by ascending path.
pub(crate) fn rank(files: &[String], query: &str) -> Vec<String> {
    let keywords = keywords(query);
    let mut scored: Vec<(i64, &String)> = files
        .iter()
        .map(|path| (score(path, &keywords), path))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored.into_iter().map(|(_, path)| path.clone()).collect()
}

pub(crate) fn language_for(path: &str) -> Option<String> {
    let extension = path.rsplit('.').next()?;
    let language = match extension {
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "rs" => "rust",
        "py" => "python",
        "go" => "go",
        "json" => "json",
        "md" => "markdown",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "sh" => "shell",
        "html" => "html",
        "css" => "css",
        _ => return None,
    };
    Some(language.to_string())
}

/// Walk the ranked list, including whole files while they fit the token
/// budget. An oversized first candidate is truncated line-wise and assembly
/// stops; files unreadable as UTF-8 are skipped.
pub(crate) fn assemble_chunks(root: &Path, ranked: &[String], budget: usize) -> Vec<FileChunk> {
    let mut chunks = Vec::new();
    let mut used = 0usize;
    for rel in ranked {
        let Ok(content) = std::fs::read_to_string(root.join(rel)) else {
            continue;
        };
        let cost = estimate_tokens(&content);
        if used + cost <= budget {
            used += cost;
            chunks.push(FileChunk {
                path: rel.clone(),
                content,
                start_line: None,
                end_line: None,
                language: language_for(rel),
            });
            continue;
        }
        if chunks.is_empty() {
            if let Some(chunk) = truncated_prefix(rel, &content, budget) {
                chunks.push(chunk);
            }
        }
        break;
    }
    chunks
}

/// Longest line-wise prefix that fits the budget.
fn truncated_prefix(rel: &str, content: &str, budget: usize) -> Option<FileChunk> {
    let mut kept = String::new();
    let mut kept_lines = 0u32;
    for line in content.lines() {
        let candidate_len = kept.len() + line.len() + 1;
        let mut candidate = String::with_capacity(candidate_len);
        candidate.push_str(&kept);
        candidate.push_str(line);
        candidate.push('\n');
        if estimate_tokens(&candidate) > budget {
            break;
        }
        kept = candidate;
        kept_lines += 1;
    }
    if kept.is_empty() {
        return None;
    }
    Some(FileChunk {
        path: rel.to_string(),
        content: kept,
        start_line: Some(1),
        end_line: Some(kept_lines),
        language: language_for(rel),
    })
}
