//! Hand-written envelope validator.
//!
//! Runs against the raw JSON value before the typed decode so that a bad
//! frame reports every violation with its JSON path instead of failing on
//! the first serde error.

use serde_json::Value;
use uuid::Uuid;

use crate::error::SchemaIssue;

const MESSAGE_TYPES: &[&str] = &[
    "request",
    "response",
    "context_sync",
    "task_delegate",
    "notification",
];

const TASK_SCOPES: &[&str] = &["execute", "analyze", "suggest"];
const RETURN_FORMATS: &[&str] = &["full", "summary", "diff"];

/// Validate a decoded JSON value against the envelope schema.
///
/// Returns one issue per violation; an empty vector means the frame is
/// schema-valid. Unknown fields are not reported.
pub fn validate_envelope(value: &Value) -> Vec<SchemaIssue> {
    let mut issues = Vec::new();

    let Some(obj) = value.as_object() else {
        issues.push(issue("", "frame is not a JSON object"));
        return issues;
    };

    match obj.get("id").and_then(Value::as_str) {
        Some(id) => {
            if Uuid::parse_str(id).is_err() {
                issues.push(issue("id", "not a UUID"));
            }
        }
        None => issues.push(issue("id", "missing or not a string")),
    }

    match obj.get("type").and_then(Value::as_str) {
        Some(kind) => {
            if !MESSAGE_TYPES.contains(&kind) {
                issues.push(issue("type", "unknown message type"));
            }
        }
        None => issues.push(issue("type", "missing or not a string")),
    }

    if obj.get("source").and_then(Value::as_str).is_none() {
        issues.push(issue("source", "missing or not a string"));
    }

    if obj.get("timestamp").and_then(Value::as_i64).is_none() {
        issues.push(issue("timestamp", "missing or not an integer"));
    }

    if let Some(task) = obj.get("task") {
        validate_task(task, &mut issues);
    }
    if let Some(result) = obj.get("result") {
        validate_result(result, &mut issues);
    }
    if let Some(context) = obj.get("context") {
        validate_context(context, &mut issues);
    }

    issues
}

fn validate_task(value: &Value, issues: &mut Vec<SchemaIssue>) {
    let Some(obj) = value.as_object() else {
        issues.push(issue("task", "not an object"));
        return;
    };
    if obj.get("id").and_then(Value::as_str).is_none() {
        issues.push(issue("task.id", "missing or not a string"));
    }
    if obj.get("description").and_then(Value::as_str).is_none() {
        issues.push(issue("task.description", "missing or not a string"));
    }
    match obj.get("scope").and_then(Value::as_str) {
        Some(scope) => {
            if !TASK_SCOPES.contains(&scope) {
                issues.push(issue("task.scope", "unknown scope"));
            }
        }
        None => issues.push(issue("task.scope", "missing or not a string")),
    }
    if let Some(format) = obj.get("returnFormat") {
        match format.as_str() {
            Some(f) if RETURN_FORMATS.contains(&f) => {}
            _ => issues.push(issue("task.returnFormat", "unknown return format")),
        }
    }
    if let Some(timeout) = obj.get("timeout") {
        if timeout.as_u64().is_none() {
            issues.push(issue("task.timeout", "not a non-negative integer"));
        }
    }
}

fn validate_result(value: &Value, issues: &mut Vec<SchemaIssue>) {
    let Some(obj) = value.as_object() else {
        issues.push(issue("result", "not an object"));
        return;
    };
    if obj.get("success").and_then(Value::as_bool).is_none() {
        issues.push(issue("result.success", "missing or not a boolean"));
    }
    if let Some(task_id) = obj.get("taskId") {
        if task_id.as_str().is_none() {
            issues.push(issue("result.taskId", "not a string"));
        }
    }
    if let Some(artifacts) = obj.get("artifacts") {
        match artifacts.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    validate_artifact(item, i, issues);
                }
            }
            None => issues.push(issue("result.artifacts", "not an array")),
        }
    }
}

fn validate_artifact(value: &Value, index: usize, issues: &mut Vec<SchemaIssue>) {
    let path = format!("result.artifacts[{index}]");
    let Some(obj) = value.as_object() else {
        issues.push(issue(&path, "not an object"));
        return;
    };
    if obj.get("path").and_then(Value::as_str).is_none() {
        issues.push(issue(&format!("{path}.path"), "missing or not a string"));
    }
    match obj.get("action").and_then(Value::as_str) {
        Some("created" | "modified" | "deleted") => {}
        _ => issues.push(issue(&format!("{path}.action"), "unknown artifact action")),
    }
}

fn validate_context(value: &Value, issues: &mut Vec<SchemaIssue>) {
    let Some(obj) = value.as_object() else {
        issues.push(issue("context", "not an object"));
        return;
    };
    if let Some(files) = obj.get("files") {
        match files.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    let path = format!("context.files[{i}]");
                    match item.as_object() {
                        Some(chunk) => {
                            if chunk.get("path").and_then(Value::as_str).is_none() {
                                issues.push(issue(
                                    &format!("{path}.path"),
                                    "missing or not a string",
                                ));
                            }
                            if chunk.get("content").and_then(Value::as_str).is_none() {
                                issues.push(issue(
                                    &format!("{path}.content"),
                                    "missing or not a string",
                                ));
                            }
                        }
                        None => issues.push(issue(&path, "not an object")),
                    }
                }
            }
            None => issues.push(issue("context.files", "not an array")),
        }
    }
    if let Some(summary) = obj.get("summary") {
        if summary.as_str().is_none() {
            issues.push(issue("context.summary", "not a string"));
        }
    }
    if let Some(variables) = obj.get("variables") {
        if variables.as_object().is_none() {
            issues.push(issue("context.variables", "not an object"));
        }
    }
    if let Some(tree) = obj.get("tree") {
        validate_tree(tree, "context.tree", 0, issues);
    }
}

fn validate_tree(value: &Value, path: &str, depth: usize, issues: &mut Vec<SchemaIssue>) {
    // Cap recursion so a hostile frame cannot blow the stack.
    if depth > 64 {
        issues.push(issue(path, "tree nested too deeply"));
        return;
    }
    let Some(obj) = value.as_object() else {
        issues.push(issue(path, "not an object"));
        return;
    };
    if obj.get("name").and_then(Value::as_str).is_none() {
        issues.push(issue(&format!("{path}.name"), "missing or not a string"));
    }
    match obj.get("type").and_then(Value::as_str) {
        Some("file" | "directory") => {}
        _ => issues.push(issue(&format!("{path}.type"), "unknown node type")),
    }
    if let Some(children) = obj.get("children") {
        match children.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    validate_tree(item, &format!("{path}.children[{i}]"), depth + 1, issues);
                }
            }
            None => issues.push(issue(&format!("{path}.children"), "not an array")),
        }
    }
}

fn issue(path: &str, message: &str) -> SchemaIssue {
    SchemaIssue {
        path: path.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_envelope_has_no_issues() {
        let frame = json!({
            "id": Uuid::new_v4(),
            "type": "task_delegate",
            "source": "alpha",
            "timestamp": 1_700_000_000_000i64,
            "task": {"id": "t-1", "description": "x", "scope": "execute"},
        });
        assert!(validate_envelope(&frame).is_empty());
    }

    #[test]
    fn reports_every_violation_with_its_path() {
        let frame = json!({
            "id": "nope",
            "type": "telepathy",
            "timestamp": "later",
            "task": {"scope": "world_domination"},
        });
        let issues = validate_envelope(&frame);
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"id"));
        assert!(paths.contains(&"type"));
        assert!(paths.contains(&"source"));
        assert!(paths.contains(&"timestamp"));
        assert!(paths.contains(&"task.id"));
        assert!(paths.contains(&"task.scope"));
    }

    #[test]
    fn bad_artifact_action_is_reported() {
        let frame = json!({
            "id": Uuid::new_v4(),
            "type": "response",
            "source": "alpha",
            "timestamp": 0,
            "result": {
                "success": true,
                "artifacts": [{"path": "a.rs", "action": "vaporized"}],
            },
        });
        let issues = validate_envelope(&frame);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "result.artifacts[0].action");
    }
}
