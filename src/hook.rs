//! Hook protocol payloads
//!
//! The host assistant invokes safepoint around each tool call, passing a
//! JSON payload on stdin. Tool inputs arrive as free-form JSON whose shape
//! varies per tool; they are converted into the [`ToolInvocation`] variant
//! type at this boundary so the orchestrator never pokes at raw maps.

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Payload received from the invoking hook
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookPayload {
    /// Name of the tool being invoked
    #[serde(default)]
    pub tool_name: String,
    /// Tool input, shape varies per tool
    #[serde(default)]
    pub tool_input: Value,
    /// Session the invocation belongs to
    #[serde(default)]
    pub session_id: String,
    /// Present only in the post-operation phase
    #[serde(default)]
    pub tool_response: Option<Value>,
}

impl HookPayload {
    /// Parse a payload from raw JSON text
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Whether this payload belongs to the post-operation phase
    pub fn is_post_phase(&self) -> bool {
        self.tool_response.is_some()
    }

    /// The `success` flag of the tool response; missing means success
    pub fn response_success(&self) -> bool {
        self.tool_response
            .as_ref()
            .and_then(|response| response.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Interpret the tool input for this payload's tool
    pub fn invocation(&self) -> ToolInvocation {
        ToolInvocation::parse(&self.tool_name, &self.tool_input)
    }
}

/// A tool invocation, decoded per tool name
///
/// Only the variants that modify files (plus the synthetic manual trigger)
/// cause a checkpoint; everything else is carried as [`ToolInvocation::Other`]
/// so callers can still name the tool in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    /// File creation
    Write {
        /// Target file, when the input named one
        file_path: Option<PathBuf>,
    },
    /// Single edit to one file
    Edit {
        /// Target file, when the input named one
        file_path: Option<PathBuf>,
    },
    /// Batched edits to one file
    MultiEdit {
        /// Target file, when the input named one
        file_path: Option<PathBuf>,
        /// How many edits the batch carries
        edit_count: usize,
    },
    /// Explicit user-requested checkpoint
    Manual {
        /// Free-text description supplied by the user
        message: Option<String>,
    },
    /// Any other tool, carried by name
    Other(String),
}

impl ToolInvocation {
    /// Decode a tool input payload for the named tool
    pub fn parse(tool_name: &str, tool_input: &Value) -> Self {
        let file_path = tool_input
            .get("file_path")
            .and_then(Value::as_str)
            .map(PathBuf::from);

        match tool_name {
            "Write" => ToolInvocation::Write { file_path },
            "Edit" => ToolInvocation::Edit { file_path },
            "MultiEdit" => ToolInvocation::MultiEdit {
                file_path,
                edit_count: tool_input
                    .get("edits")
                    .and_then(Value::as_array)
                    .map(|edits| edits.len())
                    .unwrap_or(0),
            },
            "Manual" => ToolInvocation::Manual {
                message: tool_input
                    .get("message")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
            },
            other => ToolInvocation::Other(other.to_string()),
        }
    }

    /// Whether this tool modifies files and therefore warrants a snapshot
    pub fn modifies_files(&self) -> bool {
        !matches!(self, ToolInvocation::Other(_))
    }

    /// The file this invocation targets, if any
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            ToolInvocation::Write { file_path }
            | ToolInvocation::Edit { file_path }
            | ToolInvocation::MultiEdit { file_path, .. } => file_path.as_deref(),
            _ => None,
        }
    }

    /// Human-readable checkpoint description for this invocation
    pub fn message(&self) -> String {
        match self {
            ToolInvocation::Write { file_path } => match filename(file_path) {
                Some(name) => format!("Before creating {}", name),
                None => "Before creating new file".to_string(),
            },
            ToolInvocation::Edit { file_path } => match filename(file_path) {
                Some(name) => format!("Before editing {}", name),
                None => "Before editing file".to_string(),
            },
            ToolInvocation::MultiEdit {
                file_path,
                edit_count,
            } => match filename(file_path) {
                Some(name) => format!("Before {} edits to {}", edit_count, name),
                None => "Before multi-edit operation".to_string(),
            },
            ToolInvocation::Manual { message } => message
                .clone()
                .unwrap_or_else(|| "Manual checkpoint".to_string()),
            ToolInvocation::Other(tool) => format!("Before {} operation", tool),
        }
    }
}

fn filename(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref()
        .and_then(|p| p.file_name())
        .map(|name| name.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_message() {
        let invocation =
            ToolInvocation::parse("Write", &json!({ "file_path": "/p/main.py" }));
        assert_eq!(invocation.message(), "Before creating main.py");
        assert!(invocation.modifies_files());
    }

    #[test]
    fn test_edit_message_without_path() {
        let invocation = ToolInvocation::parse("Edit", &json!({}));
        assert_eq!(invocation.message(), "Before editing file");
    }

    #[test]
    fn test_multiedit_message() {
        let invocation = ToolInvocation::parse(
            "MultiEdit",
            &json!({ "file_path": "/p/app.py", "edits": [{}, {}] }),
        );
        assert_eq!(invocation.message(), "Before 2 edits to app.py");
    }

    #[test]
    fn test_manual_message() {
        let invocation =
            ToolInvocation::parse("Manual", &json!({ "message": "before refactor" }));
        assert_eq!(invocation.message(), "before refactor");

        let invocation = ToolInvocation::parse("Manual", &json!({}));
        assert_eq!(invocation.message(), "Manual checkpoint");
    }

    #[test]
    fn test_other_tool_does_not_modify() {
        let invocation = ToolInvocation::parse("Bash", &json!({ "command": "ls" }));
        assert!(!invocation.modifies_files());
        assert_eq!(invocation.message(), "Before Bash operation");
    }

    #[test]
    fn test_payload_parsing() {
        let payload = HookPayload::from_json(
            r#"{"tool_name": "Write", "tool_input": {"file_path": "/p/x.py"}, "session_id": "s1"}"#,
        )
        .unwrap();
        assert_eq!(payload.tool_name, "Write");
        assert_eq!(payload.session_id, "s1");
        assert!(!payload.is_post_phase());
        assert_eq!(
            payload.invocation().file_path(),
            Some(Path::new("/p/x.py"))
        );
    }

    #[test]
    fn test_response_success_defaults_true() {
        let payload = HookPayload::from_json(
            r#"{"tool_name": "Edit", "tool_response": {}}"#,
        )
        .unwrap();
        assert!(payload.is_post_phase());
        assert!(payload.response_success());

        let payload = HookPayload::from_json(
            r#"{"tool_name": "Edit", "tool_response": {"success": false}}"#,
        )
        .unwrap();
        assert!(!payload.response_success());
    }
}
