//! File read tool — read file contents from the workspace.

use async_trait::async_trait;
use nimbot_core::error::ToolError;
use nimbot_core::tool::{Tool, ToolContext};
use tracing::debug;

use crate::workspace::{io_failure, required_str, Workspace};

/// Files larger than this are truncated before reaching the model.
const MAX_READ_CHARS: usize = 128_000;

pub struct ReadFileTool {
    workspace: Workspace,
}

impl ReadFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Relative paths are resolved against the workspace."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read",
                    "minLength": 1
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let path = required_str(&arguments, "path")?;
        let resolved = self.workspace.resolve(self.name(), path)?;

        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| io_failure(self.name(), "read", path, e))?;
        if !metadata.is_file() {
            return Err(ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: format!("{path} is not a file"),
            });
        }

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| io_failure(self.name(), "read", path, e))?;
        debug!(path = %resolved.display(), bytes = content.len(), "File read");

        Ok(truncate_chars(content, MAX_READ_CHARS))
    }
}

/// Cut `text` to at most `max` characters, noting how much was dropped.
pub(crate) fn truncate_chars(text: String, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text;
    }
    let kept: String = text.chars().take(max).collect();
    format!("{kept}\n... (truncated, {} more chars)", total - max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbot_core::event::SessionKey;

    fn ctx() -> ToolContext {
        ToolContext::new(SessionKey::new("cli", "direct"), "in-1")
    }

    #[tokio::test]
    async fn reads_relative_to_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "Hello, world!").unwrap();

        let tool = ReadFileTool::new(Workspace::new(dir.path(), true));
        let output = tool
            .execute(serde_json::json!({"path": "hello.txt"}), &ctx())
            .await
            .unwrap();
        assert_eq!(output, "Hello, world!");
    }

    #[tokio::test]
    async fn missing_file_is_an_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(Workspace::new(dir.path(), false));
        let err = tool
            .execute(serde_json::json!({"path": "nope.txt"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn directory_is_not_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(Workspace::new(dir.path(), false));
        let err = tool
            .execute(serde_json::json!({"path": "."}), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a file"));
    }

    #[tokio::test]
    async fn escape_is_denied_when_restricted() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(Workspace::new(dir.path(), true));
        let err = tool
            .execute(serde_json::json!({"path": "../../etc/passwd"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("short".into(), 10), "short");
        let cut = truncate_chars("ééééé".into(), 2);
        assert!(cut.starts_with("éé\n"));
        assert!(cut.ends_with("(truncated, 3 more chars)"));
    }
}
