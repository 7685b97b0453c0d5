//! File write tool — write or create files in the workspace.
//!
//! Writes replace the whole file. Two runs writing the same path race and
//! the last write wins.

use async_trait::async_trait;
use nimbot_core::error::ToolError;
use nimbot_core::tool::{Tool, ToolContext};
use tracing::debug;

use crate::workspace::{io_failure, required_str, Workspace};

pub struct WriteFileTool {
    workspace: Workspace,
}

impl WriteFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file and any missing parent directories; overwrites an existing file."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to",
                    "minLength": 1
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let path = required_str(&arguments, "path")?;
        let content = required_str(&arguments, "content")?;
        let resolved = self.workspace.resolve(self.name(), path)?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure(self.name(), "create directories for", path, e))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| io_failure(self.name(), "write", path, e))?;

        debug!(path = %resolved.display(), bytes = content.len(), "File written");
        Ok(format!("Successfully wrote {} bytes to {path}", content.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbot_core::event::SessionKey;

    fn ctx() -> ToolContext {
        ToolContext::new(SessionKey::new("cli", "direct"), "in-1")
    }

    #[tokio::test]
    async fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(Workspace::new(dir.path(), true));

        let output = tool
            .execute(serde_json::json!({"path": "out/deep/result.txt", "content": "4"}), &ctx())
            .await
            .unwrap();
        assert!(output.contains("1 bytes"));
        assert_eq!(std::fs::read_to_string(dir.path().join("out/deep/result.txt")).unwrap(), "4");
    }

    #[tokio::test]
    async fn last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(Workspace::new(dir.path(), false));
        for content in ["first", "second"] {
            tool.execute(serde_json::json!({"path": "a.txt", "content": content}), &ctx())
                .await
                .unwrap();
        }
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "second");
    }

    #[tokio::test]
    async fn absolute_escape_is_denied_when_restricted() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("x.txt");

        let tool = WriteFileTool::new(Workspace::new(dir.path(), true));
        let err = tool
            .execute(
                serde_json::json!({"path": target.display().to_string(), "content": "x"}),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
        assert!(!target.exists());
    }
}
