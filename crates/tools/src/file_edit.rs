//! File edit tool — replace one exact span of text in a file.

use async_trait::async_trait;
use nimbot_core::error::ToolError;
use nimbot_core::tool::{Tool, ToolContext};
use tracing::debug;

use crate::workspace::{io_failure, required_str, Workspace};

pub struct EditFileTool {
    workspace: Workspace,
}

impl EditFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    fn failed(&self, reason: String) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason,
        }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing old_text with new_text. old_text must match exactly once in the file."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to edit",
                    "minLength": 1
                },
                "old_text": {
                    "type": "string",
                    "description": "The exact text to find and replace",
                    "minLength": 1
                },
                "new_text": {
                    "type": "string",
                    "description": "The text to replace it with"
                }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let path = required_str(&arguments, "path")?;
        let old_text = required_str(&arguments, "old_text")?;
        let new_text = required_str(&arguments, "new_text")?;
        let resolved = self.workspace.resolve(self.name(), path)?;

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| io_failure(self.name(), "read", path, e))?;

        match content.matches(old_text).count() {
            0 => {
                return Err(self.failed(format!("old_text not found in {path}")));
            }
            1 => {}
            n => {
                return Err(self.failed(format!(
                    "old_text appears {n} times in {path}; include more context to make it unique"
                )));
            }
        }

        let updated = content.replacen(old_text, new_text, 1);
        tokio::fs::write(&resolved, updated)
            .await
            .map_err(|e| io_failure(self.name(), "write", path, e))?;

        debug!(path = %resolved.display(), "File edited");
        Ok(format!("Successfully edited {path}"))
    }
}
