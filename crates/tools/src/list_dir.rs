//! Directory listing tool.

use async_trait::async_trait;
use nimbot_core::error::ToolError;
use nimbot_core::tool::{Tool, ToolContext};

use crate::workspace::{io_failure, Workspace};

pub struct ListDirTool {
    workspace: Workspace,
}

impl ListDirTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Defaults to the workspace root."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The directory to list (default: workspace root)"
                }
            }
        })
    }

    async fn execute(&self, arguments: serde_json::Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let path = arguments["path"].as_str().filter(|p| !p.trim().is_empty()).unwrap_or(".");
        let resolved = self.workspace.resolve(self.name(), path)?;

        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| io_failure(self.name(), "list", path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| io_failure(self.name(), "list", path, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push((name, is_dir));
        }

        if entries.is_empty() {
            return Ok(format!("Directory {path} is empty"));
        }
        entries.sort();
        Ok(entries
            .into_iter()
            .map(|(name, is_dir)| if is_dir { format!("[dir]  {name}/") } else { format!("[file] {name}") })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
