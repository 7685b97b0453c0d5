//! Built-in tool implementations for Nimbot.
//!
//! Tools give the agent the ability to interact with the world:
//! read, write and edit files in its workspace, run shell commands,
//! search and fetch from the web, and message the user mid-run.
//!
//! The `spawn` tool lives in `nimbot-agent`, next to the sub-agent manager
//! it drives.

pub mod file_edit;
pub mod file_read;
pub mod file_write;
pub mod list_dir;
pub mod message;
pub mod shell;
pub mod web_fetch;
pub mod web_search;
pub mod workspace;

use std::sync::Arc;
use std::time::Duration;

use nimbot_bus::MessageBus;
use nimbot_config::AppConfig;
use nimbot_core::tool::ToolRegistry;
use nimbot_security::{CommandGuard, CommandGuardError};

pub use file_edit::EditFileTool;
pub use file_read::ReadFileTool;
pub use file_write::WriteFileTool;
pub use list_dir::ListDirTool;
pub use message::MessageTool;
pub use shell::ExecTool;
pub use web_fetch::{html_to_text, WebFetchTool};
pub use web_search::WebSearchTool;
pub use workspace::Workspace;

/// Create a registry with every built-in tool, configured from `config`.
///
/// Fails only when a configured exec deny pattern is not a valid regex.
pub fn default_registry(config: &AppConfig, bus: MessageBus) -> Result<ToolRegistry, CommandGuardError> {
    let workspace = Workspace::new(config.agent.workspace_path(), config.tools.restrict_to_workspace);
    let guard = CommandGuard::new(&config.tools.exec.deny_patterns)?;

    let mut registry =
        ToolRegistry::new().with_default_timeout(Duration::from_secs(config.agent.tool_timeout_secs.max(1)));
    registry.register(Arc::new(ReadFileTool::new(workspace.clone())));
    registry.register(Arc::new(WriteFileTool::new(workspace.clone())));
    registry.register(Arc::new(EditFileTool::new(workspace.clone())));
    registry.register(Arc::new(ListDirTool::new(workspace.clone())));
    registry.register(Arc::new(ExecTool::new(workspace, guard, &config.tools.exec)));
    registry.register(Arc::new(WebSearchTool::new(&config.tools.web)));
    registry.register(Arc::new(WebFetchTool::new(&config.tools.web)));
    registry.register(Arc::new(MessageTool::new(bus)));

    tracing::debug!(tools = ?registry.names(), "Built-in tools registered");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_builtin() {
        let registry = default_registry(&AppConfig::default(), MessageBus::default()).unwrap();
        assert_eq!(
            registry.names(),
            vec![
                "edit_file",
                "exec",
                "list_dir",
                "message",
                "read_file",
                "web_fetch",
                "web_search",
                "write_file",
            ]
        );
        assert_eq!(registry.list_schemas().len(), 8);
    }

    #[test]
    fn bad_deny_pattern_is_rejected() {
        let mut config = AppConfig::default();
        config.tools.exec.deny_patterns = vec!["(unclosed".into()];
        assert!(default_registry(&config, MessageBus::default()).is_err());
    }
}
