//! Exec tool — run shell commands in the workspace.
//!
//! Commands matching the deny list are refused before spawning. Output is
//! captured, stderr appended under its own heading, and the whole thing cut
//! to `max_output_chars`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nimbot_config::ExecConfig;
use nimbot_core::error::ToolError;
use nimbot_core::tool::{Tool, ToolContext};
use nimbot_security::CommandGuard;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::file_read::truncate_chars;
use crate::workspace::{required_str, Workspace};

/// Slack on top of the command timeout so the tool reports its own timeout
/// before the registry aborts it.
const REGISTRY_GRACE: Duration = Duration::from_secs(5);

pub struct ExecTool {
    workspace: Workspace,
    guard: CommandGuard,
    timeout: Duration,
    max_output_chars: usize,
}

impl ExecTool {
    pub fn new(workspace: Workspace, guard: CommandGuard, config: &ExecConfig) -> Self {
        Self {
            workspace,
            guard,
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            max_output_chars: config.max_output_chars,
        }
    }

    fn denied(&self, reason: String) -> ToolError {
        ToolError::PermissionDenied {
            tool_name: self.name().into(),
            reason,
        }
    }

    fn check_command(&self, command: &str) -> Result<(), ToolError> {
        if let Some(pattern) = self.guard.check(command) {
            warn!(command = %command, pattern, "Blocked dangerous command");
            return Err(self.denied(format!("command matches deny pattern `{pattern}`")));
        }
        if self.workspace.is_restricted() && (command.contains("../") || command.contains("..\\")) {
            return Err(self.denied("path traversal is not allowed while restricted to the workspace".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. Runs in the workspace directory unless working_dir is given."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute",
                    "minLength": 1
                },
                "working_dir": {
                    "type": "string",
                    "description": "Optional working directory for the command"
                }
            },
            "required": ["command"]
        })
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout + REGISTRY_GRACE)
    }

    async fn execute(&self, arguments: serde_json::Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let command = required_str(&arguments, "command")?;
        self.check_command(command)?;

        let cwd = match arguments["working_dir"].as_str() {
            Some(dir) if !dir.trim().is_empty() => self.workspace.resolve(self.name(), dir)?,
            _ => self.workspace.root().to_path_buf(),
        };

        debug!(command = %command, cwd = %cwd.display(), "Executing shell command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: format!("failed to start command: {e}"),
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed {
                    tool_name: self.name().into(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %command, timeout_secs = self.timeout.as_secs(), "Command timed out");
                return Err(ToolError::Timeout {
                    tool_name: self.name().into(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut parts = Vec::new();
        if !stdout.trim().is_empty() {
            parts.push(stdout.trim_end().to_string());
        }
        if !stderr.trim().is_empty() {
            parts.push(format!("STDERR:\n{}", stderr.trim_end()));
        }
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            debug!(command = %command, exit_code = code, "Command exited with failure");
            parts.push(format!("Exit code: {code}"));
        }

        let text = if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        };
        Ok(truncate_chars(text, self.max_output_chars))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nimbot_core::event::SessionKey;

    fn tool(dir: &std::path::Path, restrict: bool, config: ExecConfig) -> ExecTool {
        ExecTool::new(
            Workspace::new(dir, restrict),
            CommandGuard::new(&config.deny_patterns).unwrap(),
            &config,
        )
    }

    fn ctx() -> ToolContext {
        ToolContext::new(SessionKey::new("cli", "direct"), "in-1")
    }

    async fn run(tool: &ExecTool, command: &str) -> Result<String, ToolError> {
        tool.execute(serde_json::json!({"command": command}), &ctx()).await
    }

    #[tokio::test]
    async fn runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let exec = tool(dir.path(), false, ExecConfig::default());

        let output = run(&exec, "ls").await.unwrap();
        assert!(output.contains("marker.txt"));
    }

    #[tokio::test]
    async fn reports_stderr_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let exec = tool(dir.path(), false, ExecConfig::default());

        let output = run(&exec, "echo out; echo oops >&2; exit 3").await.unwrap();
        assert_eq!(output, "out\nSTDERR:\noops\nExit code: 3");
    }

    #[tokio::test]
    async fn dangerous_commands_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecConfig {
            deny_patterns: vec![r"\bcurl\b".into()],
            ..ExecConfig::default()
        };
        let exec = tool(dir.path(), false, config);

        assert!(matches!(run(&exec, "rm -rf /").await, Err(ToolError::PermissionDenied { .. })));
        assert!(matches!(
            run(&exec, "curl http://example.com").await,
            Err(ToolError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn traversal_refused_when_restricted() {
        let dir = tempfile::tempdir().unwrap();
        let exec = tool(dir.path(), true, ExecConfig::default());
        assert!(matches!(run(&exec, "cat ../secret").await, Err(ToolError::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn enforces_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecConfig {
            timeout_secs: 1,
            ..ExecConfig::default()
        };
        let exec = tool(dir.path(), false, config);
        assert!(matches!(run(&exec, "sleep 10").await, Err(ToolError::Timeout { .. })));
    }

    #[tokio::test]
    async fn truncates_huge_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecConfig {
            max_output_chars: 100,
            ..ExecConfig::default()
        };
        let exec = tool(dir.path(), false, config);

        let output = run(&exec, "yes x | head -n 1000").await.unwrap();
        assert!(output.contains("truncated"));
        assert!(output.len() < 200);
    }
}
