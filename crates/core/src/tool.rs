//! Tool trait and registry — the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world:
//! execute shell commands, read/write files, search the web, etc.
//!
//! [`ToolRegistry::execute`] is the only way the agent loop runs a tool. It
//! never fails: lookup, validation, timeouts, handler errors and handler
//! panics all come back as a [`ToolResult`] with an [`ToolErrorKind`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ToolError;
use crate::event::{SessionKey, SourceKind, TaskHandle};
use crate::provider::ToolDefinition;
use crate::schema;

/// Timeout applied to tools that don't declare their own.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// A request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Why a tool call did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Validation,
    NotFound,
    Execution,
    Timeout,
    PermissionDenied,
    Cancelled,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::PermissionDenied => "permission_denied",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl From<&ToolError> for ToolErrorKind {
    fn from(err: &ToolError) -> Self {
        match err {
            ToolError::NotFound(_) => Self::NotFound,
            ToolError::ExecutionFailed { .. } => Self::Execution,
            ToolError::Timeout { .. } => Self::Timeout,
            ToolError::PermissionDenied { .. } => Self::PermissionDenied,
            ToolError::InvalidArguments(_) => Self::Validation,
        }
    }
}

/// The result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content (or the error text the model will see)
    pub output: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorKind>,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output: output.into(),
            error: None,
            data: None,
        }
    }

    pub fn failure(call_id: impl Into<String>, kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: format!("Error: {}", message.into()),
            error: Some(kind),
            data: None,
        }
    }

    /// The result recorded for a call that was still running when its run was cancelled.
    pub fn cancelled(call_id: impl Into<String>) -> Self {
        Self::failure(call_id, ToolErrorKind::Cancelled, "cancelled before completion")
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Who a tool is acting for.
///
/// Passed to every handler so side-channel tools (`message`, `spawn`) know
/// which session and inbound message they belong to.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_key: SessionKey,

    /// The inbound message whose run issued the call
    pub inbound_id: String,

    pub source: SourceKind,

    /// Set when the calling run belongs to a spawned sub-agent
    pub task_handle: Option<TaskHandle>,

    /// Channel metadata of the inbound message
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ToolContext {
    pub fn new(session_key: SessionKey, inbound_id: impl Into<String>) -> Self {
        Self {
            session_key,
            inbound_id: inbound_id.into(),
            source: SourceKind::User,
            task_handle: None,
            metadata: serde_json::Map::new(),
        }
    }
}

/// The core Tool trait.
///
/// Each tool (exec, read_file, write_file, web_fetch, spawn, etc.)
/// implements this trait. Tools are registered in the ToolRegistry and made
/// available to the agent loop.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "exec", "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Per-tool timeout. `None` uses the registry default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Execute the tool with already-validated arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool definitions to send to the LLM
/// 2. Execute tools when the LLM requests them
#[derive(Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    default_timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "Replaced existing tool registration");
        }
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> std::result::Result<Arc<dyn Tool>, ToolError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// All tool definitions, sorted by name (for sending to the LLM).
    pub fn list_schemas(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// A copy of this registry without the named tools.
    pub fn without(&self, excluded: &[&str]) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|(name, _)| !excluded.contains(&name.as_str()))
                .map(|(name, tool)| (name.clone(), Arc::clone(tool)))
                .collect(),
            default_timeout: self.default_timeout,
        }
    }

    /// Execute a tool call.
    ///
    /// The handler runs in its own task so a panic is contained, and is
    /// aborted when its timeout expires.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let tool = match self.get(&call.name) {
            Ok(tool) => tool,
            Err(e) => {
                tracing::warn!(tool = %call.name, "Model requested unknown tool");
                return ToolResult::failure(&call.id, ToolErrorKind::NotFound, e.to_string());
            }
        };

        let violations = schema::validate(&call.arguments, &tool.parameters_schema());
        if !violations.is_empty() {
            tracing::debug!(tool = %call.name, ?violations, "Tool arguments rejected");
            return ToolResult::failure(
                &call.id,
                ToolErrorKind::Validation,
                format!("invalid arguments for '{}': {}", call.name, violations.join("; ")),
            );
        }

        let timeout = tool.timeout().unwrap_or(self.default_timeout);
        let arguments = call.arguments.clone();
        let task_ctx = ctx.clone();
        let started = std::time::Instant::now();
        let mut handle = AbortOnDrop(tokio::spawn(async move { tool.execute(arguments, &task_ctx).await }));

        let result = match tokio::time::timeout(timeout, &mut handle.0).await {
            Ok(Ok(Ok(output))) => ToolResult::ok(&call.id, output),
            Ok(Ok(Err(e))) => ToolResult::failure(&call.id, ToolErrorKind::from(&e), e.to_string()),
            Ok(Err(join_err)) => {
                let reason = if join_err.is_panic() {
                    "tool panicked"
                } else {
                    "tool task was aborted"
                };
                tracing::error!(tool = %call.name, error = %join_err, "Tool handler crashed");
                ToolResult::failure(
                    &call.id,
                    ToolErrorKind::Execution,
                    format!("{}: {reason}", call.name),
                )
            }
            Err(_) => {
                handle.0.abort();
                ToolResult::failure(
                    &call.id,
                    ToolErrorKind::Timeout,
                    ToolError::Timeout {
                        tool_name: call.name.clone(),
                        timeout_secs: timeout.as_secs(),
                    }
                    .to_string(),
                )
            }
        };

        tracing::debug!(
            tool = %call.name,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tool call finished"
        );
        result
    }
}

/// Aborts the handler task when the caller stops waiting for it.
struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
