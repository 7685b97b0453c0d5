//! The directory file tools and `exec` operate in.

use std::path::{Path, PathBuf};

use nimbot_core::error::ToolError;

/// Workspace root plus the scoping policy applied to tool paths.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    restrict: bool,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, restrict: bool) -> Self {
        Self {
            root: root.into(),
            restrict,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_restricted(&self) -> bool {
        self.restrict
    }

    /// Resolve a model-supplied path on behalf of `tool`.
    pub fn resolve(&self, tool: &str, path: &str) -> Result<PathBuf, ToolError> {
        nimbot_security::resolve_path(path, &self.root, self.restrict).map_err(|e| {
            ToolError::PermissionDenied {
                tool_name: tool.into(),
                reason: e.to_string(),
            }
        })
    }
}

pub(crate) fn required_str<'a>(arguments: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    arguments[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

pub(crate) fn io_failure(tool: &str, action: &str, path: &str, err: std::io::Error) -> ToolError {
    let reason = match err.kind() {
        std::io::ErrorKind::NotFound => format!("{path} not found"),
        _ => format!("Failed to {action} {path}: {err}"),
    };
    ToolError::ExecutionFailed {
        tool_name: tool.into(),
        reason,
    }
}
