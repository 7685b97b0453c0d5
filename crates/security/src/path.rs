//! Path validation — filesystem scoping to the workspace directory.
//!
//! File tools resolve every path through [`resolve_path`]. Relative paths
//! are taken relative to the workspace. When scoping is on, `..`
//! components and anything that resolves (symlinks included) outside the
//! workspace are rejected.

use std::path::{Component, Path, PathBuf};

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside the workspace {workspace}")]
    OutsideWorkspace { path: String, workspace: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },

    #[error("Failed to canonicalize path '{path}': {reason}")]
    CanonicalizeFailed { path: String, reason: String },
}

/// Resolve `path` for a file tool.
///
/// Returns the absolute path to operate on. With `restrict` off, the only
/// transformation is `~` expansion and joining relative paths onto
/// `workspace`.
pub fn resolve_path(
    path: &str,
    workspace: &Path,
    restrict: bool,
) -> Result<PathBuf, PathValidationError> {
    let expanded = nimbot_config::expand_home(path.trim());
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        workspace.join(expanded)
    };

    if !restrict {
        return Ok(joined);
    }

    if joined.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(PathValidationError::PathTraversal { path: path.into() });
    }

    let root = canonicalize_lenient(workspace, path)?;
    let resolved = canonicalize_lenient(&joined, path)?;

    if !resolved.starts_with(&root) {
        tracing::warn!(path = %path, workspace = %root.display(), "Blocked access outside workspace");
        return Err(PathValidationError::OutsideWorkspace {
            path: path.into(),
            workspace: root.display().to_string(),
        });
    }

    Ok(resolved)
}

/// Canonicalize the longest existing prefix of `target` and re-append the
/// rest, so paths for files that don't exist yet (writes) still resolve
/// symlinks in their existing ancestors.
fn canonicalize_lenient(target: &Path, original: &str) -> Result<PathBuf, PathValidationError> {
    let mut existing = target.to_path_buf();
    let mut missing: Vec<std::ffi::OsString> = Vec::new();

    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            // Nothing on this path exists; compare it as written.
            _ => return Ok(target.to_path_buf()),
        }
    }

    let mut resolved = existing
        .canonicalize()
        .map_err(|e| PathValidationError::CanonicalizeFailed {
            path: original.into(),
            reason: e.to_string(),
        })?;
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_lands_in_workspace() {
        let ws = tempfile::tempdir().unwrap();
        let resolved = resolve_path("notes/today.md", ws.path(), true).unwrap();
        let root = ws.path().canonicalize().unwrap();
        assert_eq!(resolved, root.join("notes").join("today.md"));
    }

    #[test]
    fn path_traversal_blocked() {
        let ws = tempfile::tempdir().unwrap();
        let err = resolve_path("../../../etc/passwd", ws.path(), true).unwrap_err();
        assert!(matches!(err, PathValidationError::PathTraversal { .. }));

        let mid = format!("{}/sub/../../escape", ws.path().display());
        assert!(resolve_path(&mid, ws.path(), true).is_err());
    }

    #[test]
    fn absolute_path_outside_workspace_blocked() {
        let ws = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let target = other.path().join("secret.txt");
        let err = resolve_path(target.to_str().unwrap(), ws.path(), true).unwrap_err();
        assert!(matches!(err, PathValidationError::OutsideWorkspace { .. }));
    }

    #[test]
    fn absolute_path_inside_workspace_allowed() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("a.txt"), "x").unwrap();
        let target = ws.path().join("a.txt");
        assert!(resolve_path(target.to_str().unwrap(), ws.path(), true).is_ok());
    }

    #[test]
    fn unrestricted_allows_anything() {
        let ws = tempfile::tempdir().unwrap();
        let resolved = resolve_path("/tmp/elsewhere.txt", ws.path(), false).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/elsewhere.txt"));
        assert!(resolve_path("../up.txt", ws.path(), false).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_blocked() {
        let ws = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), ws.path().join("link")).unwrap();
        let err = resolve_path("link/new.txt", ws.path(), true).unwrap_err();
        assert!(matches!(err, PathValidationError::OutsideWorkspace { .. }));
    }
}
