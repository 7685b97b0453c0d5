//! Security policies for Nimbot.
//!
//! Provides:
//! - **Allowlists**: Sender validation per channel, private address detection
//! - **Path validation**: Filesystem scoping to the workspace directory
//! - **Command guard**: Deny patterns for the `exec` tool

pub mod allowlist;
pub mod command;
pub mod path;

pub use allowlist::{is_private_url, AllowlistPolicy, SenderCheckResult};
pub use command::{CommandGuard, CommandGuardError, DEFAULT_DENY_PATTERNS};
pub use path::{resolve_path, PathValidationError};
