//! Command guard for the `exec` tool.
//!
//! Rejects commands matching a built-in list of destructive patterns plus
//! any extra patterns from configuration.

use regex_lite::Regex;

/// Patterns rejected by default.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-[a-z]*[rf][a-z]*\s+(/|~|\*)(\s|$)",
    r"\bdel\s+/[fq]\b",
    r"\brmdir\s+/s\b",
    r"\bmkfs(\.\w+)?\b",
    r"\bformat\s+[a-z]:",
    r"\bdd\s+if=",
    r">\s*/dev/sd[a-z]",
    r"\b(shutdown|reboot|poweroff|halt)\b",
    r":\(\)\s*\{\s*:\|:&\s*\};:",
];

#[derive(Debug, thiserror::Error)]
pub enum CommandGuardError {
    #[error("Invalid deny pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Compiled deny list.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    deny: Vec<Regex>,
}

impl CommandGuard {
    /// Built-in patterns plus `extra`.
    pub fn new(extra: &[String]) -> Result<Self, CommandGuardError> {
        let mut deny = Vec::with_capacity(DEFAULT_DENY_PATTERNS.len() + extra.len());
        let all = DEFAULT_DENY_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().cloned());
        for pattern in all {
            let re = Regex::new(&pattern).map_err(|e| CommandGuardError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            deny.push(re);
        }
        Ok(Self { deny })
    }

    /// The pattern `command` matches, if any. Matching is case-insensitive.
    pub fn check(&self, command: &str) -> Option<&str> {
        let lowered = command.to_lowercase();
        self.deny
            .iter()
            .find(|re| re.is_match(&lowered))
            .map(|re| re.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_destructive_commands() {
        let guard = CommandGuard::new(&[]).unwrap();
        for cmd in [
            "rm -rf /",
            "rm -fr ~",
            "sudo mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "shutdown -h now",
            "FORMAT C:",
            ":(){ :|:& };:",
        ] {
            assert!(guard.check(cmd).is_some(), "should block: {cmd}");
        }
    }

    #[test]
    fn allows_ordinary_commands() {
        let guard = CommandGuard::new(&[]).unwrap();
        for cmd in ["ls -la", "rm -rf build/", "git status", "echo formatted", "cargo fmt"] {
            assert!(guard.check(cmd).is_none(), "should allow: {cmd}");
        }
    }

    #[test]
    fn extra_patterns_apply() {
        let guard = CommandGuard::new(&[r"\bcurl\b".into()]).unwrap();
        assert_eq!(guard.check("curl http://x"), Some(r"\bcurl\b"));
    }

    #[test]
    fn invalid_pattern_reported() {
        assert!(CommandGuard::new(&["(unclosed".into()]).is_err());
    }
}
