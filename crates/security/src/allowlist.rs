//! Allowlist policies — sender validation and private-address detection.
//!
//! Enforces access control for channels (which senders may reach the
//! agent) and keeps fetch tools away from internal addresses.

use nimbot_config::ChannelConfig;

/// Result of checking a sender against the allowlist.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderCheckResult {
    /// Sender is allowed
    Allowed,
    /// Sender is denied
    Denied { sender_id: String, reason: String },
}

impl SenderCheckResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Unified allowlist policy enforcement.
pub struct AllowlistPolicy;

impl AllowlistPolicy {
    /// Check if a sender is allowed for a given channel configuration.
    ///
    /// Rules:
    /// - A disabled channel denies everyone
    /// - Empty `allow_from` or one containing `"*"` allows everyone
    /// - Otherwise the sender must be listed. Compound sender ids such as
    ///   `12345|alice` match if any `|`-separated part is listed.
    pub fn check_sender(config: &ChannelConfig, sender_id: &str) -> SenderCheckResult {
        if !config.enabled {
            return SenderCheckResult::Denied {
                sender_id: sender_id.into(),
                reason: "Channel is disabled".into(),
            };
        }

        if config.allow_from.is_empty() || config.allow_from.iter().any(|u| u == "*") {
            return SenderCheckResult::Allowed;
        }

        let listed = |id: &str| config.allow_from.iter().any(|u| u == id);
        if listed(sender_id) || sender_id.split('|').filter(|p| !p.is_empty()).any(listed) {
            SenderCheckResult::Allowed
        } else {
            SenderCheckResult::Denied {
                sender_id: sender_id.into(),
                reason: format!(
                    "Sender '{}' not in allowlist ({} senders configured)",
                    sender_id,
                    config.allow_from.len()
                ),
            }
        }
    }
}

/// Check if a URL targets a private/internal address.
pub fn is_private_url(url: &str) -> bool {
    let lower = url.to_lowercase();

    let host = lower
        .strip_prefix("http://")
        .or_else(|| lower.strip_prefix("https://"))
        .unwrap_or(&lower);
    let host = host.split('/').next().unwrap_or(host);
    let host = host.rsplit('@').next().unwrap_or(host);

    if host.starts_with('[') {
        let v6 = host.trim_start_matches('[').split(']').next().unwrap_or("");
        return v6 == "::1" || v6 == "::" || v6.starts_with("fc") || v6.starts_with("fd") || v6.starts_with("fe80");
    }
    let host = host.split(':').next().unwrap_or(host);

    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".internal") {
        return true;
    }

    let octets: Vec<u8> = host.split('.').filter_map(|p| p.parse().ok()).collect();
    if octets.len() != 4 {
        return false;
    }
    match (octets[0], octets[1]) {
        (0, _) | (10, _) | (127, _) => true,
        (169, 254) => true, // link-local, cloud metadata
        (172, b) if (16..=31).contains(&b) => true,
        (192, 168) => true,
        (100, b) if (64..=127).contains(&b) => true, // carrier-grade NAT
        _ => false,
    }
}
