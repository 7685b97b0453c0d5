//! Bus events — the messages that flow into and out of the orchestration core.
//!
//! Channels, cron, and the sub-agent spawner publish [`InboundMessage`]s.
//! The agent loop (and the `message` tool) publish [`OutboundMessage`]s.
//! Both are immutable once published.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Synthetic channel name used for sub-agent sessions.
pub const SUBAGENT_CHANNEL: &str = "subagent";

/// The unit of conversational continuity: a channel plus a chat within it.
///
/// Rendered as `channel:chat_id`. Sub-agents get a synthetic key on the
/// [`SUBAGENT_CHANNEL`] channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub channel: String,
    pub chat_id: String,
}

impl SessionKey {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Synthetic key for a spawned sub-agent task.
    pub fn subagent(handle: &TaskHandle) -> Self {
        Self::new(SUBAGENT_CHANNEL, handle.0.clone())
    }

    /// Whether this key belongs to a spawned sub-agent rather than a channel.
    pub fn is_subagent(&self) -> bool {
        self.channel == SUBAGENT_CHANNEL
    }

    /// Parse a `channel:chat_id` string. The chat id may itself contain colons.
    pub fn parse(s: &str) -> Option<Self> {
        let (channel, chat_id) = s.split_once(':')?;
        if channel.is_empty() || chat_id.is_empty() {
            return None;
        }
        Some(Self::new(channel, chat_id))
    }

    /// A filesystem-safe rendering, used by file-backed session stores.
    pub fn file_stem(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect()
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.chat_id)
    }
}

/// Identifies one spawned sub-agent task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskHandle(pub String);

impl TaskHandle {
    pub fn new() -> Self {
        // Short handles read better in transcripts than full UUIDs.
        let id = Uuid::new_v4().simple().to_string();
        Self(id[..8].to_string())
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produced an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A human on a channel
    User,
    /// A scheduled trigger
    Cron,
    /// A sub-agent: either the task given to a spawned session, or a late
    /// result announced back to the parent session
    Subagent,
}

/// An attachment carried by an inbound message (photo, document, voice...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Type of attachment
    pub kind: AttachmentKind,

    /// URL or local file path
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Document,
    Audio,
    Video,
    Voice,
    Other,
}

/// A message entering the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,

    pub session_key: SessionKey,

    /// Platform-specific sender identifier
    pub sender_id: String,

    pub text: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    pub source: SourceKind,

    /// Set for sub-agent traffic: the task this message belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_handle: Option<TaskHandle>,

    pub received_at: DateTime<Utc>,

    /// Channel-specific metadata (message_id, chat_type, ...)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl InboundMessage {
    /// A user message arriving on a channel.
    pub fn user(
        session_key: SessionKey,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::with_source(session_key, sender_id, text, SourceKind::User)
    }

    /// A scheduled trigger.
    pub fn cron(session_key: SessionKey, job_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_source(session_key, job_id, text, SourceKind::Cron)
    }

    /// Sub-agent traffic for `handle`.
    pub fn subagent(session_key: SessionKey, handle: TaskHandle, text: impl Into<String>) -> Self {
        let mut msg = Self::with_source(session_key, "subagent", text, SourceKind::Subagent);
        msg.task_handle = Some(handle);
        msg
    }

    fn with_source(
        session_key: SessionKey,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        source: SourceKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_key,
            sender_id: sender_id.into(),
            text: text.into(),
            attachments: Vec::new(),
            source,
            task_handle: None,
            received_at: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Metadata flag on outbound messages sent mid-run rather than as the
/// run's final answer.
pub const SIDE_CHANNEL_KEY: &str = "side_channel";

/// A message leaving the core, addressed to the channel in `session_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: String,

    pub session_key: SessionKey,

    pub content: String,

    /// The inbound message this answers
    pub in_reply_to: String,

    /// Channel-specific metadata, copied from the inbound message
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(
        session_key: SessionKey,
        content: impl Into<String>,
        in_reply_to: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_key,
            content: content.into(),
            in_reply_to: in_reply_to.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Reply to `inbound` on its own session, carrying its channel metadata.
    pub fn reply_to(inbound: &InboundMessage, content: impl Into<String>) -> Self {
        let mut msg = Self::new(inbound.session_key.clone(), content, inbound.id.clone());
        msg.metadata = inbound.metadata.clone();
        msg
    }

    /// A mid-run message (progress note, message to another chat) sent on
    /// behalf of the run answering `in_reply_to`.
    pub fn side_channel(
        session_key: SessionKey,
        content: impl Into<String>,
        in_reply_to: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(session_key, content, in_reply_to);
        msg.metadata.insert(SIDE_CHANNEL_KEY.into(), serde_json::Value::Bool(true));
        msg
    }

    /// Whether this is a mid-run message rather than a run's answer.
    pub fn is_side_channel(&self) -> bool {
        self.metadata.get(SIDE_CHANNEL_KEY).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// The channel this message must be delivered to.
    pub fn channel(&self) -> &str {
        &self.session_key.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_display_and_parse() {
        let key = SessionKey::new("telegram", "12345");
        assert_eq!(key.to_string(), "telegram:12345");
        assert_eq!(SessionKey::parse("telegram:12345"), Some(key));
        assert_eq!(
            SessionKey::parse("feishu:oc_1:thread"),
            Some(SessionKey::new("feishu", "oc_1:thread"))
        );
        assert!(SessionKey::parse("no-separator").is_none());
        assert!(SessionKey::parse(":empty").is_none());
    }

    #[test]
    fn subagent_keys_are_recognised() {
        let handle = TaskHandle("abc12345".into());
        let key = SessionKey::subagent(&handle);
        assert!(key.is_subagent());
        assert_eq!(key.to_string(), "subagent:abc12345");
        assert!(!SessionKey::new("cli", "direct").is_subagent());
    }

    #[test]
    fn file_stem_is_filesystem_safe() {
        let key = SessionKey::new("telegram", "-100/42");
        assert_eq!(key.file_stem(), "telegram_-100_42");
    }

    #[test]
    fn reply_copies_session_and_metadata() {
        let inbound = InboundMessage::user(SessionKey::new("cli", "direct"), "me", "hi")
            .with_metadata("message_id", serde_json::json!("m1"));
        let reply = OutboundMessage::reply_to(&inbound, "hello");
        assert_eq!(reply.session_key, inbound.session_key);
        assert_eq!(reply.in_reply_to, inbound.id);
        assert_eq!(reply.metadata["message_id"], "m1");
        assert_eq!(reply.channel(), "cli");
        assert!(!reply.is_side_channel());
    }

    #[test]
    fn side_channel_messages_are_flagged() {
        let note = OutboundMessage::side_channel(SessionKey::new("cli", "direct"), "working...", "in-1");
        assert!(note.is_side_channel());
        assert_eq!(note.in_reply_to, "in-1");
    }

    #[test]
    fn subagent_message_carries_handle() {
        let handle = TaskHandle::new();
        let msg = InboundMessage::subagent(SessionKey::subagent(&handle), handle.clone(), "do it");
        assert_eq!(msg.source, SourceKind::Subagent);
        assert_eq!(msg.task_handle, Some(handle));
    }
}
