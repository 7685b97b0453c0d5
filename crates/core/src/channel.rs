//! Channel trait — the abstraction over chat platforms.
//!
//! A Channel connects Nimbot to a messaging platform (Telegram, CLI, ...).
//! It yields [`ChannelMessage`]s from users and delivers
//! [`OutboundMessage`]s back. The channel manager turns the former into bus
//! events; channels never see the bus directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::event::{Attachment, InboundMessage, OutboundMessage, SessionKey};

/// A message received from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Sender identifier (platform-specific user ID)
    pub sender_id: String,

    /// Human-readable sender name (if available)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,

    /// The text content
    pub content: String,

    /// The chat/group/DM identifier within the channel
    pub chat_id: String,

    /// Attachments (images, files, voice, etc.)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    /// Platform-specific metadata (message_id, chat_type, ...)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChannelMessage {
    pub fn new(
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            sender_name: None,
            content: content.into(),
            chat_id: chat_id.into(),
            attachments: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Turn this into a bus event for `channel`.
    pub fn into_inbound(self, channel: &str) -> InboundMessage {
        let mut inbound = InboundMessage::user(
            SessionKey::new(channel, self.chat_id),
            self.sender_id,
            self.content,
        );
        inbound.attachments = self.attachments;
        inbound.metadata = self.metadata;
        if let Some(name) = self.sender_name {
            inbound
                .metadata
                .insert("sender_name".into(), serde_json::Value::String(name));
        }
        inbound
    }
}

/// The core Channel trait.
///
/// Implementations handle platform-specific connection logic, message
/// formatting and rate limiting.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name; also the channel segment of its session keys.
    fn name(&self) -> &str;

    /// Start listening for incoming messages.
    ///
    /// Returns a receiver that yields incoming messages. The channel
    /// implementation handles polling, webhooks, or stdin internally.
    async fn start(
        &self,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<ChannelMessage, ChannelError>>,
        ChannelError,
    >;

    /// Deliver a message to the chat named by its session key.
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<(), ChannelError>;

    /// Stop the channel gracefully.
    async fn stop(&self) -> std::result::Result<(), ChannelError> {
        Ok(())
    }
}
