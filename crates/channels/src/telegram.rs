//! Telegram channel adapter using Bot API long polling.
//!
//! Incoming updates become [`ChannelMessage`]s with the sender id rendered
//! as `user_id|username` and `message_id`/`chat_type` in metadata, so
//! replies in groups can quote the message that triggered them.

use std::time::Duration;

use async_trait::async_trait;
use nimbot_config::ChannelConfig;
use nimbot_core::channel::{Channel, ChannelMessage};
use nimbot_core::error::ChannelError;
use nimbot_core::event::{Attachment, AttachmentKind, OutboundMessage};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Telegram's hard limit on message text length.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Telegram channel adapter.
pub struct TelegramChannel {
    token: String,
    api_base: String,
    client: reqwest::Client,
    poller: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramChannel")
            .field("token", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl TelegramChannel {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: DEFAULT_API_BASE.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
                .build()
                .unwrap_or_default(),
            poller: Mutex::new(None),
        }
    }

    /// Build from the `token` (and optional `api_base`) channel settings.
    pub fn from_config(config: &ChannelConfig) -> Result<Self, ChannelError> {
        let token = config
            .setting("token")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChannelError::NotConfigured("telegram: missing token".into()))?;
        let channel = Self::new(token);
        Ok(match config.setting("api_base") {
            Some(base) => channel.with_api_base(base),
            None => channel,
        })
    }

    /// Point at a different Bot API server.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    async fn call(&self, method: &str, body: &Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionLost(format!("telegram {method}: {e}")))?;
        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidPayload(format!("telegram {method}: {e}")))?;

        if !status.is_success() || payload["ok"] != Value::Bool(true) {
            let description = payload["description"].as_str().unwrap_or("unknown error");
            return Err(ChannelError::DeliveryFailed {
                channel: "telegram".into(),
                reason: format!("{method} returned {status}: {description}"),
            });
        }
        Ok(payload["result"].clone())
    }

    async fn poll_loop(
        self: std::sync::Arc<Self>,
        tx: mpsc::Sender<Result<ChannelMessage, ChannelError>>,
        cancel: CancellationToken,
    ) {
        let mut offset: i64 = 0;
        loop {
            let body = json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"],
            });
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.call("getUpdates", &body) => result,
            };

            let updates = match updates {
                Ok(Value::Array(updates)) => updates,
                Ok(other) => {
                    warn!(payload = %other, "Unexpected getUpdates result");
                    Vec::new()
                }
                Err(e) => {
                    warn!(error = %e, "Telegram poll failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    }
                }
            };

            for update in &updates {
                if let Some(id) = update["update_id"].as_i64() {
                    offset = offset.max(id + 1);
                }
                let Some(msg) = parse_update(update) else {
                    continue;
                };
                if tx.send(Ok(msg)).await.is_err() {
                    debug!("Telegram receiver dropped, stopping poller");
                    return;
                }
            }
        }
        debug!("Telegram poller stopped");
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(
        &self,
    ) -> Result<mpsc::Receiver<Result<ChannelMessage, ChannelError>>, ChannelError> {
        let me = self.call("getMe", &json!({})).await?;
        info!(bot = %me["username"].as_str().unwrap_or("?"), "Telegram channel connected");

        let cancel = CancellationToken::new();
        if let Some(previous) = self.poller.lock().await.replace(cancel.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(64);
        let poller = std::sync::Arc::new(Self {
            token: self.token.clone(),
            api_base: self.api_base.clone(),
            client: self.client.clone(),
            poller: Mutex::new(None),
        });
        tokio::spawn(poller.poll_loop(tx, cancel));
        Ok(rx)
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        let chat_id = &message.session_key.chat_id;
        let reply_to = message.metadata.get("message_id").and_then(Value::as_i64);

        for (i, chunk) in split_message(&message.content, MAX_MESSAGE_CHARS).into_iter().enumerate() {
            let mut body = json!({ "chat_id": chat_id, "text": chunk });
            if let (0, Some(id)) = (i, reply_to) {
                body["reply_parameters"] = json!({ "message_id": id, "allow_sending_without_reply": true });
            }
            self.call("sendMessage", &body).await?;
        }
        debug!(chat_id = %chat_id, chars = message.content.len(), "Telegram message sent");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        if let Some(cancel) = self.poller.lock().await.take() {
            info!("Telegram channel stopping");
            cancel.cancel();
        }
        Ok(())
    }
}

/// Convert one `getUpdates` entry into a channel message.
///
/// Updates without a message or sender, and messages with neither text nor
/// media, yield `None`.
pub fn parse_update(update: &Value) -> Option<ChannelMessage> {
    let message = update.get("message")?;
    let from = message.get("from")?;
    let user_id = from["id"].as_i64()?;
    let chat_id = message["chat"]["id"].as_i64()?;

    let sender_id = match from["username"].as_str() {
        Some(username) => format!("{user_id}|{username}"),
        None => user_id.to_string(),
    };

    let mut attachments = Vec::new();
    let mut placeholders = Vec::new();
    // Photos arrive in ascending sizes; keep the largest.
    if let Some(photo) = message["photo"].as_array().and_then(|sizes| sizes.last()) {
        push_file(&mut attachments, &mut placeholders, photo, AttachmentKind::Image, "[image]");
    }
    for (field, kind, placeholder) in [
        ("document", AttachmentKind::Document, "[file]"),
        ("voice", AttachmentKind::Voice, "[voice]"),
        ("audio", AttachmentKind::Audio, "[audio]"),
        ("video", AttachmentKind::Video, "[video]"),
    ] {
        if let Some(file) = message.get(field) {
            push_file(&mut attachments, &mut placeholders, file, kind, placeholder);
        }
    }

    let text = message["text"]
        .as_str()
        .or_else(|| message["caption"].as_str())
        .unwrap_or_default();
    let content = std::iter::once(text)
        .chain(placeholders)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if content.is_empty() {
        return None;
    }

    let chat_type = message["chat"]["type"].as_str().unwrap_or("private");
    let mut msg = ChannelMessage::new(sender_id, chat_id.to_string(), content);
    msg.sender_name = from["first_name"].as_str().map(String::from);
    msg.attachments = attachments;
    msg.metadata.insert("message_id".into(), message["message_id"].clone());
    msg.metadata.insert("user_id".into(), json!(user_id));
    msg.metadata.insert("chat_type".into(), json!(chat_type));
    msg.metadata.insert("is_group".into(), json!(chat_type != "private"));
    if let Some(username) = from["username"].as_str() {
        msg.metadata.insert("username".into(), json!(username));
    }
    Some(msg)
}

fn push_file(
    attachments: &mut Vec<Attachment>,
    placeholders: &mut Vec<&'static str>,
    file: &Value,
    kind: AttachmentKind,
    placeholder: &'static str,
) {
    let Some(file_id) = file["file_id"].as_str() else {
        return;
    };
    attachments.push(Attachment {
        kind,
        // Bot API file_id; resolve with getFile to download
        url: file_id.to_string(),
        filename: file["file_name"].as_str().map(String::from),
        mime_type: file["mime_type"].as_str().map(String::from),
    });
    placeholders.push(placeholder);
}

/// Split `text` into chunks of at most `limit` chars, preferring line breaks.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > limit {
        let cut = rest
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let at = rest[..cut].rfind('\n').filter(|&i| i > 0).unwrap_or(cut);
        chunks.push(rest[..at].to_string());
        rest = rest[at..].trim_start_matches('\n');
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbot_core::event::SessionKey;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn parses_group_text_message() {
        let update = json!({
            "update_id": 10,
            "message": {
                "message_id": 77,
                "from": { "id": 12345, "username": "alice", "first_name": "Alice" },
                "chat": { "id": -100, "type": "supergroup" },
                "text": "hello bot"
            }
        });
        let msg = parse_update(&update).unwrap();
        assert_eq!(msg.sender_id, "12345|alice");
        assert_eq!(msg.chat_id, "-100");
        assert_eq!(msg.content, "hello bot");
        assert_eq!(msg.sender_name.as_deref(), Some("Alice"));
        assert_eq!(msg.metadata["message_id"], 77);
        assert_eq!(msg.metadata["chat_type"], "supergroup");
        assert_eq!(msg.metadata["is_group"], true);
    }

    #[test]
    fn media_becomes_attachments_with_placeholders() {
        let update = json!({
            "update_id": 11,
            "message": {
                "message_id": 5,
                "from": { "id": 1 },
                "chat": { "id": 1, "type": "private" },
                "caption": "look",
                "photo": [{ "file_id": "small" }, { "file_id": "large" }]
            }
        });
        let msg = parse_update(&update).unwrap();
        assert_eq!(msg.sender_id, "1");
        assert_eq!(msg.content, "look\n[image]");
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].url, "large");
        assert_eq!(msg.attachments[0].kind, AttachmentKind::Image);
    }

    #[test]
    fn ignores_updates_without_content() {
        assert!(parse_update(&json!({ "update_id": 1 })).is_none());
        let sticker_only = json!({
            "update_id": 2,
            "message": { "message_id": 1, "from": { "id": 1 }, "chat": { "id": 1 }, "sticker": {} }
        });
        assert!(parse_update(&sticker_only).is_none());
    }

    #[test]
    fn splits_long_messages_on_lines() {
        assert_eq!(split_message("short", 10), vec!["short"]);
        assert_eq!(split_message("", 10), vec![""]);
        assert_eq!(split_message("aaaa\nbbbb\ncc", 10), vec!["aaaa\nbbbb", "cc"]);
        assert_eq!(split_message("abcdefghijkl", 5), vec!["abcde", "fghij", "kl"]);
    }

    #[test]
    fn missing_token_is_not_configured() {
        let err = TelegramChannel::from_config(&ChannelConfig::default()).unwrap_err();
        assert!(matches!(err, ChannelError::NotConfigured(_)));
    }

    /// Read one HTTP request, body included.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length || n == 0 {
                    return text;
                }
            }
            if n == 0 {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn send_replies_to_the_triggering_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let body = r#"{"ok":true,"result":{"message_id":78}}"#;
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            request
        });

        let channel = TelegramChannel::new("123:abc").with_api_base(format!("http://{addr}"));
        let mut out = OutboundMessage::new(SessionKey::new("telegram", "-100"), "hi there", "in-1");
        out.metadata.insert("message_id".into(), json!(77));
        channel.send(&out).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /bot123:abc/sendMessage"));
        assert!(request.contains(r#""message_id":77"#));
        assert!(request.contains(r#""chat_id":"-100""#));
    }
}
