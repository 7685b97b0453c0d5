//! Message tool — send a message to a channel mid-run.
//!
//! Publishes straight onto the outbound bus, so the user sees it before the
//! run's final answer. Defaults to the chat the current run belongs to.

use async_trait::async_trait;
use nimbot_bus::MessageBus;
use nimbot_core::error::ToolError;
use nimbot_core::event::{OutboundMessage, SessionKey};
use nimbot_core::tool::{Tool, ToolContext};
use tracing::debug;

use crate::workspace::required_str;

pub struct MessageTool {
    bus: MessageBus,
}

impl MessageTool {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user. Defaults to the current conversation; set channel and chat_id to reach another chat."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The message text",
                    "minLength": 1
                },
                "channel": {
                    "type": "string",
                    "description": "Target channel (e.g. telegram, cli)"
                },
                "chat_id": {
                    "type": "string",
                    "description": "Target chat within the channel"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let content = required_str(&arguments, "content")?;
        let channel = arguments["channel"].as_str().unwrap_or(&ctx.session_key.channel);
        let chat_id = arguments["chat_id"].as_str().unwrap_or(&ctx.session_key.chat_id);
        let target = SessionKey::new(channel, chat_id);

        let mut outbound = OutboundMessage::side_channel(target.clone(), content, ctx.inbound_id.clone());
        if target == ctx.session_key {
            outbound.metadata.extend(ctx.metadata.clone());
        }

        self.bus
            .publish_outbound(outbound)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: e.to_string(),
            })?;
        debug!(target = %target, "Message tool published outbound message");
        Ok(format!("Message sent to {target}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_to_current_session() {
        let bus = MessageBus::new(8);
        let mut out = bus.subscribe_outbound(|_| true).unwrap();
        let tool = MessageTool::new(bus.clone());

        let mut ctx = ToolContext::new(SessionKey::new("telegram", "42"), "in-7");
        ctx.metadata.insert("message_id".into(), serde_json::json!(99));

        let output = tool
            .execute(serde_json::json!({"content": "working on it"}), &ctx)
            .await
            .unwrap();
        assert_eq!(output, "Message sent to telegram:42");

        let msg = out.recv().await.unwrap();
        assert_eq!(msg.session_key, ctx.session_key);
        assert_eq!(msg.content, "working on it");
        assert_eq!(msg.in_reply_to, "in-7");
        assert_eq!(msg.metadata["message_id"], 99);
        assert!(msg.is_side_channel());
    }

    #[tokio::test]
    async fn explicit_target_drops_source_metadata() {
        let bus = MessageBus::new(8);
        let mut out = bus.subscribe_outbound(|_| true).unwrap();
        let tool = MessageTool::new(bus.clone());

        let mut ctx = ToolContext::new(SessionKey::new("telegram", "42"), "in-7");
        ctx.metadata.insert("message_id".into(), serde_json::json!(99));

        tool.execute(
            serde_json::json!({"content": "ping", "channel": "cli", "chat_id": "direct"}),
            &ctx,
        )
        .await
        .unwrap();

        let msg = out.recv().await.unwrap();
        assert_eq!(msg.channel(), "cli");
        assert!(!msg.metadata.contains_key("message_id"));
        assert!(msg.is_side_channel());
    }

    #[tokio::test]
    async fn closed_bus_is_an_execution_error() {
        let bus = MessageBus::new(8);
        bus.close();
        let tool = MessageTool::new(bus);
        let ctx = ToolContext::new(SessionKey::new("cli", "direct"), "in-1");
        let err = tool
            .execute(serde_json::json!({"content": "hi"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }
}
