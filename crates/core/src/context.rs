//! ContextBuilder trait — turns a session into system prompt segments.
//!
//! The builder is pure with respect to the core: it reads whatever it needs
//! (workspace files, clock, skills) but never touches history or the bus.

use serde::{Deserialize, Serialize};

use crate::event::SessionKey;
use crate::message::Message;

/// What a prompt segment carries. Segments are emitted in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Core identity and behavioural rules
    Identity,
    /// Bootstrap documents from the workspace (AGENTS.md, SOUL.md, ...)
    Bootstrap,
    /// Long-term memory notes
    Memory,
    /// Summaries of available skills
    Skills,
    /// Time, workspace, current channel
    Runtime,
}

/// One block of system prompt text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSegment {
    pub kind: SegmentKind,
    pub content: String,
}

impl PromptSegment {
    pub fn new(kind: SegmentKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    /// Render this segment as a system message for the provider.
    pub fn to_message(&self) -> Message {
        Message::system(self.content.clone())
    }
}

pub trait ContextBuilder: Send + Sync {
    /// Ordered prompt segments for `key`, given the history about to be sent.
    fn build_prompt(&self, key: &SessionKey, history: &[Message]) -> Vec<PromptSegment>;
}

/// A builder that always returns the same single identity segment.
///
/// Useful when no workspace is configured, and in tests.
#[derive(Debug, Clone)]
pub struct StaticContext {
    prompt: String,
}

impl StaticContext {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl ContextBuilder for StaticContext {
    fn build_prompt(&self, _key: &SessionKey, _history: &[Message]) -> Vec<PromptSegment> {
        vec![PromptSegment::new(SegmentKind::Identity, self.prompt.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn static_context_yields_one_identity_segment() {
        let builder = StaticContext::new("You are helpful.");
        let segments = builder.build_prompt(&SessionKey::new("cli", "direct"), &[]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind, SegmentKind::Identity);

        let msg = segments[0].to_message();
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.content, "You are helpful.");
    }
}
