//! # Nimbot Core
//!
//! Domain types, traits, and error definitions for the Nimbot agent runtime.
//! This crate defines the vocabulary every other crate speaks: bus messages,
//! conversation turns, the provider/channel/session/context capabilities,
//! and the tool registry with its call contract.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the orchestration engine is a trait here.
//! Implementations live in their respective crates, so the agent loop can be
//! driven end-to-end by in-memory fakes in tests.

pub mod channel;
pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod schema;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use channel::{Channel, ChannelMessage};
pub use context::{ContextBuilder, PromptSegment, SegmentKind, StaticContext};
pub use error::{BusError, ChannelError, Error, ProviderError, Result, SessionError, ToolError};
pub use event::{Attachment, AttachmentKind, InboundMessage, OutboundMessage, SessionKey, SourceKind, TaskHandle};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{ChatRequest, ChatResponse, Provider, ToolDefinition, Usage};
pub use session::SessionStore;
pub use tool::{Tool, ToolCall, ToolContext, ToolErrorKind, ToolRegistry, ToolResult};
