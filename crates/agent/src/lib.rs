//! The agent core of Nimbot.
//!
//! Each inbound message becomes one **run** of the agent loop:
//!
//! 1. **Record** the message in its session history
//! 2. **Build context** (system prompt segments + windowed history)
//! 3. **Call the model** via the configured provider
//! 4. **If tool calls**: execute them concurrently, record results, go to 3
//! 5. **If text**: publish the reply on the outbound bus
//!
//! The [`SessionRouter`] feeds runs from the inbound bus, one at a time per
//! session. The `spawn` tool hands work to background sub-agent runs whose
//! results come back to the parent session through the [`SubagentManager`].

pub mod context;
pub mod locks;
pub mod loop_runner;
pub mod router;
pub mod subagent;

pub use context::{WorkspaceContextBuilder, close_dangling_calls, system_message, window_history};
pub use locks::{SessionGuard, SessionLocks};
pub use loop_runner::{AgentLoop, AgentSettings, RunAbort, RunReport, RunState, SUBAGENT_EXCLUDED_TOOLS};
pub use router::SessionRouter;
pub use subagent::{
    Mailbox, SpawnTool, SubagentManager, SubagentReport, SubagentTask, TaskOutcome, TaskStatus,
};
