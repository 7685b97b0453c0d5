//! The agent run: one inbound message driven to a reply.
//!
//! ```text
//! START → BUILD_CONTEXT → CALL_MODEL ─┬─ tool calls ─→ EXECUTE_TOOLS ─→ CALL_MODEL
//!                                     └─ text ───────→ RESPOND → DONE
//! ```
//!
//! Any step can end the run in ABORTED: the iteration ceiling, a provider
//! error, a session store failure, or cancellation. Provider and ceiling
//! aborts still answer the user with one explanatory message.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use nimbot_bus::MessageBus;
use nimbot_config::AgentConfig;
use nimbot_core::context::ContextBuilder;
use nimbot_core::error::{ProviderError, SessionError};
use nimbot_core::event::{InboundMessage, OutboundMessage, SessionKey, SourceKind, TaskHandle};
use nimbot_core::message::{Message, MessageToolCall};
use nimbot_core::provider::{ChatRequest, Provider};
use nimbot_core::session::SessionStore;
use nimbot_core::tool::{ToolCall, ToolContext, ToolRegistry, ToolResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::context::{close_dangling_calls, system_message, window_history};
use crate::locks::SessionLocks;
use crate::subagent::{Mailbox, SpawnTool, SubagentManager, SubagentTask, TaskOutcome};

/// Tools a sub-agent run may not use.
pub const SUBAGENT_EXCLUDED_TOOLS: &[&str] = &["spawn", "message"];

const EMPTY_REPLY: &str = "I've finished processing but have nothing further to add.";

/// Model and budget settings for runs.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Model calls allowed per run
    pub max_iterations: usize,
    pub subagent_max_iterations: usize,
    pub history_window: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for AgentSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: Some(config.max_tokens),
            max_iterations: config.max_iterations.max(1),
            subagent_max_iterations: config.subagent_max_iterations.max(1),
            history_window: config.history_window.max(1),
        }
    }
}

/// Steps of a run, in the order they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Start,
    BuildContext,
    CallModel,
    ExecuteTools,
    Respond,
    Done,
    Aborted,
}

/// Why a run ended in [`RunState::Aborted`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunAbort {
    #[error("iteration limit of {limit} model calls reached")]
    IterationLimitExceeded { limit: usize },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("run cancelled")]
    Cancelled,

    #[error("unknown sub-agent task {0}")]
    UnknownTask(TaskHandle),
}

impl RunAbort {
    /// What the user is told, if anything.
    fn notice(&self) -> Option<String> {
        match self {
            Self::IterationLimitExceeded { limit } => Some(format!(
                "I stopped after {limit} steps without reaching a final answer. \
                 Ask me to continue if you'd like me to keep going."
            )),
            Self::Provider(e) => Some(format!(
                "Sorry, I couldn't get a response from the language model ({e}). Please try again in a moment."
            )),
            Self::Session(_) => Some("Sorry, I couldn't load or save this conversation. Please try again.".into()),
            Self::Cancelled | Self::UnknownTask(_) => None,
        }
    }
}

/// What happened during one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub inbound_id: String,
    pub session_key: SessionKey,
    /// Model calls made
    pub iterations: usize,
    /// Every state entered, in order
    pub states: Vec<RunState>,
    /// The text delivered for this run (reply, notice, or sub-agent result)
    pub response: Option<String>,
    pub abort: Option<RunAbort>,
}

impl RunReport {
    fn new(msg: &InboundMessage) -> Self {
        Self {
            inbound_id: msg.id.clone(),
            session_key: msg.session_key.clone(),
            iterations: 0,
            states: Vec::new(),
            response: None,
            abort: None,
        }
    }

    fn aborted(mut self, abort: RunAbort) -> Self {
        self.states.push(RunState::Aborted);
        self.abort = Some(abort);
        self
    }

    pub fn final_state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Start)
    }

    pub fn is_done(&self) -> bool {
        self.final_state() == RunState::Done
    }
}

/// The core agent loop that orchestrates LLM calls and tool execution.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    sessions: Arc<dyn SessionStore>,
    context: Arc<dyn ContextBuilder>,
    tools: ToolRegistry,
    subagent_tools: ToolRegistry,
    bus: MessageBus,
    subagents: SubagentManager,
    locks: SessionLocks,
    settings: AgentSettings,
}

impl AgentLoop {
    /// Create an agent loop. The `spawn` tool is added to `tools`; sub-agent
    /// runs get `tools` minus [`SUBAGENT_EXCLUDED_TOOLS`].
    pub fn new(
        provider: Arc<dyn Provider>,
        sessions: Arc<dyn SessionStore>,
        context: Arc<dyn ContextBuilder>,
        mut tools: ToolRegistry,
        bus: MessageBus,
    ) -> Self {
        let subagents = SubagentManager::new(bus.clone());
        tools.register(Arc::new(SpawnTool::new(subagents.clone())));
        let subagent_tools = tools.without(SUBAGENT_EXCLUDED_TOOLS);
        Self {
            provider,
            sessions,
            context,
            tools,
            subagent_tools,
            bus,
            subagents,
            locks: SessionLocks::new(),
            settings: AgentSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn subagents(&self) -> &SubagentManager {
        &self.subagents
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Drive `msg` to completion.
    ///
    /// Runs for the same session are serialized. Never fails: the outcome,
    /// including any abort, is in the returned report.
    pub async fn process(&self, msg: InboundMessage, cancel: CancellationToken) -> RunReport {
        let span = info_span!("run", session = %msg.session_key, inbound_id = %msg.id);
        self.process_inner(msg, cancel).instrument(span).await
    }

    async fn process_inner(&self, msg: InboundMessage, cancel: CancellationToken) -> RunReport {
        let mut report = RunReport::new(&msg);
        let key = msg.session_key.clone();

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return report.aborted(RunAbort::Cancelled),
            guard = self.locks.acquire(&key) => guard,
        };

        let task = if key.is_subagent() {
            let handle = msg
                .task_handle
                .clone()
                .unwrap_or_else(|| TaskHandle(key.chat_id.clone()));
            match self.subagents.start(&handle) {
                Some(task) => Some(task),
                None => {
                    warn!(task = %handle, "Inbound for unknown sub-agent task ignored");
                    return report.aborted(RunAbort::UnknownTask(handle));
                }
            }
        } else {
            None
        };

        let mailbox = task.is_none().then(|| self.subagents.open_mailbox(&key));
        let (tools, max_iterations) = match &task {
            Some(_) => (&self.subagent_tools, self.settings.subagent_max_iterations),
            None => (&self.tools, self.settings.max_iterations),
        };

        info!(source = ?msg.source, "Run started");

        let mut run = Run {
            agent: self,
            inbound: &msg,
            task: task.as_ref(),
            mailbox: mailbox.as_ref(),
            cancel: &cancel,
            tools,
            max_iterations,
            ctx: tool_context(&msg),
            messages: Vec::new(),
            pending_calls: Vec::new(),
            iterations: 0,
            states: Vec::new(),
            delivered: None,
        };
        let abort = run.drive().await;
        report.iterations = run.iterations;
        report.states = std::mem::take(&mut run.states);
        report.response = run.delivered.take();

        if let Some(abort) = &abort {
            match abort {
                RunAbort::Cancelled => info!("Run cancelled"),
                other => warn!(error = %other, iterations = report.iterations, "Run aborted"),
            }
            report.response = self.deliver_abort(&msg, task.as_ref(), abort).await;
        }
        report.abort = abort;

        if let Some(task) = &task {
            if let Err(e) = self.sessions.clear(&task.spawned_session_key).await {
                debug!(error = %e, "Failed to clear sub-agent session");
            }
        }
        if let Some(mailbox) = mailbox {
            mailbox.close().await;
        }
        drop(guard);

        info!(
            iterations = report.iterations,
            state = ?report.final_state(),
            "Run finished"
        );
        report
    }

    /// Hand the final reply to whoever is waiting for it.
    async fn deliver_reply(&self, msg: &InboundMessage, task: Option<&SubagentTask>, text: &str) {
        match task {
            Some(task) => {
                self.subagents
                    .finish(&task.handle, TaskOutcome::Completed(text.to_string()))
                    .await;
            }
            None => self.publish(OutboundMessage::reply_to(msg, text)).await,
        }
    }

    async fn deliver_abort(
        &self,
        msg: &InboundMessage,
        task: Option<&SubagentTask>,
        abort: &RunAbort,
    ) -> Option<String> {
        if let Some(task) = task {
            self.subagents
                .finish(&task.handle, TaskOutcome::Failed(abort.to_string()))
                .await;
            return None;
        }
        let notice = abort.notice()?;
        self.publish(OutboundMessage::reply_to(msg, notice.clone())).await;
        Some(notice)
    }

    async fn publish(&self, outbound: OutboundMessage) {
        if let Err(e) = self.bus.publish_outbound(outbound).await {
            error!(error = %e, "Failed to publish reply");
        }
    }
}

/// Mutable state of one in-flight run.
struct Run<'a> {
    agent: &'a AgentLoop,
    inbound: &'a InboundMessage,
    task: Option<&'a SubagentTask>,
    mailbox: Option<&'a Mailbox>,
    cancel: &'a CancellationToken,
    tools: &'a ToolRegistry,
    max_iterations: usize,
    ctx: ToolContext,
    /// Prompt plus windowed history, as sent to the model
    messages: Vec<Message>,
    pending_calls: Vec<ToolCall>,
    iterations: usize,
    states: Vec<RunState>,
    delivered: Option<String>,
}

impl Run<'_> {
    fn key(&self) -> &SessionKey {
        &self.inbound.session_key
    }

    async fn drive(&mut self) -> Option<RunAbort> {
        let mut state = RunState::Start;
        loop {
            self.states.push(state);
            if state == RunState::Done {
                return None;
            }
            match self.step(state).await {
                Ok(next) => state = next,
                Err(abort) => {
                    self.states.push(RunState::Aborted);
                    return Some(abort);
                }
            }
        }
    }

    async fn step(&mut self, state: RunState) -> Result<RunState, RunAbort> {
        match state {
            RunState::Start => self.start().await,
            RunState::BuildContext => self.build_context().await,
            RunState::CallModel => self.call_model().await,
            RunState::ExecuteTools => self.execute_tools().await,
            RunState::Respond => self.respond().await,
            RunState::Done | RunState::Aborted => Ok(state),
        }
    }

    /// Persist a turn and add it to what the model sees.
    async fn record(&mut self, message: Message) -> Result<(), RunAbort> {
        self.agent.sessions.append(self.key(), message.clone()).await?;
        self.messages.push(message);
        Ok(())
    }

    async fn start(&mut self) -> Result<RunState, RunAbort> {
        let mut text = self.inbound.text.clone();
        for attachment in &self.inbound.attachments {
            let name = attachment.filename.as_deref().unwrap_or("file");
            text.push_str(&format!("\n[attachment: {name} ({})]", attachment.url));
        }

        let mut turn = Message::user(text);
        if self.inbound.source != SourceKind::User {
            turn = turn.with_metadata("source", serde_json::to_value(self.inbound.source).unwrap_or_default());
        }
        if let Some(handle) = &self.inbound.task_handle {
            turn = turn.with_metadata("task_handle", serde_json::json!(handle.0));
        }
        self.agent.sessions.append(self.key(), turn).await?;
        Ok(RunState::BuildContext)
    }

    async fn build_context(&mut self) -> Result<RunState, RunAbort> {
        let history = self.agent.sessions.load(self.key()).await?;
        let windowed = close_dangling_calls(window_history(&history, self.agent.settings.history_window));

        let builder = self.agent.context.clone();
        let key = self.key().clone();
        let snapshot = windowed.clone();
        let segments = tokio::task::spawn_blocking(move || builder.build_prompt(&key, &snapshot))
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "Context builder failed; sending history without a system prompt");
                Vec::new()
            });

        let sent = windowed.len();
        self.messages = system_message(&segments).into_iter().chain(windowed).collect();
        debug!(
            history = history.len(),
            sent,
            segments = segments.len(),
            "Context built"
        );
        Ok(RunState::CallModel)
    }

    async fn call_model(&mut self) -> Result<RunState, RunAbort> {
        if self.cancel.is_cancelled() {
            return Err(RunAbort::Cancelled);
        }
        self.drain_reports().await?;

        self.iterations += 1;
        let agent = self.agent;
        let settings = &agent.settings;
        let request = ChatRequest {
            model: settings.model.clone(),
            messages: self.messages.clone(),
            tools: self.tools.list_schemas(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        };
        debug!(iteration = self.iterations, messages = request.messages.len(), "Calling model");

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RunAbort::Cancelled),
            response = agent.provider.chat(request) => response?,
        };

        if let Some(usage) = &response.usage {
            debug!(total_tokens = usage.total_tokens, model = %response.model, "Model responded");
        }

        if response.has_tool_calls() {
            let calls = response.tool_calls;
            let turn = Message::assistant_with_tools(
                response.content.unwrap_or_default(),
                calls.iter().map(to_message_call).collect(),
            );
            self.record(turn).await?;
            self.pending_calls = calls;
            return Ok(RunState::ExecuteTools);
        }

        let text = response
            .content
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| EMPTY_REPLY.to_string());
        self.record(Message::assistant(text.clone())).await?;
        self.delivered = Some(text);
        Ok(RunState::Respond)
    }

    async fn execute_tools(&mut self) -> Result<RunState, RunAbort> {
        let calls = std::mem::take(&mut self.pending_calls);
        info!(
            iteration = self.iterations,
            tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Executing tool calls"
        );

        let (results, cancelled) = run_concurrently(self.tools, &calls, &self.ctx, self.cancel).await;
        // Every result gets its chance at the store before a failure aborts.
        let mut store_failure = None;
        for (call, result) in calls.iter().zip(results) {
            let mut turn = Message::tool_result(&call.id, &call.name, result.output)
                .with_metadata("success", serde_json::json!(result.success));
            if let Some(kind) = result.error {
                turn = turn.with_metadata("error", serde_json::json!(kind.to_string()));
            }
            if let Err(e) = self.record(turn).await {
                warn!(call = %call.id, error = %e, "Failed to record tool result");
                store_failure.get_or_insert(e);
            }
        }
        if let Some(e) = store_failure {
            return Err(e);
        }

        if cancelled {
            return Err(RunAbort::Cancelled);
        }
        if self.iterations >= self.max_iterations {
            return Err(RunAbort::IterationLimitExceeded {
                limit: self.max_iterations,
            });
        }
        Ok(RunState::CallModel)
    }

    async fn respond(&mut self) -> Result<RunState, RunAbort> {
        let text = self.delivered.clone().unwrap_or_else(|| EMPTY_REPLY.to_string());
        self.agent.deliver_reply(self.inbound, self.task, &text).await;
        Ok(RunState::Done)
    }

    /// Move sub-agent results that arrived mid-run into history.
    async fn drain_reports(&mut self) -> Result<(), RunAbort> {
        let Some(mailbox) = self.mailbox else {
            return Ok(());
        };
        for report in mailbox.drain() {
            debug!(task = %report.handle, "Sub-agent result drained into run");
            let turn = Message::user(report.text)
                .with_metadata("source", serde_json::json!("subagent"))
                .with_metadata("task_handle", serde_json::json!(report.handle.0));
            self.record(turn).await?;
        }
        Ok(())
    }
}

fn tool_context(msg: &InboundMessage) -> ToolContext {
    let mut ctx = ToolContext::new(msg.session_key.clone(), msg.id.clone());
    ctx.source = msg.source;
    ctx.task_handle = msg.task_handle.clone();
    ctx.metadata = msg.metadata.clone();
    ctx
}

fn to_message_call(call: &ToolCall) -> MessageToolCall {
    let arguments = match &call.arguments {
        serde_json::Value::String(raw) => raw.clone(),
        other => other.to_string(),
    };
    MessageToolCall {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments,
    }
}

/// Run every call concurrently, returning results in call order.
///
/// On cancellation, calls that already finished keep their results and the
/// rest get a `cancelled` result. The flag reports whether that happened.
async fn run_concurrently(
    registry: &ToolRegistry,
    calls: &[ToolCall],
    ctx: &ToolContext,
    cancel: &CancellationToken,
) -> (Vec<ToolResult>, bool) {
    let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
    let mut cancelled = false;
    {
        let mut running: FuturesUnordered<_> = calls
            .iter()
            .enumerate()
            .map(|(i, call)| async move { (i, registry.execute(call, ctx).await) })
            .collect();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = running.next() => match next {
                    Some((i, result)) => slots[i] = Some(result),
                    None => break,
                },
            }
        }
    }

    let results = calls
        .iter()
        .zip(slots)
        .map(|(call, slot)| slot.unwrap_or_else(|| ToolResult::cancelled(&call.id)))
        .collect();
    (results, cancelled)
}
