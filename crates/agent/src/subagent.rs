//! Sub-agent spawner.
//!
//! `spawn` hands a task to an independent agent run on a synthetic
//! `subagent:<handle>` session and returns at once. The spawned run goes
//! through the bus and session router like any other inbound message, with
//! a restricted tool set and its own iteration ceiling.
//!
//! When the spawned run ends, its result is delivered to the parent
//! session:
//! - into the parent's open [`Mailbox`] if a parent run is in flight (the
//!   loop drains it before its next model call), or
//! - as a fresh inbound message (source `subagent`) on the parent session.
//!
//! A task record lives from `spawn` until its result has been delivered.
//! A result nobody is listening for is parked and handed to the parent
//! session's next run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbot_bus::MessageBus;
use nimbot_core::error::{BusError, ToolError};
use nimbot_core::event::{InboundMessage, SessionKey, TaskHandle};
use nimbot_core::tool::{Tool, ToolContext};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Lifecycle of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// A spawned task, as tracked by the manager.
#[derive(Debug, Clone, Serialize)]
pub struct SubagentTask {
    pub handle: TaskHandle,
    pub parent_session_key: SessionKey,
    pub spawned_session_key: SessionKey,
    /// The inbound message whose run spawned the task
    pub parent_inbound_id: String,
    pub label: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    parent_metadata: serde_json::Map<String, serde_json::Value>,
}

/// How a spawned run ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(String),
    Failed(String),
}

/// A finished task's result, addressed to its parent session.
#[derive(Debug, Clone)]
pub struct SubagentReport {
    pub handle: TaskHandle,
    pub label: String,
    pub status: TaskStatus,
    /// Announcement text handed to the parent's model
    pub text: String,
    /// Channel metadata of the message that spawned the task
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskHandle, SubagentTask>,
    /// Present while the session has a run in flight.
    mailboxes: HashMap<SessionKey, Vec<SubagentReport>>,
    /// Results no bus subscriber accepted, waiting for the session's next run.
    parked: HashMap<SessionKey, Vec<SubagentReport>>,
}

/// Tracks spawned tasks and routes their results home. Cheap to clone.
#[derive(Clone)]
pub struct SubagentManager {
    bus: MessageBus,
    state: Arc<Mutex<State>>,
}

impl SubagentManager {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a background task for `instruction` on behalf of the run in `ctx`.
    ///
    /// Returns as soon as the task's inbound message is on the bus.
    pub async fn spawn(
        &self,
        instruction: &str,
        label: Option<&str>,
        ctx: &ToolContext,
    ) -> Result<TaskHandle, BusError> {
        let label = label
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .unwrap_or_else(|| default_label(instruction));

        let (handle, spawned_session_key) = {
            let mut state = self.state();
            let handle = unused_handle(&state.tasks, TaskHandle::new);
            let spawned_session_key = SessionKey::subagent(&handle);
            let task = SubagentTask {
                handle: handle.clone(),
                parent_session_key: ctx.session_key.clone(),
                spawned_session_key: spawned_session_key.clone(),
                parent_inbound_id: ctx.inbound_id.clone(),
                label: label.clone(),
                instruction: instruction.to_string(),
                status: TaskStatus::Pending,
                created_at: Utc::now(),
                parent_metadata: ctx.metadata.clone(),
            };
            state.tasks.insert(handle.clone(), task);
            (handle, spawned_session_key)
        };

        let inbound = InboundMessage::subagent(spawned_session_key.clone(), handle.clone(), instruction);
        let published = match self.bus.publish_inbound(inbound).await {
            Ok(0) => Err(BusError::NoSubscriber {
                what: spawned_session_key.to_string(),
            }),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            self.state().tasks.remove(&handle);
            return Err(e);
        }

        info!(task = %handle, label = %label, parent = %ctx.session_key, "Spawned sub-agent");
        Ok(handle)
    }

    /// Mark `handle` as running and return its record.
    ///
    /// `None` means the task is unknown (already delivered, or never spawned
    /// by this process).
    pub fn start(&self, handle: &TaskHandle) -> Option<SubagentTask> {
        let mut state = self.state();
        let task = state.tasks.get_mut(handle)?;
        task.status = TaskStatus::Running;
        Some(task.clone())
    }

    /// Record how `handle` ended and deliver the result to its parent.
    pub async fn finish(&self, handle: &TaskHandle, outcome: TaskOutcome) {
        let (report, parent) = {
            let mut state = self.state();
            let Some(mut task) = state.tasks.remove(handle) else {
                warn!(task = %handle, "Result for unknown sub-agent task dropped");
                return;
            };
            task.status = match outcome {
                TaskOutcome::Completed(_) => TaskStatus::Done,
                TaskOutcome::Failed(_) => TaskStatus::Failed,
            };
            let report = SubagentReport {
                handle: handle.clone(),
                label: task.label.clone(),
                status: task.status,
                text: announcement(&task, &outcome),
                metadata: task.parent_metadata.clone(),
            };

            match state.mailboxes.get_mut(&task.parent_session_key) {
                Some(mailbox) => {
                    mailbox.push(report);
                    debug!(task = %handle, parent = %task.parent_session_key, "Result queued for active parent run");
                    return;
                }
                None => (report, task.parent_session_key),
            }
        };

        self.deliver_fresh(&parent, report).await;
    }

    /// Publish `report` as a new inbound message on `parent`, parking it if
    /// no subscriber takes it.
    async fn deliver_fresh(&self, parent: &SessionKey, report: SubagentReport) {
        let mut inbound = InboundMessage::subagent(parent.clone(), report.handle.clone(), report.text.clone());
        inbound.metadata = report.metadata.clone();
        let reason = match self.bus.publish_inbound(inbound).await {
            Ok(0) => "no inbound subscriber".to_string(),
            Ok(_) => {
                debug!(task = %report.handle, parent = %parent, "Result delivered as new inbound message");
                return;
            }
            Err(e) => e.to_string(),
        };
        warn!(
            task = %report.handle,
            parent = %parent,
            reason = %reason,
            "Sub-agent result not delivered; keeping it for the parent's next run"
        );
        let mut state = self.state();
        match state.mailboxes.get_mut(parent) {
            Some(mailbox) => mailbox.push(report),
            None => state.parked.entry(parent.clone()).or_default().push(report),
        }
    }

    /// Open the mailbox for a run on `key`. Held for the whole run.
    ///
    /// Results parked for `key` are in it from the start.
    pub fn open_mailbox(&self, key: &SessionKey) -> Mailbox {
        let mut state = self.state();
        let parked = state.parked.remove(key).unwrap_or_default();
        state.mailboxes.entry(key.clone()).or_default().extend(parked);
        drop(state);
        Mailbox {
            manager: self.clone(),
            key: key.clone(),
            closed: false,
        }
    }

    pub fn get(&self, handle: &TaskHandle) -> Option<SubagentTask> {
        self.state().tasks.get(handle).cloned()
    }

    /// Every task not yet delivered, oldest first.
    pub fn tasks(&self) -> Vec<SubagentTask> {
        let mut tasks: Vec<_> = self.state().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn active_count(&self) -> usize {
        self.state().tasks.len()
    }

    /// Results waiting for a run on their parent session.
    pub fn parked_count(&self) -> usize {
        self.state().parked.values().map(Vec::len).sum()
    }
}

/// A handle `generate` produces that no live task already uses.
fn unused_handle(
    tasks: &HashMap<TaskHandle, SubagentTask>,
    mut generate: impl FnMut() -> TaskHandle,
) -> TaskHandle {
    loop {
        let handle = generate();
        if !tasks.contains_key(&handle) {
            return handle;
        }
        debug!(task = %handle, "Task handle collision, generating another");
    }
}

fn default_label(instruction: &str) -> String {
    let trimmed = instruction.trim();
    if trimmed.chars().count() <= 30 {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(30).collect();
    format!("{}...", head.trim_end())
}

fn announcement(task: &SubagentTask, outcome: &TaskOutcome) -> String {
    let (status, body) = match outcome {
        TaskOutcome::Completed(text) => ("completed successfully", text.as_str()),
        TaskOutcome::Failed(reason) => ("failed", reason.as_str()),
    };
    format!(
        "[Background task '{}' {status}]\n\nTask: {}\n\nResult:\n{body}\n\n\
         Summarize this naturally for the user. Keep it brief and don't mention task IDs.",
        task.label, task.instruction
    )
}

/// A session's inbox for sub-agent results while one of its runs is in flight.
///
/// Closing (or dropping) it hands anything still undrained back to the bus
/// as fresh inbound messages.
pub struct Mailbox {
    manager: SubagentManager,
    key: SessionKey,
    closed: bool,
}

impl Mailbox {
    /// Take every result that has arrived since the last drain.
    pub fn drain(&self) -> Vec<SubagentReport> {
        self.manager
            .state()
            .mailboxes
            .get_mut(&self.key)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    fn take_remaining(&mut self) -> Vec<SubagentReport> {
        self.closed = true;
        self.manager.state().mailboxes.remove(&self.key).unwrap_or_default()
    }

    /// Close the mailbox, re-delivering undrained results.
    pub async fn close(mut self) {
        let remaining = self.take_remaining();
        if remaining.is_empty() {
            return;
        }
        debug!(session = %self.key, count = remaining.len(), "Re-delivering undrained sub-agent results");
        for report in remaining {
            self.manager.deliver_fresh(&self.key, report).await;
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let remaining = self.take_remaining();
        if remaining.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session = %self.key, count = remaining.len(), "Sub-agent results lost: no runtime");
            return;
        };
        let manager = self.manager.clone();
        let key = self.key.clone();
        runtime.spawn(async move {
            for report in remaining {
                manager.deliver_fresh(&key, report).await;
            }
        });
    }
}

/// The `spawn` tool: delegate a task to a background sub-agent.
pub struct SpawnTool {
    manager: SubagentManager,
}

impl SpawnTool {
    pub fn new(manager: SubagentManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a background sub-agent to handle a task independently. Returns immediately; \
         the sub-agent's result is reported back to this conversation when it finishes."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Complete description of what the sub-agent should do",
                    "minLength": 1
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label for the task",
                    "maxLength": 60
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let task = arguments["task"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'task' argument".into()))?;
        let label = arguments["label"].as_str();

        let handle = self
            .manager
            .spawn(task, label, ctx)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: e.to_string(),
            })?;
        let label = self
            .manager
            .get(&handle)
            .map(|t| t.label)
            .unwrap_or_else(|| default_label(task));

        Ok(format!(
            "Sub-agent '{label}' started (task {handle}). It works in the background; \
             its result will arrive in this conversation when it finishes."
        ))
    }
}
