//! Workspace context — system prompt construction from workspace files.
//!
//! Segments are emitted in this order (each is optional except identity
//! and runtime):
//!
//! 1. **Identity** — built-in description of the agent and its workspace
//! 2. **Bootstrap** — `AGENTS.md`, `SOUL.md`, `USER.md`, `TOOLS.md`, `IDENTITY.md`
//! 3. **Memory** — `memory/MEMORY.md`
//! 4. **Skills** — one-line summaries of `skills/*/SKILL.md`
//! 5. **Runtime** — current time, workspace path, channel and chat
//!
//! Sub-agent sessions get a focused task prompt plus runtime info instead.
//! Missing or empty files are silently skipped. Reads are blocking; the
//! agent loop calls the builder from a blocking task.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Local;
use nimbot_core::context::{ContextBuilder, PromptSegment, SegmentKind};
use nimbot_core::event::SessionKey;
use nimbot_core::message::{Message, Role};
use tracing::{debug, warn};

/// Bootstrap files and the tag each is wrapped in, in prompt order.
pub const BOOTSTRAP_FILES: &[(&str, &str)] = &[
    ("AGENTS.md", "agents"),
    ("SOUL.md", "soul"),
    ("USER.md", "user"),
    ("TOOLS.md", "tools"),
    ("IDENTITY.md", "identity"),
];

pub const MEMORY_FILE: &str = "memory/MEMORY.md";
pub const SKILLS_DIR: &str = "skills";
pub const SKILL_FILE: &str = "SKILL.md";

/// Builds prompts from the files in a workspace directory.
#[derive(Debug, Clone)]
pub struct WorkspaceContextBuilder {
    workspace: PathBuf,
}

impl WorkspaceContextBuilder {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn identity(&self) -> String {
        format!(
            "You are nimbot, a personal AI assistant. You can read, write and edit files, \
             run shell commands, search and fetch from the web, message the user, and \
             spawn background sub-agents for longer tasks.\n\n\
             Your workspace is {ws}. Keep long-term notes in {ws}/{MEMORY_FILE}.\n\n\
             Reply with plain text to answer the current conversation. Only use the \
             `message` tool to reach a different chat or to send progress updates.",
            ws = self.workspace.display()
        )
    }

    fn subagent_identity(&self) -> String {
        format!(
            "You are a sub-agent spawned by the main agent to complete one specific task.\n\n\
             Rules:\n\
             - Stay focused on the assigned task and nothing else.\n\
             - You cannot message the user or spawn further sub-agents.\n\
             - Your final reply is reported back to the main agent, so make it a \
             complete, self-contained summary of what you found or did.\n\n\
             Your workspace is {}.",
            self.workspace.display()
        )
    }

    fn bootstrap(&self) -> Vec<PromptSegment> {
        BOOTSTRAP_FILES
            .iter()
            .filter_map(|(file, tag)| {
                let content = read_nonempty(&self.workspace.join(file))?;
                debug!(file, "Loaded bootstrap file");
                Some(PromptSegment::new(SegmentKind::Bootstrap, wrap(tag, &content)))
            })
            .collect()
    }

    fn memory(&self) -> Option<PromptSegment> {
        let content = read_nonempty(&self.workspace.join(MEMORY_FILE))?;
        Some(PromptSegment::new(SegmentKind::Memory, wrap("memory", &content)))
    }

    fn skills(&self) -> Option<PromptSegment> {
        let dir = self.workspace.join(SKILLS_DIR);
        if !dir.is_dir() {
            return None;
        }
        let mut entries: Vec<PathBuf> = match std::fs::read_dir(&dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.join(SKILL_FILE).is_file())
                .collect(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to read skills directory");
                return None;
            }
        };
        entries.sort();

        let lines: Vec<String> = entries
            .iter()
            .filter_map(|skill_dir| {
                let name = skill_dir.file_name()?.to_str()?.to_string();
                let path = skill_dir.join(SKILL_FILE);
                let content = read_nonempty(&path)?;
                let summary = skill_summary(&content).unwrap_or_else(|| "(no description)".into());
                Some(format!("- {name}: {summary} ({})", path.display()))
            })
            .collect();
        if lines.is_empty() {
            return None;
        }

        let body = format!(
            "Skills extend your capabilities. Read a skill's SKILL.md with read_file before using it.\n{}",
            lines.join("\n")
        );
        Some(PromptSegment::new(SegmentKind::Skills, wrap("skills", &body)))
    }

    fn runtime(&self, key: &SessionKey) -> PromptSegment {
        let now = Local::now();
        let mut body = format!(
            "Current time: {} ({})\nWorkspace: {}",
            now.format("%Y-%m-%d %H:%M %Z"),
            now.format("%A"),
            self.workspace.display()
        );
        if !key.is_subagent() {
            body.push_str(&format!("\nChannel: {}\nChat ID: {}", key.channel, key.chat_id));
        }
        PromptSegment::new(SegmentKind::Runtime, wrap("runtime", &body))
    }
}

impl ContextBuilder for WorkspaceContextBuilder {
    fn build_prompt(&self, key: &SessionKey, _history: &[Message]) -> Vec<PromptSegment> {
        if key.is_subagent() {
            return vec![
                PromptSegment::new(SegmentKind::Identity, self.subagent_identity()),
                self.runtime(key),
            ];
        }

        let mut segments = vec![PromptSegment::new(SegmentKind::Identity, self.identity())];
        segments.extend(self.bootstrap());
        segments.extend(self.memory());
        segments.extend(self.skills());
        segments.push(self.runtime(key));
        segments
    }
}

fn read_nonempty(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// XML-style tags keep sections clearly delimited for the model.
fn wrap(tag: &str, content: &str) -> String {
    format!("<{tag}>\n{content}\n</{tag}>")
}

/// A skill's `description:` front-matter field, or else its first prose line.
fn skill_summary(content: &str) -> Option<String> {
    let mut lines = content.lines().map(str::trim);
    if content.trim_start().starts_with("---") {
        lines.next();
        for line in lines.by_ref() {
            if line == "---" {
                break;
            }
            if let Some(desc) = line.strip_prefix("description:") {
                let desc = desc.trim().trim_matches('"');
                if !desc.is_empty() {
                    return Some(desc.to_string());
                }
            }
        }
    }
    lines
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
}

/// The most recent `window` turns of `history`, never starting on a tool
/// result whose assistant turn was cut off.
pub fn window_history(history: &[Message], window: usize) -> &[Message] {
    let start = history.len().saturating_sub(window);
    let mut windowed = &history[start..];
    while windowed.first().is_some_and(|m| m.role == Role::Tool) {
        windowed = &windowed[1..];
    }
    windowed
}

/// Result text stood in for a tool call whose result never reached the store.
pub const UNRECORDED_RESULT: &str = "Error: this tool call's result was not recorded.";

/// `history` with every assistant tool call answered.
///
/// A call whose result turn is missing from the results following its
/// assistant turn gets an [`UNRECORDED_RESULT`] turn appended after them.
pub fn close_dangling_calls(history: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(history.len());
    let mut i = 0;
    while i < history.len() {
        let turn = &history[i];
        out.push(turn.clone());
        i += 1;
        if turn.role != Role::Assistant || turn.tool_calls.is_empty() {
            continue;
        }

        let mut answered = HashSet::new();
        while let Some(result) = history.get(i).filter(|m| m.role == Role::Tool) {
            answered.extend(result.tool_call_id.as_deref());
            out.push(result.clone());
            i += 1;
        }
        for call in turn.tool_calls.iter().filter(|c| !answered.contains(c.id.as_str())) {
            warn!(call = %call.id, tool = %call.name, "Tool call without a recorded result");
            out.push(Message::tool_result(&call.id, &call.name, UNRECORDED_RESULT));
        }
    }
    out
}

/// Render segments as the single system message sent ahead of history.
pub fn system_message(segments: &[PromptSegment]) -> Option<Message> {
    if segments.is_empty() {
        return None;
    }
    let content = segments
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    Some(Message::system(content))
}
