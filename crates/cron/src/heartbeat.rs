//! Periodic wake-up that points the agent at `HEARTBEAT.md`.
//!
//! A tick is skipped when the file is missing or holds nothing actionable
//! (only headings, comments, blank lines or empty checkboxes).

use std::path::PathBuf;
use std::time::Duration;

use nimbot_bus::MessageBus;
use nimbot_config::HeartbeatConfig;
use nimbot_core::event::{InboundMessage, SessionKey};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HEARTBEAT_FILE: &str = "HEARTBEAT.md";

pub const HEARTBEAT_PROMPT: &str = "Read HEARTBEAT.md in your workspace (if it exists). \
Follow any instructions or tasks listed there. \
If nothing needs attention, reply with just: HEARTBEAT_OK";

pub struct HeartbeatService {
    bus: MessageBus,
    workspace: PathBuf,
    session_key: SessionKey,
    interval: Duration,
}

impl HeartbeatService {
    pub fn new(bus: MessageBus, workspace: impl Into<PathBuf>, config: &HeartbeatConfig) -> Self {
        Self {
            bus,
            workspace: workspace.into(),
            session_key: SessionKey::new(&config.channel, &config.chat_id),
            interval: Duration::from_secs(u64::from(config.interval_minutes.max(1)) * 60),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Publish a heartbeat prompt if `HEARTBEAT.md` has anything to act on.
    pub async fn beat(&self) -> bool {
        let path = self.workspace.join(HEARTBEAT_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No HEARTBEAT.md, skipping heartbeat");
                return false;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read heartbeat file");
                return false;
            }
        };
        if heartbeat_is_empty(&content) {
            debug!("HEARTBEAT.md has no tasks, skipping heartbeat");
            return false;
        }

        let msg = InboundMessage::cron(self.session_key.clone(), "heartbeat", HEARTBEAT_PROMPT);
        match self.bus.publish_inbound(msg).await {
            Ok(_) => {
                info!(session = %self.session_key, "Heartbeat sent");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to publish heartbeat");
                false
            }
        }
    }

    /// Beat every interval until `shutdown` fires. The first beat comes
    /// one full interval after start.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut interval = tokio::time::interval_at(start, self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = self.interval.as_secs(), "Heartbeat started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.beat().await;
                    }
                }
            }
            debug!("Heartbeat stopped");
        })
    }
}

/// Whether `content` has no actionable lines.
pub fn heartbeat_is_empty(content: &str) -> bool {
    const SKIPPED: &[&str] = &["- [ ]", "* [ ]", "- [x]", "* [x]"];
    content.lines().map(str::trim).all(|line| {
        line.is_empty() || line.starts_with('#') || line.starts_with("<!--") || SKIPPED.contains(&line)
    })
}
