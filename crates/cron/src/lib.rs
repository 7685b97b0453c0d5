//! Scheduled producers of inbound messages.
//!
//! [`CronService`] fires jobs on 5-field cron expressions or fixed
//! intervals; [`HeartbeatService`] periodically asks the agent to check
//! `HEARTBEAT.md`. Both publish `cron` inbound messages onto the bus and
//! never talk to the agent directly.

mod expr;
mod heartbeat;
mod service;

pub use expr::CronExpr;
pub use heartbeat::{HEARTBEAT_FILE, HEARTBEAT_PROMPT, HeartbeatService, heartbeat_is_empty};
pub use service::{CronJob, CronService, Schedule};

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("Cron job '{0}' needs exactly one of schedule or every_secs")]
    MissingSchedule(String),

    #[error("Cron job '{0}' already exists")]
    DuplicateJob(String),
}
