use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nimbot_bus::MessageBus;
use nimbot_config::CronJobConfig;
use nimbot_core::event::{InboundMessage, SessionKey};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{CronError, CronExpr};

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(CronExpr),
    Every(Duration),
}

impl Schedule {
    /// The first firing time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(expr) => expr.next_after(after),
            Self::Every(every) => chrono::Duration::from_std(*every).ok().map(|d| after + d),
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cron(expr) => write!(f, "{expr}"),
            Self::Every(every) => write!(f, "every {}s", every.as_secs()),
        }
    }
}

/// A scheduled job and its run bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct CronJob {
    pub name: String,
    #[serde(serialize_with = "display")]
    pub schedule: Schedule,
    /// Text handed to the agent when the job fires
    pub message: String,
    pub session_key: SessionKey,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

fn display<S: serde::Serializer>(schedule: &Schedule, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(schedule)
}

impl CronJob {
    pub fn new(
        name: impl Into<String>,
        schedule: Schedule,
        message: impl Into<String>,
        session_key: SessionKey,
    ) -> Self {
        let next_run = schedule.next_after(Utc::now());
        Self {
            name: name.into(),
            schedule,
            message: message.into(),
            session_key,
            enabled: true,
            last_run: None,
            next_run,
        }
    }

    pub fn from_config(config: &CronJobConfig) -> Result<Self, CronError> {
        let schedule = match (&config.schedule, config.every_secs) {
            (Some(expr), None) => Schedule::Cron(CronExpr::parse(expr)?),
            (None, Some(secs)) if secs > 0 => Schedule::Every(Duration::from_secs(secs)),
            _ => return Err(CronError::MissingSchedule(config.name.clone())),
        };
        let mut job = Self::new(
            &config.name,
            schedule,
            &config.message,
            SessionKey::new(&config.channel, &config.chat_id),
        );
        job.enabled = config.enabled;
        Ok(job)
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|t| t <= now)
    }
}

/// Owns the job table and fires due jobs onto the bus.
#[derive(Clone)]
pub struct CronService {
    bus: MessageBus,
    jobs: Arc<RwLock<BTreeMap<String, CronJob>>>,
    tick: Duration,
}

impl CronService {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            jobs: Arc::new(RwLock::new(BTreeMap::new())),
            tick: Duration::from_secs(1),
        }
    }

    /// How often the scheduler checks for due jobs.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// A service preloaded with `jobs`. Fails on the first invalid job.
    pub async fn from_config(bus: MessageBus, jobs: &[CronJobConfig]) -> Result<Self, CronError> {
        let service = Self::new(bus);
        for config in jobs {
            service.add(CronJob::from_config(config)?).await?;
        }
        Ok(service)
    }

    pub async fn add(&self, job: CronJob) -> Result<(), CronError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.name) {
            return Err(CronError::DuplicateJob(job.name));
        }
        info!(job = %job.name, schedule = %job.schedule, session = %job.session_key, "Cron job added");
        jobs.insert(job.name.clone(), job);
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.jobs.write().await.remove(name).is_some()
    }

    /// Enable or disable a job. Re-enabling schedules from now.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(name) else {
            return false;
        };
        if enabled && !job.enabled {
            job.next_run = job.schedule.next_after(Utc::now());
        }
        job.enabled = enabled;
        true
    }

    /// Every job, ordered by name.
    pub async fn list(&self) -> Vec<CronJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Fire every job due at `now`. Returns how many were published.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<InboundMessage> = {
            let mut jobs = self.jobs.write().await;
            jobs.values_mut()
                .filter(|job| job.is_due(now))
                .map(|job| {
                    job.last_run = Some(now);
                    job.next_run = job.schedule.next_after(now);
                    info!(job = %job.name, next_run = ?job.next_run, "Cron job fired");
                    InboundMessage::cron(job.session_key.clone(), &job.name, &job.message)
                        .with_metadata("cron_job", serde_json::json!(job.name))
                })
                .collect()
        };

        let mut fired = 0;
        for msg in due {
            match self.bus.publish_inbound(msg).await {
                Ok(_) => fired += 1,
                Err(e) => warn!(error = %e, "Failed to publish cron message"),
            }
        }
        fired
    }

    /// Run the scheduler until `shutdown` fires or the bus closes.
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let jobs = service.jobs.read().await.len();
            info!(jobs, "Cron service started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if service.bus.is_closed() {
                            break;
                        }
                        service.tick(Utc::now()).await;
                    }
                }
            }
            debug!("Cron service stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbot_core::event::SourceKind;

    fn every(secs: u64) -> CronJobConfig {
        CronJobConfig {
            name: format!("every-{secs}"),
            schedule: None,
            every_secs: Some(secs),
            message: "check the inbox".into(),
            channel: "telegram".into(),
            chat_id: "42".into(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn due_jobs_publish_cron_messages() {
        let bus = MessageBus::new(8);
        let mut inbound = bus.subscribe_inbound(|_| true).unwrap();
        let service = CronService::from_config(bus.clone(), &[every(60)]).await.unwrap();

        let now = Utc::now();
        assert_eq!(service.tick(now).await, 0);
        assert_eq!(service.tick(now + chrono::Duration::seconds(61)).await, 1);

        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.source, SourceKind::Cron);
        assert_eq!(msg.session_key, SessionKey::new("telegram", "42"));
        assert_eq!(msg.text, "check the inbox");
        assert_eq!(msg.metadata["cron_job"], "every-60");

        let job = &service.list().await[0];
        assert!(job.last_run.is_some());
        assert!(job.next_run.unwrap() > now + chrono::Duration::seconds(61));
    }

    #[tokio::test]
    async fn disabled_jobs_do_not_fire() {
        let bus = MessageBus::new(8);
        let service = CronService::from_config(bus, &[every(1)]).await.unwrap();
        assert!(service.set_enabled("every-1", false).await);

        let later = Utc::now() + chrono::Duration::seconds(10);
        assert_eq!(service.tick(later).await, 0);

        assert!(service.set_enabled("every-1", true).await);
        assert!(!service.set_enabled("missing", true).await);
    }

    #[tokio::test]
    async fn add_remove_and_duplicates() {
        let service = CronService::new(MessageBus::new(8));
        let job = CronJob::new(
            "morning",
            Schedule::Cron(CronExpr::parse("0 9 * * *").unwrap()),
            "Good morning summary",
            SessionKey::new("cli", "direct"),
        );
        service.add(job.clone()).await.unwrap();
        assert!(matches!(service.add(job).await, Err(CronError::DuplicateJob(_))));

        let listed = service.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].schedule.to_string(), "0 9 * * *");

        assert!(service.remove("morning").await);
        assert!(!service.remove("morning").await);
    }

    #[tokio::test]
    async fn config_needs_exactly_one_schedule() {
        let mut both = every(5);
        both.schedule = Some("* * * * *".into());
        assert!(matches!(CronJob::from_config(&both), Err(CronError::MissingSchedule(_))));

        let mut bad = every(5);
        bad.every_secs = None;
        bad.schedule = Some("not a cron".into());
        assert!(matches!(CronJob::from_config(&bad), Err(CronError::InvalidExpression { .. })));
    }

    #[tokio::test]
    async fn jobs_serialize_with_readable_schedule() {
        let job = CronJob::from_config(&every(30)).unwrap();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["schedule"], "every 30s");
        assert_eq!(json["session_key"]["channel"], "telegram");
    }

    #[tokio::test(start_paused = true)]
    async fn start_fires_until_shutdown() {
        let bus = MessageBus::new(8);
        let mut inbound = bus.subscribe_inbound(|_| true).unwrap();
        let job = CronJob {
            next_run: Some(Utc::now()),
            ..CronJob::from_config(&every(3600)).unwrap()
        };
        let service = CronService::new(bus).with_tick(Duration::from_millis(10));
        service.add(job).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = service.start(shutdown.clone());

        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.sender_id, "every-3600");

        shutdown.cancel();
        handle.await.unwrap();
    }
}
