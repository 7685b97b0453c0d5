//! `nimbot gateway` — channels, scheduled jobs and the agent, until Ctrl-C.

use nimbot_channels::ChannelManager;
use nimbot_config::AppConfig;
use nimbot_cron::{CronService, HeartbeatService};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::runtime::Runtime;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let runtime = Runtime::build(config)?;
    let bus = &runtime.bus;
    let shutdown = CancellationToken::new();

    let channels = ChannelManager::from_config(&runtime.config);
    if channels.is_empty() {
        warn!("No channels enabled; only scheduled jobs will reach the agent");
    }

    let (router, abort) = runtime.spawn_router(shutdown.clone())?;
    let dispatcher = channels.spawn_dispatcher(bus)?;
    let forwarders = channels.start_all(bus).await?;

    let cron = CronService::from_config(bus.clone(), &runtime.config.cron).await?;
    let cron_task = cron.start(shutdown.child_token());

    let heartbeat_task = runtime.config.heartbeat.enabled.then(|| {
        HeartbeatService::new(bus.clone(), runtime.config.agent.workspace_path(), &runtime.config.heartbeat)
            .start(shutdown.child_token())
    });

    info!(
        channels = ?channels.names(),
        cron_jobs = runtime.config.cron.len(),
        heartbeat = runtime.config.heartbeat.enabled,
        "Gateway running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    abort.cancel();
    channels.stop_all().await;
    router.await?;
    cron_task.await?;
    if let Some(task) = heartbeat_task {
        task.await?;
    }

    bus.close();
    dispatcher.await?;
    for forwarder in forwarders {
        forwarder.await?;
    }
    info!("Gateway stopped");
    Ok(())
}
