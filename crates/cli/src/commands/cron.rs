//! `nimbot cron` — Inspect scheduled jobs.

use nimbot_bus::MessageBus;
use nimbot_config::AppConfig;
use nimbot_cron::CronService;

pub async fn list() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if config.cron.is_empty() {
        println!("No cron jobs configured.");
        println!();
        println!("  Add one to {}:", AppConfig::config_path().display());
        println!();
        println!("  [[cron]]");
        println!("  name = \"morning\"");
        println!("  schedule = \"0 9 * * *\"");
        println!("  message = \"Summarize my pending tasks\"");
        println!("  channel = \"telegram\"");
        println!("  chat_id = \"123456\"");
        return Ok(());
    }

    let service = CronService::from_config(MessageBus::default(), &config.cron).await?;
    let jobs = service.list().await;

    println!("Cron jobs ({}):", jobs.len());
    println!("{:-<78}", "");
    for job in jobs {
        let status = if job.enabled { "on " } else { "off" };
        let next = match (job.enabled, job.next_run) {
            (true, Some(at)) => at.format("%Y-%m-%d %H:%M UTC").to_string(),
            (true, None) => "never".into(),
            (false, _) => "-".into(),
        };
        println!(
            "  [{status}] {:<20} {:<16} → {:<20} next: {next}",
            job.name,
            job.schedule.to_string(),
            job.session_key.to_string()
        );
    }
    Ok(())
}
