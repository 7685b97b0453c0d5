//! `nimbot status` — Show system status.

use nimbot_config::AppConfig;
use nimbot_core::session::SessionStore;
use nimbot_session::JsonlSessionStore;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let sessions = JsonlSessionStore::new(AppConfig::sessions_dir())
        .list_keys()
        .await
        .map(|keys| keys.len().to_string())
        .unwrap_or_else(|e| format!("unavailable ({e})"));
    let channels: Vec<&str> = config.enabled_channels().into_iter().map(|(name, _)| name).collect();

    println!("Nimbot Status");
    println!("=============");
    println!("  Config:       {}", AppConfig::config_path().display());
    println!("  Workspace:    {}", config.agent.workspace_path().display());
    println!("  Provider:     {} ({})", config.provider.name, config.provider.api_base);
    println!("  API key:      {}", if config.has_api_key() { "set" } else { "missing" });
    println!("  Model:        {}", config.agent.model);
    println!("  Iterations:   {} (sub-agents {})", config.agent.max_iterations, config.agent.subagent_max_iterations);
    println!("  Channels:     {}", if channels.is_empty() { "none".to_string() } else { channels.join(", ") });
    println!("  Cron jobs:    {}", config.cron.len());
    println!("  Heartbeat:    {}", if config.heartbeat.enabled { "enabled" } else { "disabled" });
    println!("  Sessions:     {sessions}");

    if AppConfig::config_path().exists() {
        println!("\n  Config file found");
    } else {
        println!("\n  No config file — run `nimbot onboard` first");
    }
    Ok(())
}
