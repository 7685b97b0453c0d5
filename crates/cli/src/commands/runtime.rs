//! Wiring shared by `agent` and `gateway`: bus, provider, sessions, tools
//! and the agent loop, built from config.

use std::sync::Arc;

use nimbot_agent::{AgentLoop, AgentSettings, SessionRouter, WorkspaceContextBuilder};
use nimbot_bus::MessageBus;
use nimbot_config::AppConfig;
use nimbot_session::JsonlSessionStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Runtime {
    pub config: AppConfig,
    pub bus: MessageBus,
    pub agent: Arc<AgentLoop>,
}

impl Runtime {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let provider = nimbot_providers::from_config(&config).map_err(|e| {
            format!("{e}\n\nRun `nimbot onboard`, then add your key to {}", AppConfig::config_path().display())
        })?;

        let workspace = config.agent.workspace_path();
        std::fs::create_dir_all(&workspace)
            .map_err(|e| format!("Failed to create workspace {}: {e}", workspace.display()))?;

        let bus = MessageBus::new(config.bus.capacity);
        let sessions = Arc::new(JsonlSessionStore::new(AppConfig::sessions_dir()));
        let context = Arc::new(WorkspaceContextBuilder::new(&workspace));
        let tools = nimbot_tools::default_registry(&config, bus.clone())?;

        let agent = AgentLoop::new(provider, sessions, context, tools, bus.clone())
            .with_settings(AgentSettings::from(&config.agent));
        info!(
            model = %config.agent.model,
            tools = agent.tools().len(),
            workspace = %workspace.display(),
            "Agent ready"
        );

        Ok(Self {
            config,
            bus,
            agent: Arc::new(agent),
        })
    }

    /// Start routing inbound messages to the agent.
    ///
    /// `stop` ends intake and lets in-flight runs finish; the returned token
    /// aborts them.
    pub fn spawn_router(
        &self,
        stop: CancellationToken,
    ) -> Result<(JoinHandle<()>, CancellationToken), Box<dyn std::error::Error>> {
        let router = SessionRouter::new(self.agent.clone());
        let abort = router.cancel_token();
        Ok((router.spawn(stop)?, abort))
    }
}
