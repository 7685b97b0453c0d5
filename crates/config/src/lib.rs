//! Configuration loading, validation, and management for Nimbot.
//!
//! Loads configuration from `~/.nimbot/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.nimbot/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM provider connection
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Message bus settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Built-in tool settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Channel configurations, keyed by channel name
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,

    /// Scheduled jobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cron: Vec<CronJobConfig>,

    /// Heartbeat configuration
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name, used for logs and the `HTTP-Referer`/`X-Title` headers
    #[serde(default = "default_provider_name")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Retries for 429 and 5xx responses
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_name() -> String {
    "openrouter".into()
}
fn default_api_base() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_max_retries() -> u32 {
    3
}
fn default_request_timeout() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            api_key: None,
            api_base: default_api_base(),
            max_retries: default_max_retries(),
            timeout_secs: default_request_timeout(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("api_key", &redact(&self.api_key))
            .field("api_base", &self.api_base)
            .field("max_retries", &self.max_retries)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Model calls allowed per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Model calls allowed per sub-agent run
    #[serde(default = "default_subagent_max_iterations")]
    pub subagent_max_iterations: usize,

    /// Most recent history turns sent to the model
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Registry-wide tool timeout
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Workspace directory; `~` is expanded
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_iterations() -> usize {
    20
}
fn default_subagent_max_iterations() -> usize {
    15
}
fn default_history_window() -> usize {
    50
}
fn default_tool_timeout() -> u64 {
    60
}
fn default_workspace() -> String {
    "~/.nimbot/workspace".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_iterations: default_max_iterations(),
            subagent_max_iterations: default_subagent_max_iterations(),
            history_window: default_history_window(),
            tool_timeout_secs: default_tool_timeout(),
            workspace: default_workspace(),
        }
    }
}

impl AgentConfig {
    /// The workspace directory with `~` expanded.
    pub fn workspace_path(&self) -> PathBuf {
        expand_home(&self.workspace)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Queue capacity per subscriber
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_bus_capacity() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Confine file tools and `exec` working directories to the workspace
    #[serde(default)]
    pub restrict_to_workspace: bool,

    #[serde(default)]
    pub exec: ExecConfig,

    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,

    /// Extra regex patterns rejected in addition to the built-in deny list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny_patterns: Vec<String>,

    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_exec_timeout() -> u64 {
    60
}
fn default_max_output_chars() -> usize {
    10_000
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_exec_timeout(),
            deny_patterns: Vec::new(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Brave Search API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_api_key: Option<String>,

    #[serde(default = "default_search_results")]
    pub max_results: u32,

    #[serde(default = "default_fetch_max_chars")]
    pub fetch_max_chars: usize,
}

fn default_search_results() -> u32 {
    5
}
fn default_fetch_max_chars() -> usize {
    50_000
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            search_api_key: None,
            max_results: default_search_results(),
            fetch_max_chars: default_fetch_max_chars(),
        }
    }
}

impl std::fmt::Debug for WebConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebConfig")
            .field("search_api_key", &redact(&self.search_api_key))
            .field("max_results", &self.max_results)
            .field("fetch_max_chars", &self.fetch_max_chars)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Allowlist of sender IDs. Empty or `["*"]` = allow all.
    #[serde(default)]
    pub allow_from: Vec<String>,

    /// Channel-specific settings (token, proxy, ...)
    #[serde(flatten)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl ChannelConfig {
    /// A string setting, e.g. `token`.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Settings routinely hold bot tokens.
        let keys: Vec<&String> = self.settings.keys().collect();
        f.debug_struct("ChannelConfig")
            .field("enabled", &self.enabled)
            .field("allow_from", &self.allow_from)
            .field("settings", &keys)
            .finish()
    }
}

/// A scheduled job that injects a message into a session.
///
/// Exactly one of `schedule` (5-field cron) and `every_secs` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobConfig {
    /// Unique name for this job
    pub name: String,

    /// Cron expression (5-field: minute hour dom month dow)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Fixed interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_secs: Option<u64>,

    /// Text handed to the agent when the job fires
    pub message: String,

    /// Target channel (e.g. "telegram")
    pub channel: String,

    /// Target chat within the channel
    pub chat_id: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_heartbeat_interval")]
    pub interval_minutes: u32,

    /// Session that receives heartbeat prompts
    #[serde(default = "default_heartbeat_channel")]
    pub channel: String,

    #[serde(default = "default_heartbeat_chat")]
    pub chat_id: String,
}

fn default_heartbeat_interval() -> u32 {
    30
}
fn default_heartbeat_channel() -> String {
    "cli".into()
}
fn default_heartbeat_chat() -> String {
    "heartbeat".into()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_heartbeat_interval(),
            channel: default_heartbeat_channel(),
            chat_id: default_heartbeat_chat(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.nimbot/config.toml).
    ///
    /// Environment variables override the file:
    /// - `NIMBOT_API_KEY`, then `OPENROUTER_API_KEY`, then `OPENAI_API_KEY`
    ///   (only when the file has no key)
    /// - `NIMBOT_MODEL`, `NIMBOT_API_BASE`
    /// - `BRAVE_API_KEY` (only when the file has no search key)
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.provider.api_key.is_none() {
            self.provider.api_key = lookup("NIMBOT_API_KEY")
                .or_else(|| lookup("OPENROUTER_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"));
        }
        if let Some(model) = lookup("NIMBOT_MODEL") {
            self.agent.model = model;
        }
        if let Some(base) = lookup("NIMBOT_API_BASE") {
            self.provider.api_base = base;
        }
        if self.tools.web.search_api_key.is_none() {
            self.tools.web.search_api_key = lookup("BRAVE_API_KEY");
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".nimbot")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Where the JSONL session store keeps its files.
    pub fn sessions_dir() -> PathBuf {
        Self::config_dir().join("sessions")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.agent.temperature) {
            return Err(ConfigError::ValidationError(
                "agent.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.agent.max_iterations == 0 || self.agent.subagent_max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations and agent.subagent_max_iterations must be > 0".into(),
            ));
        }
        if self.agent.history_window == 0 {
            return Err(ConfigError::ValidationError(
                "agent.history_window must be > 0".into(),
            ));
        }
        if self.bus.capacity == 0 {
            return Err(ConfigError::ValidationError("bus.capacity must be > 0".into()));
        }
        if self.heartbeat.enabled && self.heartbeat.interval_minutes == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat.interval_minutes must be > 0".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for job in &self.cron {
            if !seen.insert(job.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate cron job name '{}'",
                    job.name
                )));
            }
            match (&job.schedule, job.every_secs) {
                (Some(_), None) => {}
                (None, Some(secs)) if secs > 0 => {}
                (None, Some(_)) => {
                    return Err(ConfigError::ValidationError(format!(
                        "cron job '{}': every_secs must be > 0",
                        job.name
                    )));
                }
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "cron job '{}' needs exactly one of schedule or every_secs",
                        job.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Channels with `enabled = true`, sorted by name.
    pub fn enabled_channels(&self) -> Vec<(&str, &ChannelConfig)> {
        let mut enabled: Vec<(&str, &ChannelConfig)> = self
            .channels
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(name, c)| (name.as_str(), c))
            .collect();
        enabled.sort_by_key(|(name, _)| *name);
        enabled
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let mut config = Self::default();
        config.channels.insert(
            "telegram".into(),
            ChannelConfig {
                enabled: false,
                allow_from: Vec::new(),
                settings: HashMap::from([("token".to_string(), serde_json::json!(""))]),
            },
        );
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs_home();
    }
    match path.strip_prefix("~/") {
        Some(rest) => dirs_home().join(rest),
        None => PathBuf::from(path),
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
