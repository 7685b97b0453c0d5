//! LLM Provider implementations for Nimbot.
//!
//! All providers implement the `nimbot_core::Provider` trait.
//! [`from_config`] builds the configured one.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use nimbot_config::AppConfig;
use nimbot_core::error::ProviderError;
use nimbot_core::provider::Provider;
use std::sync::Arc;
use std::time::Duration;

/// Build the provider described by `config`.
///
/// Fails with [`ProviderError::NotConfigured`] when no API key is available.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let api_key = config.provider.api_key.clone().ok_or_else(|| {
        ProviderError::NotConfigured(
            "no API key: set provider.api_key in ~/.nimbot/config.toml or NIMBOT_API_KEY".into(),
        )
    })?;

    let provider = OpenAiCompatProvider::new(
        config.provider.name.clone(),
        config.provider.api_base.clone(),
        api_key,
        config.agent.model.clone(),
        Duration::from_secs(config.provider.timeout_secs),
    )?
    .with_retry(config.provider.max_retries, Duration::from_secs(1));

    tracing::info!(
        provider = %config.provider.name,
        model = %config.agent.model,
        "Provider configured"
    );
    Ok(Arc::new(provider))
}
