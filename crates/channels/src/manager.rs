//! Channel manager — connects channel adapters to the bus.
//!
//! Inbound: every registered channel's messages are checked against that
//! channel's allow-list and published as `user` inbound events.
//! Outbound: replies are dispatched to the channel named by their session key.

use std::collections::HashMap;
use std::sync::Arc;

use nimbot_bus::MessageBus;
use nimbot_config::{AppConfig, ChannelConfig};
use nimbot_core::channel::{Channel, ChannelMessage};
use nimbot_core::error::{BusError, ChannelError};
use nimbot_core::event::OutboundMessage;
use nimbot_security::{AllowlistPolicy, SenderCheckResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::telegram::TelegramChannel;

struct Entry {
    channel: Arc<dyn Channel>,
    config: ChannelConfig,
}

/// Central registry holding all enabled channel instances.
#[derive(Default)]
pub struct ChannelManager {
    channels: HashMap<String, Entry>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every enabled channel from `config`. Unknown channel names
    /// and channels missing required settings are skipped with a warning.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut manager = Self::new();
        for (name, channel_config) in &config.channels {
            if !channel_config.enabled {
                continue;
            }
            let channel: Arc<dyn Channel> = match name.as_str() {
                "telegram" => match TelegramChannel::from_config(channel_config) {
                    Ok(channel) => Arc::new(channel),
                    Err(e) => {
                        warn!(channel = %name, error = %e, "Channel not started");
                        continue;
                    }
                },
                other => {
                    warn!(channel = %other, "Unknown channel in config, ignoring");
                    continue;
                }
            };
            manager.register(channel, channel_config.clone());
        }
        manager
    }

    /// Register a channel adapter with its allow-list settings.
    pub fn register(&mut self, channel: Arc<dyn Channel>, config: ChannelConfig) {
        let name = channel.name().to_string();
        info!(channel = %name, "Registered channel");
        self.channels.insert(name, Entry { channel, config });
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(name).map(|e| &e.channel)
    }

    /// Registered channel names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Start every channel and forward its messages onto the bus.
    ///
    /// Returns one forwarding task per channel; each ends when its channel
    /// stops producing or the bus closes.
    pub async fn start_all(&self, bus: &MessageBus) -> Result<Vec<JoinHandle<()>>, ChannelError> {
        let mut forwarders = Vec::with_capacity(self.channels.len());
        for (name, entry) in &self.channels {
            let rx = entry.channel.start().await?;
            forwarders.push(tokio::spawn(forward(
                name.clone(),
                entry.config.clone(),
                rx,
                bus.clone(),
            )));
            info!(channel = %name, "Started channel");
        }
        Ok(forwarders)
    }

    /// Deliver outbound messages to their channels until the bus closes.
    ///
    /// Sub-agent sessions have no channel; their traffic is never dispatched.
    pub fn spawn_dispatcher(&self, bus: &MessageBus) -> Result<JoinHandle<()>, BusError> {
        let channels: Arc<HashMap<String, Arc<dyn Channel>>> = Arc::new(
            self.channels
                .iter()
                .map(|(name, e)| (name.clone(), e.channel.clone()))
                .collect(),
        );
        bus.spawn_outbound_handler(
            "channels",
            |msg: &OutboundMessage| !msg.session_key.is_subagent(),
            move |msg: OutboundMessage| {
                let channels = channels.clone();
                async move { dispatch(&channels, &msg).await }
            },
        )
    }

    /// Stop all channels gracefully.
    pub async fn stop_all(&self) {
        for (name, entry) in &self.channels {
            if let Err(e) = entry.channel.stop().await {
                warn!(channel = %name, error = %e, "Failed to stop channel");
            }
        }
    }
}

async fn forward(
    name: String,
    config: ChannelConfig,
    mut rx: mpsc::Receiver<Result<ChannelMessage, ChannelError>>,
    bus: MessageBus,
) {
    while let Some(next) = rx.recv().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                warn!(channel = %name, error = %e, "Channel receive error");
                continue;
            }
        };

        if let SenderCheckResult::Denied { sender_id, reason } =
            AllowlistPolicy::check_sender(&config, &msg.sender_id)
        {
            warn!(channel = %name, sender = %sender_id, %reason, "Message from unauthorized sender dropped");
            continue;
        }

        if let Err(e) = bus.publish_inbound(msg.into_inbound(&name)).await {
            debug!(channel = %name, error = %e, "Bus closed, stopping channel forwarder");
            break;
        }
    }
}

async fn dispatch(
    channels: &HashMap<String, Arc<dyn Channel>>,
    msg: &OutboundMessage,
) -> Result<(), ChannelError> {
    let channel = channels
        .get(msg.channel())
        .ok_or_else(|| ChannelError::NotConfigured(format!("Channel '{}' not found", msg.channel())))?;
    channel.send(msg).await
}
