//! `nimbot agent` — Interactive or single-message chat mode.

use std::sync::Arc;
use std::time::Duration;

use nimbot_channels::{ChannelManager, CliChannel};
use nimbot_config::{AppConfig, ChannelConfig};
use nimbot_bus::Subscription;
use nimbot_core::event::{InboundMessage, OutboundMessage, SessionKey};
use tokio_util::sync::CancellationToken;

use super::runtime::Runtime;

/// How long a single message may take, tool calls included.
const REPLY_TIMEOUT: Duration = Duration::from_secs(600);

pub async fn run(message: Option<String>, session: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let runtime = Runtime::build(config)?;
    let shutdown = CancellationToken::new();

    match message {
        Some(text) => {
            let key = SessionKey::parse(session)
                .ok_or_else(|| format!("Invalid session '{session}', expected channel:chat_id"))?;
            single(&runtime, key, text, shutdown).await
        }
        None => interactive(&runtime, shutdown).await,
    }
}

async fn single(
    runtime: &Runtime,
    key: SessionKey,
    text: String,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let msg = InboundMessage::user(key, "user", text);
    let id = msg.id.clone();
    let mut replies = runtime.bus.subscribe_outbound(move |out| out.in_reply_to == id)?;
    let (router, abort) = runtime.spawn_router(shutdown.clone())?;

    runtime.bus.publish_inbound(msg).await?;
    let reply = tokio::time::timeout(
        REPLY_TIMEOUT,
        await_answer(&mut replies, |note| println!("{}", note.content)),
    )
    .await;

    shutdown.cancel();
    abort.cancel();
    router.await?;

    match reply {
        Ok(Some(reply)) => {
            println!("{}", reply.content);
            Ok(())
        }
        Ok(None) => Err("Message bus closed before a reply arrived".into()),
        Err(_) => Err("Timed out waiting for the agent".into()),
    }
}

/// Wait for the run's answer, handing mid-run notes to `on_note` as they arrive.
async fn await_answer(
    replies: &mut Subscription<OutboundMessage>,
    mut on_note: impl FnMut(&OutboundMessage),
) -> Option<OutboundMessage> {
    while let Some(out) = replies.recv().await {
        if !out.is_side_channel() {
            return Some(out);
        }
        on_note(&out);
    }
    None
}

async fn interactive(runtime: &Runtime, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("  Nimbot — interactive mode");
    println!("  Model:     {}", runtime.config.agent.model);
    println!("  Tools:     {}", runtime.agent.tools().names().join(", "));
    println!("  Type 'exit' or press Ctrl+D to quit.");
    println!();

    let mut channels = ChannelManager::new();
    channels.register(
        Arc::new(CliChannel::new()),
        ChannelConfig {
            enabled: true,
            ..ChannelConfig::default()
        },
    );

    let (router, abort) = runtime.spawn_router(shutdown.clone())?;
    let dispatcher = channels.spawn_dispatcher(&runtime.bus)?;
    let forwarders = channels.start_all(&runtime.bus).await?;

    let interrupted = tokio::select! {
        _ = wait_all(forwarders) => false,
        _ = tokio::signal::ctrl_c() => true,
    };

    // On EOF the last run still gets to answer; Ctrl-C aborts it.
    shutdown.cancel();
    if interrupted {
        abort.cancel();
    }
    router.await?;
    runtime.bus.close();
    dispatcher.await?;

    println!("  Goodbye!");
    Ok(())
}

async fn wait_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbot_bus::MessageBus;

    #[tokio::test]
    async fn progress_notes_do_not_end_the_wait() {
        let bus = MessageBus::new(8);
        let key = SessionKey::new("cli", "direct");
        let inbound = InboundMessage::user(key.clone(), "user", "do the thing");
        let id = inbound.id.clone();
        let mut replies = bus.subscribe_outbound(move |out| out.in_reply_to == id).unwrap();

        bus.publish_outbound(OutboundMessage::side_channel(key.clone(), "halfway there", inbound.id.clone()))
            .await
            .unwrap();
        bus.publish_outbound(OutboundMessage::reply_to(&inbound, "all done"))
            .await
            .unwrap();

        let mut notes = Vec::new();
        let answer = await_answer(&mut replies, |n| notes.push(n.content.clone())).await.unwrap();
        assert_eq!(answer.content, "all done");
        assert_eq!(notes, vec!["halfway there".to_string()]);
    }

    #[tokio::test]
    async fn closed_bus_ends_the_wait() {
        let bus = MessageBus::new(8);
        let mut replies = bus.subscribe_outbound(|_| true).unwrap();
        bus.publish_outbound(OutboundMessage::side_channel(SessionKey::new("cli", "direct"), "note", "in-1"))
            .await
            .unwrap();
        bus.close();
        assert!(await_answer(&mut replies, |_| {}).await.is_none());
    }
}
