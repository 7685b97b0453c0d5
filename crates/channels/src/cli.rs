//! CLI channel — interactive terminal-based chat.
//!
//! Reads lines from stdin, writes replies to stdout. Every line is a
//! message from the local user on the `cli:direct` session.

use async_trait::async_trait;
use nimbot_core::channel::{Channel, ChannelMessage};
use nimbot_core::error::ChannelError;
use nimbot_core::event::OutboundMessage;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

pub const CLI_CHAT_ID: &str = "direct";
pub const CLI_SENDER: &str = "user";

const EXIT_COMMANDS: &[&str] = &["exit", "quit", "/exit", "/quit", ":q"];

type Input = Box<dyn AsyncBufRead + Send + Unpin>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// Interactive CLI channel for terminal-based chat.
pub struct CliChannel {
    input: Mutex<Option<Input>>,
    output: Mutex<Output>,
}

impl CliChannel {
    pub fn new() -> Self {
        Self::with_io(BufReader::new(io::stdin()), io::stdout())
    }

    /// A CLI channel over arbitrary streams.
    pub fn with_io(
        input: impl AsyncBufRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            input: Mutex::new(Some(Box::new(input))),
            output: Mutex::new(Box::new(output)),
        }
    }

    pub fn is_exit_command(line: &str) -> bool {
        EXIT_COMMANDS.contains(&line.trim())
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    /// Input ends at EOF (Ctrl+D) or an exit command; the receiver then closes.
    async fn start(
        &self,
    ) -> Result<mpsc::Receiver<Result<ChannelMessage, ChannelError>>, ChannelError> {
        let input = self
            .input
            .lock()
            .await
            .take()
            .ok_or_else(|| ChannelError::ConnectionLost("cli input already consumed".into()))?;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut lines = input.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if Self::is_exit_command(line) {
                            break;
                        }
                        let msg = ChannelMessage::new(CLI_SENDER, CLI_CHAT_ID, line);
                        if tx.send(Ok(msg)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(ChannelError::ConnectionLost(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        let mut output = self.output.lock().await;
        let write = async {
            output.write_all(message.content.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await
        };
        write.await.map_err(|e| ChannelError::DeliveryFailed {
            channel: "cli".into(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbot_core::event::SessionKey;

    #[tokio::test]
    async fn reads_lines_until_exit() {
        let input: &[u8] = b"hello\n\n  second  \nexit\nignored\n";
        let channel = CliChannel::with_io(input, tokio::io::sink());
        let mut rx = channel.start().await.unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.content, "hello");
        assert_eq!(first.chat_id, CLI_CHAT_ID);
        assert_eq!(rx.recv().await.unwrap().unwrap().content, "second");
        assert!(rx.recv().await.is_none());

        assert!(channel.start().await.is_err());
    }

    #[tokio::test]
    async fn send_writes_a_line() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let channel = CliChannel::with_io(tokio::io::empty(), writer);
        let out = OutboundMessage::new(SessionKey::new("cli", CLI_CHAT_ID), "4", "in-1");
        channel.send(&out).await.unwrap();

        let mut buf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf, b"4\n");
    }

    #[test]
    fn exit_commands() {
        assert!(CliChannel::is_exit_command(" quit "));
        assert!(!CliChannel::is_exit_command("quitting"));
    }
}
