//! Chat channel implementations for Nimbot.
//!
//! Each channel connects to a chat platform and relays messages to/from
//! the bus through the [`ChannelManager`].
//!
//! Available channels:
//! - **CLI** — Interactive terminal chat (stdin/stdout)
//! - **Telegram** — Telegram Bot API via long polling

pub mod cli;
pub mod manager;
pub mod telegram;

pub use cli::CliChannel;
pub use manager::ChannelManager;
pub use telegram::TelegramChannel;
