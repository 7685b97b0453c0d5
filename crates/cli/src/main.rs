//! Nimbot CLI — the main entry point.
//!
//! Commands:
//! - `onboard`   — Initialize config & workspace
//! - `agent`     — Interactive chat or single-message mode
//! - `gateway`   — Run channels, cron and the agent until Ctrl-C
//! - `status`    — Show system status
//! - `cron list` — Show scheduled jobs

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "nimbot", about = "Nimbot — a personal AI agent runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and workspace
    Onboard,

    /// Chat with the agent
    Agent {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Session to talk in, as `channel:chat_id`
        #[arg(short, long, default_value = "cli:direct")]
        session: String,
    },

    /// Run channels, scheduled jobs and the agent until Ctrl-C
    Gateway,

    /// Show system status
    Status,

    /// Manage scheduled jobs
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
}

#[derive(Subcommand)]
enum CronCommand {
    /// List configured jobs and their next run
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Agent { message, session } => commands::agent::run(message, &session).await?,
        Commands::Gateway => commands::gateway::run().await?,
        Commands::Status => commands::status::run().await?,
        Commands::Cron { command: CronCommand::List } => commands::cron::list().await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_message_mode() {
        let cli = Cli::try_parse_from(["nimbot", "agent", "-m", "What is 2+2?"]).unwrap();
        match cli.command {
            Commands::Agent { message, session } => {
                assert_eq!(message.as_deref(), Some("What is 2+2?"));
                assert_eq!(session, "cli:direct");
            }
            _ => panic!("expected agent command"),
        }
    }

    #[test]
    fn parses_nested_cron_and_global_verbose() {
        let cli = Cli::try_parse_from(["nimbot", "cron", "list", "--verbose"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Cron { command: CronCommand::List }));
        assert!(Cli::try_parse_from(["nimbot", "daemon"]).is_err());
    }
}
