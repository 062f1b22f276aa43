//! Herald CLI
//!
//! Operator tooling for a Herald deployment: enqueue instance-to-instance
//! requests, send chat replies, and inspect the queue and registry.

use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use herald_cli::commands::{self, Command};
use herald_core::chat::TelegramClient;
use herald_core::config::load_config;
use herald_core::open_store;

#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(version, about = "Herald operator CLI", long_about = None)]
struct Cli {
    /// Config file (JSON), applied over the global settings file
    #[arg(long, env = "HERALD_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "herald=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let config = load_config(cli.config.as_deref())?;
    let mut out = io::stdout();

    match cli.command {
        Command::Call {
            instance,
            text,
            chat_id,
            from,
        } => {
            let stores = open_store(&config).await?;
            let req =
                commands::call(stores.requests.as_ref(), &instance, &text, chat_id, from.as_deref())
                    .await?;
            writeln!(out, "Queued request {} for @{}", req.id, instance)?;
        }
        Command::Send {
            chat_id,
            text,
            plain,
        } => {
            let chat = TelegramClient::new(&commands::chat_config(&config, plain)?)?;
            commands::send(&chat, chat_id, &text).await?;
        }
        Command::Instances => {
            let stores = open_store(&config).await?;
            commands::instances(stores.registry.as_ref(), &mut out, config.stale_after()).await?;
        }
        Command::Requests { status, limit } => {
            let stores = open_store(&config).await?;
            commands::requests(stores.requests.as_ref(), &mut out, status, limit).await?;
        }
    }
    Ok(())
}
