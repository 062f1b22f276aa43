//! Herald poller
//!
//! Registers one named instance, then polls the request store for requests
//! tagged `@<name>` and injects them into the instance's execution channel.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use herald_core::chat::TelegramClient;
use herald_core::config::{ChannelKind, Config, load_config};
use herald_core::open_store;
use herald_poller::channel::{ExecutionChannel, ShellChannel, TmuxChannel};
use herald_poller::delivery::DeliverySink;
use herald_poller::lease::LeaseManager;
use herald_poller::liveness::{Identity, LivenessReporter};
use herald_poller::notice::Notifier;
use herald_poller::worker::{Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "herald-poller")]
#[command(version, about = "Herald poller - routes @tagged chat requests to a named instance")]
struct Args {
    /// Config file (JSON), applied over the global settings file
    #[arg(long, env = "HERALD_CONFIG")]
    config: Option<PathBuf>,

    /// Instance name; also the routing tag
    #[arg(long)]
    name: Option<String>,

    /// Advisory role shown in announcements
    #[arg(long)]
    role: Option<String>,

    /// Execution channel identifier (tmux session name)
    #[arg(long)]
    channel: Option<String>,

    /// Chat that receives online/offline announcements
    #[arg(long, allow_hyphen_values = true)]
    home_chat_id: Option<i64>,

    /// Poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "HERALD_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(name) = &self.name {
            config.instance.name.clone_from(name);
        }
        if let Some(role) = &self.role {
            config.instance.role.clone_from(role);
        }
        if let Some(channel) = &self.channel {
            config.instance.channel.clone_from(channel);
        }
        if self.home_chat_id.is_some() {
            config.instance.home_chat_id = self.home_chat_id;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poller.poll_interval_ms = ms;
        }
        if let Some(level) = &self.log_level {
            config.log.level.clone_from(level);
        }
        if self.log_json {
            config.log.json = true;
        }
    }
}

fn build_channel(config: &Config) -> anyhow::Result<Arc<dyn ExecutionChannel>> {
    let id = config.instance.channel.clone();
    let channel: Arc<dyn ExecutionChannel> = match config.channel.kind {
        ChannelKind::Tmux => Arc::new(TmuxChannel::new(
            id,
            config.channel.tmux_bin.clone(),
            config.channel_timeout(),
        )),
        ChannelKind::Shell => {
            let (Some(exists), Some(inject)) =
                (&config.channel.exists_cmd, &config.channel.inject_cmd)
            else {
                anyhow::bail!("shell channel requires exists_cmd and inject_cmd");
            };
            Arc::new(ShellChannel::new(
                id,
                exists.clone(),
                inject.clone(),
                config.channel_timeout(),
            ))
        }
    };
    Ok(channel)
}

// jscpd:ignore-start -- binary bootstrap is inherently similar across binaries
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!("herald_poller={0},herald_core={0}", config.log.level);
    let _metrics_guard = herald_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        config.log.json,
        metrics_endpoint,
    );
    // jscpd:ignore-end

    config.validate()?;
    let name = config.instance.name.clone();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance = %name,
        role = %config.instance.role,
        channel = %config.instance.channel,
        poll_ms = config.poller.poll_interval_ms,
        heartbeat_secs = config.poller.heartbeat_interval_secs,
        "Starting herald-poller"
    );

    let stores = open_store(&config).await?;
    let chat = Arc::new(TelegramClient::new(&config.telegram_config()?)?);
    let notifier = Notifier::new(chat, config.store_timeout());
    let channel = build_channel(&config)?;

    if !channel.exists().await.unwrap_or(false) {
        warn!(
            channel = %channel.id(),
            "Execution channel not found; requests will be answered with a not-running notice until it exists"
        );
    }

    let liveness = Arc::new(LivenessReporter::new(
        stores.registry,
        notifier.clone(),
        Identity {
            name: name.clone(),
            role: config.instance.role.clone(),
            channel: config.instance.channel.clone(),
            home_chat_id: config.instance.home_chat_id,
        },
        config.stale_after(),
        config.store_timeout(),
    ));
    let lease = LeaseManager::new(stores.requests, name.clone(), config.store_timeout())
        .with_reclaim_after(config.lease_reclaim_after());
    let worker = Worker::new(
        lease,
        DeliverySink::new(channel, name.clone()),
        notifier,
        Arc::clone(&liveness),
        WorkerConfig {
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
        },
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker_handle = tokio::spawn(async move { worker.start(shutdown_rx).await });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // The `true` parameter unsets $NOTIFY_SOCKET so processes started by the
    // execution channel don't notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    // Stop the worker first so no heartbeat lands after the offline patch.
    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;

    if let Err(e) = liveness.mark_offline().await {
        error!(error = %e, "Failed to mark instance offline");
    }

    info!(instance = %name, "Poller stopped");
    Ok(())
}
