//! Poll loop.
//!
//! One task owns both timers. Each tick's work is awaited before the next
//! `select!`, so a poll cycle never overlaps another cycle or a heartbeat.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelError;
use crate::delivery::DeliverySink;
use crate::lease::{Claim, LeaseError, LeaseManager};
use crate::liveness::LivenessReporter;
use crate::notice::{self, NoticeError, Notifier};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Notice(#[from] NoticeError),
}

/// What a single poll cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing pending for this instance.
    Idle,
    /// A request was waiting but the channel is absent; the requester was
    /// told and the request stays `pending`.
    ChannelAbsent { id: i64 },
    /// Another poller claimed the request first.
    Lost { id: i64 },
    /// Injected and marked `completed`.
    Delivered { id: i64 },
    /// Claimed but injection failed; the request stays `processing`.
    DeliveryFailed { id: i64 },
}

impl CycleOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ChannelAbsent { .. } => "channel_absent",
            Self::Lost { .. } => "lost",
            Self::Delivered { .. } => "delivered",
            Self::DeliveryFailed { .. } => "delivery_failed",
        }
    }
}

/// Poll loop timing.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

pub struct Worker {
    lease: LeaseManager,
    sink: DeliverySink,
    notifier: Notifier,
    liveness: Arc<LivenessReporter>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        lease: LeaseManager,
        sink: DeliverySink,
        notifier: Notifier,
        liveness: Arc<LivenessReporter>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            lease,
            sink,
            notifier,
            liveness,
            config,
        }
    }

    fn instance(&self) -> &str {
        self.lease.instance()
    }

    /// Run one dispatch cycle.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        self.lease.reclaim_stale(Utc::now()).await?;

        let Some(req) = self.lease.peek().await? else {
            return Ok(CycleOutcome::Idle);
        };
        info!(
            id = req.id,
            from = %req.requester_label(),
            system = req.is_system(),
            request = %req.preview(50),
            "New request"
        );

        if !self.sink.is_live().await {
            warn!(
                id = req.id,
                channel = %self.sink.channel_id(),
                "Execution channel not found; leaving request pending"
            );
            self.notifier
                .send(req.chat_id, &notice::not_running(self.instance()))
                .await?;
            return Ok(CycleOutcome::ChannelAbsent { id: req.id });
        }

        let id = req.id;
        let req = match self.lease.acquire(req).await? {
            Claim::Acquired(req) => req,
            Claim::Lost => return Ok(CycleOutcome::Lost { id }),
        };

        match self.sink.deliver(&req).await {
            Ok(()) => {
                if !self.lease.complete(&req).await? {
                    warn!(id = req.id, "Request was no longer processing at completion");
                }
                info!(id = req.id, channel = %self.sink.channel_id(), "Delivered request");
                Ok(CycleOutcome::Delivered { id: req.id })
            }
            Err(e) => {
                self.report_delivery_failure(req.id, req.chat_id, &e).await?;
                Ok(CycleOutcome::DeliveryFailed { id: req.id })
            }
        }
    }

    async fn report_delivery_failure(
        &self,
        id: i64,
        chat_id: i64,
        error: &ChannelError,
    ) -> Result<(), NoticeError> {
        warn!(id, error = %error, "Delivery failed; request left processing");
        self.notifier
            .send(chat_id, &notice::unreachable(self.instance()))
            .await
    }

    async fn heartbeat(&self) {
        match self.liveness.heartbeat().await {
            Ok(sent) => {
                debug!(sent, "Heartbeat");
                #[cfg(feature = "metrics")]
                herald_core::metrics::record_heartbeat(self.instance(), true);
            }
            Err(e) => {
                warn!(error = %e, "Heartbeat failed");
                #[cfg(feature = "metrics")]
                herald_core::metrics::record_heartbeat(self.instance(), false);
            }
        }
    }

    async fn tick(&self) {
        match self.run_cycle().await {
            Ok(outcome) => {
                debug!(outcome = outcome.as_str(), "Poll cycle");
                #[cfg(feature = "metrics")]
                herald_core::metrics::record_cycle(self.instance(), outcome.as_str());
            }
            Err(e) => {
                warn!(error = %e, "Poll cycle aborted");
                #[cfg(feature = "metrics")]
                herald_core::metrics::record_cycle(self.instance(), "error");
            }
        }
    }

    /// Register the instance, then run the poll loop. A failed registration
    /// is logged and polling starts anyway.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.liveness.register().await {
            error!(instance = %self.instance(), error = %e, "Failed to register instance; polling anyway");
        }
        self.run(shutdown).await;
    }

    /// Drive poll and heartbeat timers until `shutdown` flips.
    ///
    /// The first poll runs immediately; the first heartbeat waits one
    /// interval since registration has just refreshed `last_seen`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        heartbeat.tick().await; // Skip first immediate tick

        info!(
            instance = %self.instance(),
            poll = ?self.config.poll_interval,
            heartbeat = ?self.config.heartbeat_interval,
            "Poll loop started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => self.tick().await,
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = shutdown.changed() => {
                    info!("Poll loop shutting down");
                    return;
                }
            }
        }
    }
}
