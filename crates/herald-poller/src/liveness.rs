//! Presence reporting for this instance.
//!
//! The registry row is upserted at startup, refreshed by heartbeats and
//! patched `offline` on graceful shutdown. Online and offline transitions
//! are also announced to the home chat when one is configured.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use herald_core::models::InstancePatch;
use herald_core::{Instance, InstanceRegistry, StoreError, tag};

use crate::notice::{self, Notifier};

#[derive(Debug, Error)]
pub enum LivenessError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Registry call timed out after {0:?}")]
    Timeout(Duration),
}

/// What this poller registers as.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub role: String,
    pub channel: String,
    pub home_chat_id: Option<i64>,
}

pub struct LivenessReporter {
    registry: Arc<dyn InstanceRegistry>,
    notifier: Notifier,
    identity: Identity,
    stale_after: Duration,
    timeout: Duration,
    offline: AtomicBool,
}

impl LivenessReporter {
    pub fn new(
        registry: Arc<dyn InstanceRegistry>,
        notifier: Notifier,
        identity: Identity,
        stale_after: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            notifier,
            identity,
            stale_after,
            timeout,
            offline: AtomicBool::new(false),
        }
    }

    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, LivenessError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| LivenessError::Timeout(self.timeout))?
            .map_err(LivenessError::from)
    }

    /// Upsert this instance as `online`, then announce it.
    ///
    /// Warns when a fresh `online` row already exists under this name, and
    /// when another registered name collides with this one's tag.
    pub async fn register(&self) -> Result<Instance, LivenessError> {
        let name = &self.identity.name;
        let now = Utc::now();

        match self.bounded(self.registry.get_instance(name)).await {
            Ok(Some(existing)) if existing.liveness(now, self.stale_after).is_alive() => {
                warn!(
                    instance = %name,
                    last_seen = %existing.last_seen,
                    "Instance is already online; another poller may be running under this name"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(instance = %name, error = %e, "Could not read existing instance row"),
        }

        match self.bounded(self.registry.list_instances()).await {
            Ok(others) => {
                let mut names: Vec<&str> = others.iter().map(|i| i.name.as_str()).collect();
                if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                    names.push(name);
                }
                for (shorter, longer) in tag::find_collisions(&names) {
                    if shorter.eq_ignore_ascii_case(name) || longer.eq_ignore_ascii_case(name) {
                        warn!(
                            shorter,
                            longer,
                            "Tag collision: requests for @{longer} also match @{shorter}"
                        );
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not list instances for collision check"),
        }

        let instance = Instance::starting(
            name,
            &self.identity.role,
            &self.identity.channel,
            self.identity.home_chat_id,
            now,
        );
        let stored = self.bounded(self.registry.upsert_instance(&instance)).await?;
        self.offline.store(false, Ordering::SeqCst);
        info!(instance = %name, channel = %self.identity.channel, "Registered instance");

        self.announce(&notice::online(name, &self.identity.role)).await;
        Ok(stored)
    }

    /// Refresh `last_seen`. Returns `false` without touching the registry
    /// once [`Self::mark_offline`] has run.
    pub async fn heartbeat(&self) -> Result<bool, LivenessError> {
        if self.offline.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let patch = InstancePatch::heartbeat(Utc::now());
        self.bounded(self.registry.patch_instance(&self.identity.name, &patch))
            .await?;
        Ok(true)
    }

    /// Patch the row `offline` and announce the departure.
    pub async fn mark_offline(&self) -> Result<(), LivenessError> {
        self.offline.store(true, Ordering::SeqCst);
        let result = self
            .bounded(
                self.registry
                    .patch_instance(&self.identity.name, &InstancePatch::offline()),
            )
            .await;
        self.announce(&notice::offline(&self.identity.name)).await;
        result
    }

    /// Best-effort message to the home chat.
    async fn announce(&self, text: &str) {
        let Some(chat_id) = self.identity.home_chat_id else {
            return;
        };
        if let Err(e) = self.notifier.send(chat_id, text).await {
            warn!(chat_id, error = %e, "Announcement failed");
        }
    }
}
