//! Request leasing for one instance.
//!
//! A claim is split in two so the caller can check the execution channel
//! between finding a candidate and taking it: [`LeaseManager::peek`] reads
//! the oldest matching `pending` row, [`LeaseManager::acquire`] takes it with
//! a conditional update that fails when another poller got there first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use herald_core::{Request, RequestStatus, RequestStore, StoreError};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of [`LeaseManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The request is now `processing` and owned by this poller.
    Acquired(Request),
    /// The request was no longer `pending`.
    Lost,
}

pub struct LeaseManager {
    store: Arc<dyn RequestStore>,
    instance: String,
    timeout: Duration,
    reclaim_after: Option<Duration>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn RequestStore>, instance: impl Into<String>, timeout: Duration) -> Self {
        Self {
            store,
            instance: instance.into(),
            timeout,
            reclaim_after: None,
        }
    }

    /// Enable returning stale `processing` leases to `pending`.
    #[must_use]
    pub const fn with_reclaim_after(mut self, reclaim_after: Option<Duration>) -> Self {
        self.reclaim_after = reclaim_after;
        self
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, LeaseError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| LeaseError::Timeout(self.timeout))?
            .map_err(LeaseError::from)
    }

    /// Oldest `pending` request tagged for this instance.
    pub async fn peek(&self) -> Result<Option<Request>, LeaseError> {
        self.bounded(self.store.next_pending(&self.instance)).await
    }

    /// Take `request` by moving it to `processing`.
    pub async fn acquire(&self, request: Request) -> Result<Claim, LeaseError> {
        let now = Utc::now();
        if self.bounded(self.store.mark_processing(request.id, now)).await? {
            debug!(id = request.id, instance = %self.instance, "Lease acquired");
            let mut request = request;
            request.status = RequestStatus::Processing;
            request.claimed_at = Some(now);
            Ok(Claim::Acquired(request))
        } else {
            info!(id = request.id, instance = %self.instance, "Lease lost to another poller");
            Ok(Claim::Lost)
        }
    }

    /// Mark a delivered request `completed`. Returns `false` when it was not
    /// `processing` (already completed, for example).
    pub async fn complete(&self, request: &Request) -> Result<bool, LeaseError> {
        self.bounded(self.store.mark_completed(request.id, Utc::now()))
            .await
    }

    /// Return this instance's leases older than the reclaim threshold to
    /// `pending`. No-op when reclaiming is disabled.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<u64, LeaseError> {
        let Some(after) = self.reclaim_after else {
            return Ok(0);
        };
        let cutoff = chrono::Duration::from_std(after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reclaimed = self
            .bounded(self.store.reclaim_stale(&self.instance, cutoff))
            .await?;
        if reclaimed > 0 {
            info!(instance = %self.instance, reclaimed, "Returned stale leases to pending");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use herald_core::db::Database;
    use herald_core::NewRequest;

    fn new_request(text: &str) -> NewRequest {
        NewRequest {
            chat_id: -100,
            user_id: 42,
            username: Some("ada_l".into()),
            first_name: Some("Ada".into()),
            request: text.into(),
        }
    }

    async fn manager() -> (LeaseManager, Database) {
        let db = Database::open_in_memory().await.unwrap();
        let lease = LeaseManager::new(Arc::new(db.clone()), "coder", Duration::from_secs(5));
        (lease, db)
    }

    #[tokio::test]
    async fn peek_ignores_other_instances() {
        let (lease, db) = manager().await;
        db.insert_request(&new_request("@ideas brainstorm")).await.unwrap();
        assert!(lease.peek().await.unwrap().is_none());

        db.insert_request(&new_request("please @CODER look")).await.unwrap();
        let found = lease.peek().await.unwrap().unwrap();
        assert_eq!(found.request, "please @CODER look");
    }

    #[tokio::test]
    async fn second_acquire_is_lost() {
        let (lease, db) = manager().await;
        db.insert_request(&new_request("@coder fix")).await.unwrap();
        let req = lease.peek().await.unwrap().unwrap();

        let first = lease.acquire(req.clone()).await.unwrap();
        assert!(matches!(first, Claim::Acquired(ref r) if r.status == RequestStatus::Processing));
        assert_eq!(lease.acquire(req).await.unwrap(), Claim::Lost);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let (lease, db) = manager().await;
        db.insert_request(&new_request("@coder fix")).await.unwrap();
        let req = lease.peek().await.unwrap().unwrap();
        let Claim::Acquired(req) = lease.acquire(req).await.unwrap() else {
            panic!("expected to acquire");
        };

        assert!(lease.complete(&req).await.unwrap());
        assert!(!lease.complete(&req).await.unwrap());
        let stored = db.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);
        assert!(stored.responded_at.is_some());
    }

    #[tokio::test]
    async fn reclaim_disabled_by_default() {
        let (lease, db) = manager().await;
        db.insert_request(&new_request("@coder fix")).await.unwrap();
        let req = lease.peek().await.unwrap().unwrap();
        lease.acquire(req).await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(lease.reclaim_stale(later).await.unwrap(), 0);
        assert!(lease.peek().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaim_returns_old_leases() {
        let (lease, db) = manager().await;
        let lease = lease.with_reclaim_after(Some(Duration::from_secs(60)));
        db.insert_request(&new_request("@coder fix")).await.unwrap();
        let req = lease.peek().await.unwrap().unwrap();
        lease.acquire(req.clone()).await.unwrap();

        assert_eq!(lease.reclaim_stale(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::minutes(2);
        assert_eq!(lease.reclaim_stale(later).await.unwrap(), 1);
        assert_eq!(lease.peek().await.unwrap().unwrap().id, req.id);
    }
}
