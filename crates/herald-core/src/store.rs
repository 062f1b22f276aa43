//! Request store and instance registry interfaces.
//!
//! The dispatch core only talks to storage through these two traits.
//! [`crate::db::Database`] implements both on `SQLite`;
//! [`crate::rest::PostgrestClient`] implements both on a `PostgREST` endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::config::{Config, StoreBackend};
use crate::db::{Database, DatabaseError};
use crate::models::{Instance, InstancePatch, NewRequest, Request, RequestStatus};
use crate::rest::{PostgrestClient, RestError};

/// Errors surfaced by any store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Rest(#[from] RestError),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Queue of routed requests.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Oldest `pending` request addressed to `instance`, if any.
    async fn next_pending(&self, instance: &str) -> Result<Option<Request>, StoreError>;

    /// Move a request from `pending` to `processing`.
    ///
    /// Returns `false` when the row was no longer `pending` (another poller
    /// claimed it first, or it was removed).
    async fn mark_processing(&self, id: i64, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Move a request from `processing` to `completed`, stamping
    /// `responded_at`. Returns `false` when it was not `processing`.
    async fn mark_completed(&self, id: i64, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Enqueue a new `pending` request.
    async fn insert_request(&self, new: &NewRequest) -> Result<Request, StoreError>;

    /// Return `processing` requests addressed to `instance` that were claimed
    /// before `cutoff` to `pending`. Returns the number of rows reset.
    async fn reclaim_stale(
        &self,
        instance: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn get_request(&self, id: i64) -> Result<Option<Request>, StoreError>;

    /// Most recent requests first, optionally filtered by status.
    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: u32,
    ) -> Result<Vec<Request>, StoreError>;
}

/// Presence table keyed by instance name.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Insert or overwrite the row for `instance.name`.
    async fn upsert_instance(&self, instance: &Instance) -> Result<Instance, StoreError>;

    async fn patch_instance(&self, name: &str, patch: &InstancePatch) -> Result<(), StoreError>;

    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, StoreError>;

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError>;
}

/// Both store interfaces over one backend connection.
#[derive(Clone)]
pub struct Stores {
    pub requests: Arc<dyn RequestStore>,
    pub registry: Arc<dyn InstanceRegistry>,
}

impl Stores {
    pub fn shared<S>(store: S) -> Self
    where
        S: RequestStore + InstanceRegistry + 'static,
    {
        let store = Arc::new(store);
        let requests: Arc<dyn RequestStore> = store.clone();
        let registry: Arc<dyn InstanceRegistry> = store;
        Self { requests, registry }
    }
}

/// Open the backend selected by `config`: `PostgREST` when a store URL is
/// set, otherwise the `SQLite` file.
pub async fn open_store(config: &Config) -> crate::Result<Stores> {
    match config.store_backend()? {
        StoreBackend::Rest { url, key } => {
            info!(url = %url, "Using PostgREST store");
            let client =
                PostgrestClient::new(&config.postgrest_config(&url, &key)).map_err(StoreError::from)?;
            Ok(Stores::shared(client))
        }
        StoreBackend::Sqlite(path) => {
            info!(path = %path.display(), "Opening database");
            let db = Database::open(&path).await.map_err(StoreError::from)?;
            Ok(Stores::shared(db))
        }
    }
}
