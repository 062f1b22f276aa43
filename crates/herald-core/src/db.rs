//! Embedded `SQLite` request store and instance registry.
//!
//! Used for single-host deployments (every poller on one machine pointing at
//! the same database file) and as the store in tests.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::models::{
    Instance, InstancePatch, InstanceStatus, NewRequest, Request, RequestStatus,
};
use crate::store::{InstanceRegistry, RequestStore, StoreError};
use crate::tag;

/// Database errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.into())
    }
}

/// Open (or create) a `SQLite` connection pool at the given file path.
///
/// Creates the parent directory if it does not exist, enables WAL journal
/// mode and sets a 5-second busy timeout so several pollers can share one
/// file.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    info!(path = %path.display(), "Database opened");

    Ok(pool)
}

/// Open an in-memory `SQLite` connection pool (for testing).
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    Ok(pool)
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: i64,
    chat_id: i64,
    user_id: i64,
    username: Option<String>,
    first_name: Option<String>,
    request: String,
    status: String,
    created_at: i64,
    claimed_at: Option<i64>,
    responded_at: Option<i64>,
}

impl TryFrom<RequestRow> for Request {
    type Error = DatabaseError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let status = RequestStatus::parse(&row.status)
            .ok_or_else(|| DatabaseError::Query(format!("unknown request status {}", row.status)))?;
        Ok(Self {
            id: row.id,
            chat_id: row.chat_id,
            user_id: row.user_id,
            username: row.username,
            first_name: row.first_name,
            request: row.request,
            status,
            created_at: from_millis(row.created_at),
            claimed_at: row.claimed_at.map(from_millis),
            responded_at: row.responded_at.map(from_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    name: String,
    role: String,
    channel: String,
    chat_id: Option<i64>,
    status: String,
    connected_at: i64,
    last_seen: i64,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = DatabaseError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let status = InstanceStatus::parse(&row.status).ok_or_else(|| {
            DatabaseError::Query(format!("unknown instance status {}", row.status))
        })?;
        Ok(Self {
            name: row.name,
            role: row.role,
            channel: row.channel,
            chat_id: row.chat_id,
            status,
            connected_at: from_millis(row.connected_at),
            last_seen: from_millis(row.last_seen),
        })
    }
}

/// `SQLite`-backed store.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        let pool = open_pool(path).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let pool = open_pool_in_memory().await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("Database migrations complete");
        Ok(())
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Insert a request with an explicit `created_at`.
    pub async fn insert_request_at(
        &self,
        new: &NewRequest,
        created_at: DateTime<Utc>,
    ) -> Result<Request, StoreError> {
        let id = sqlx::query(
            r"
            INSERT INTO requests (chat_id, user_id, username, first_name, request, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            ",
        )
        .bind(new.chat_id)
        .bind(new.user_id)
        .bind(new.username.as_deref())
        .bind(new.first_name.as_deref())
        .bind(&new.request)
        .bind(to_millis(created_at))
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_request(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Request {id}")))
    }
}

#[async_trait]
impl RequestStore for Database {
    async fn next_pending(&self, instance: &str) -> Result<Option<Request>, StoreError> {
        let row = sqlx::query_as::<_, RequestRow>(
            r"
            SELECT * FROM requests
            WHERE status = 'pending' AND instr(lower(request), lower(?)) > 0
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            ",
        )
        .bind(tag::tag_for(instance))
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(Request::try_from).transpose()?)
    }

    async fn mark_processing(&self, id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE requests SET status = 'processing', claimed_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(to_millis(now))
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(&self, id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE requests SET status = 'completed', responded_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(to_millis(now))
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_request(&self, new: &NewRequest) -> Result<Request, StoreError> {
        self.insert_request_at(new, Utc::now()).await
    }

    async fn reclaim_stale(
        &self,
        instance: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE requests SET status = 'pending', claimed_at = NULL
            WHERE status = 'processing'
              AND claimed_at < ?
              AND instr(lower(request), lower(?)) > 0
            ",
        )
        .bind(to_millis(cutoff))
        .bind(tag::tag_for(instance))
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_request(&self, id: i64) -> Result<Option<Request>, StoreError> {
        let row = sqlx::query_as::<_, RequestRow>("SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(Request::try_from).transpose()?)
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: u32,
    ) -> Result<Vec<Request>, StoreError> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, RequestRow>(
                "SELECT * FROM requests WHERE status = ? ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, RequestRow>(
                "SELECT * FROM requests ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        };

        Ok(rows
            .into_iter()
            .map(Request::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl InstanceRegistry for Database {
    async fn upsert_instance(&self, instance: &Instance) -> Result<Instance, StoreError> {
        sqlx::query(
            r"
            INSERT INTO instances (name, role, channel, chat_id, status, connected_at, last_seen)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                role = excluded.role,
                channel = excluded.channel,
                chat_id = excluded.chat_id,
                status = excluded.status,
                connected_at = excluded.connected_at,
                last_seen = excluded.last_seen
            ",
        )
        .bind(&instance.name)
        .bind(&instance.role)
        .bind(&instance.channel)
        .bind(instance.chat_id)
        .bind(instance.status.as_str())
        .bind(to_millis(instance.connected_at))
        .bind(to_millis(instance.last_seen))
        .execute(self.pool())
        .await?;

        self.get_instance(&instance.name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Instance {}", instance.name)))
    }

    async fn patch_instance(&self, name: &str, patch: &InstancePatch) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE instances SET status = COALESCE(?, status), last_seen = COALESCE(?, last_seen) WHERE name = ?",
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.last_seen.map(to_millis))
        .bind(name)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, StoreError> {
        let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(Instance::try_from).transpose()?)
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let rows = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances ORDER BY name ASC")
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(Instance::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn new_request(text: &str) -> NewRequest {
        NewRequest {
            chat_id: -100,
            user_id: 42,
            username: Some("ada_l".into()),
            first_name: Some("Ada".into()),
            request: text.into(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_225_600 + secs, 0).unwrap()
    }

    // === Request tests ===

    #[tokio::test]
    async fn insert_assigns_id_and_pending_status() {
        let db = test_db().await;
        let req = db.insert_request(&new_request("@coder fix it")).await.unwrap();

        assert!(req.id > 0);
        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(req.chat_id, -100);
        assert!(req.responded_at.is_none());
        assert!(req.claimed_at.is_none());
    }

    #[tokio::test]
    async fn next_pending_is_oldest_tag_match() {
        let db = test_db().await;
        let later = db
            .insert_request_at(&new_request("@ideas second"), at(20))
            .await
            .unwrap();
        let earlier = db
            .insert_request_at(&new_request("@IDEAS first"), at(10))
            .await
            .unwrap();
        db.insert_request_at(&new_request("@coder other"), at(0))
            .await
            .unwrap();

        let next = db.next_pending("ideas").await.unwrap().unwrap();
        assert_eq!(next.id, earlier.id);

        assert!(db.mark_processing(earlier.id, at(30)).await.unwrap());
        let next = db.next_pending("ideas").await.unwrap().unwrap();
        assert_eq!(next.id, later.id);

        assert!(db.next_pending("reviewer").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_filter_agrees_with_tag_matcher() {
        let cases = [
            ("@kai hi", "kai"),
            ("@KAI hi", "kai"),
            ("hey @Kai-2", "kai"),
            ("@\u{212A}ai hi", "kai"),
            ("kai without tag", "kai"),
            ("@coder fix", "code"),
            ("@my_bot go", "my_bot"),
            ("@myxbot go", "my_bot"),
        ];
        for (text, name) in cases {
            let db = test_db().await;
            db.insert_request(&new_request(text)).await.unwrap();
            assert_eq!(
                db.next_pending(name).await.unwrap().is_some(),
                tag::matches(text, name),
                "{text:?} for {name}"
            );
        }
    }

    #[tokio::test]
    async fn same_timestamp_falls_back_to_id_order() {
        let db = test_db().await;
        let a = db.insert_request_at(&new_request("@ideas a"), at(5)).await.unwrap();
        db.insert_request_at(&new_request("@ideas b"), at(5)).await.unwrap();

        assert_eq!(db.next_pending("ideas").await.unwrap().unwrap().id, a.id);
    }

    #[tokio::test]
    async fn claim_is_conditional_on_pending() {
        let db = test_db().await;
        let req = db.insert_request(&new_request("@coder x")).await.unwrap();

        assert!(db.mark_processing(req.id, at(1)).await.unwrap());
        // Second claimant loses.
        assert!(!db.mark_processing(req.id, at(2)).await.unwrap());

        let stored = db.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Processing);
        assert_eq!(stored.claimed_at, Some(at(1)));
    }

    #[tokio::test]
    async fn completion_happens_once_and_only_after_processing() {
        let db = test_db().await;
        let req = db.insert_request(&new_request("@coder x")).await.unwrap();

        // Cannot skip processing.
        assert!(!db.mark_completed(req.id, at(1)).await.unwrap());

        db.mark_processing(req.id, at(1)).await.unwrap();
        assert!(db.mark_completed(req.id, at(2)).await.unwrap());
        assert!(!db.mark_completed(req.id, at(3)).await.unwrap());

        let stored = db.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);
        assert_eq!(stored.responded_at, Some(at(2)));

        // Completed rows never go back to processing.
        assert!(!db.mark_processing(req.id, at(4)).await.unwrap());
    }

    #[tokio::test]
    async fn reclaim_only_touches_old_leases_for_instance() {
        let db = test_db().await;
        let old = db.insert_request(&new_request("@coder old")).await.unwrap();
        let fresh = db.insert_request(&new_request("@coder fresh")).await.unwrap();
        let other = db.insert_request(&new_request("@ideas old")).await.unwrap();
        db.mark_processing(old.id, at(0)).await.unwrap();
        db.mark_processing(fresh.id, at(100)).await.unwrap();
        db.mark_processing(other.id, at(0)).await.unwrap();

        assert_eq!(db.reclaim_stale("coder", at(50)).await.unwrap(), 1);

        let old = db.get_request(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, RequestStatus::Pending);
        assert!(old.claimed_at.is_none());
        assert_eq!(
            db.get_request(fresh.id).await.unwrap().unwrap().status,
            RequestStatus::Processing
        );
        assert_eq!(
            db.get_request(other.id).await.unwrap().unwrap().status,
            RequestStatus::Processing
        );
    }

    #[tokio::test]
    async fn list_requests_filters_by_status() {
        let db = test_db().await;
        let a = db.insert_request_at(&new_request("@coder a"), at(1)).await.unwrap();
        let b = db.insert_request_at(&new_request("@coder b"), at(2)).await.unwrap();
        db.mark_processing(a.id, at(3)).await.unwrap();

        let all = db.list_requests(None, 10).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b.id, a.id]);

        let pending = db
            .list_requests(Some(RequestStatus::Pending), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);

        assert_eq!(db.list_requests(None, 1).await.unwrap().len(), 1);
    }

    // === Instance tests ===

    #[tokio::test]
    async fn upsert_overwrites_existing_instance() {
        let db = test_db().await;
        let first = Instance::starting("coder", "Writes code", "coder", Some(-100), at(0));
        db.upsert_instance(&first).await.unwrap();

        let mut second = Instance::starting("coder", "Reviews code", "cc", None, at(60));
        second.status = InstanceStatus::Online;
        let stored = db.upsert_instance(&second).await.unwrap();

        assert_eq!(stored.role, "Reviews code");
        assert_eq!(stored.channel, "cc");
        assert_eq!(stored.chat_id, None);
        assert_eq!(stored.connected_at, at(60));
        assert_eq!(db.list_instances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn patch_updates_only_given_fields() {
        let db = test_db().await;
        db.upsert_instance(&Instance::starting("coder", "r", "c", None, at(0)))
            .await
            .unwrap();

        db.patch_instance("coder", &InstancePatch::heartbeat(at(30)))
            .await
            .unwrap();
        let inst = db.get_instance("coder").await.unwrap().unwrap();
        assert_eq!(inst.last_seen, at(30));
        assert_eq!(inst.connected_at, at(0));

        db.patch_instance("coder", &InstancePatch::offline())
            .await
            .unwrap();
        let inst = db.get_instance("coder").await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Offline);
        assert_eq!(inst.last_seen, at(30));

        // Patching an unknown name is not an error.
        db.patch_instance("ghost", &InstancePatch::offline())
            .await
            .unwrap();
        assert!(db.get_instance("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_backed_database_persists_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("herald.db");

        {
            let db = Database::open(&path).await.unwrap();
            db.insert_request(&new_request("@coder persisted")).await.unwrap();
        }

        let db = Database::open(&path).await.unwrap();
        let next = db.next_pending("coder").await.unwrap().unwrap();
        assert_eq!(next.request, "@coder persisted");
    }
}
