//! `PostgREST` request store and instance registry.
//!
//! Talks to a hosted relational store through its REST interface (for
//! example a Supabase project's `/rest/v1` root). Every state transition is
//! a conditional `PATCH` whose filter includes the expected current status;
//! `Prefer: return=representation` makes the server echo the rows it
//! changed, so an empty array means the condition did not hold.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::models::{Instance, InstancePatch, NewRequest, Request, RequestStatus};
use crate::store::{InstanceRegistry, RequestStore, StoreError};
use crate::tag;

/// `PostgREST` client errors.
#[derive(Debug, Error)]
pub enum RestError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store returned no rows for {0}")]
    EmptyResponse(String),
}

/// Connection settings for a `PostgREST` endpoint.
#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    /// REST root, e.g. `https://<project>.supabase.co/rest/v1`.
    pub base_url: String,
    /// Service key sent as both `apikey` and bearer token.
    pub api_key: String,
    pub requests_table: String,
    pub instances_table: String,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl PostgrestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            requests_table: "herald_requests".into(),
            instances_table: "herald_instances".into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct StatusChange {
    status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    responded_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct Reclaim {
    status: RequestStatus,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct PendingInsert<'a> {
    #[serde(flatten)]
    request: &'a NewRequest,
    status: RequestStatus,
}

/// `PostgREST`-backed store.
#[derive(Debug, Clone)]
pub struct PostgrestClient {
    http: reqwest::Client,
    base_url: Url,
    requests_table: String,
    instances_table: String,
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl PostgrestClient {
    pub fn new(config: &PostgrestConfig) -> Result<Self, RestError> {
        if config.base_url.is_empty() {
            return Err(RestError::Config("base_url is empty".into()));
        }
        if config.api_key.is_empty() {
            return Err(RestError::Config("api_key is empty".into()));
        }

        // Url::join drops the last path segment unless it ends with '/'.
        let base_url = Url::parse(&format!("{}/", config.base_url.trim_end_matches('/')))
            .map_err(|e| RestError::Config(format!("invalid base_url: {e}")))?;

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|_| RestError::Config("Invalid api key format".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| RestError::Config("Invalid api key format".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        // reqwest is built with rustls-no-provider; Err means a provider is
        // already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url,
            requests_table: config.requests_table.clone(),
            instances_table: config.instances_table.clone(),
        })
    }

    /// URL of a table with the given query pairs appended.
    pub(crate) fn table_url(&self, table: &str, query: &[(&str, String)]) -> Result<Url, RestError> {
        let mut url = self
            .base_url
            .join(table)
            .map_err(|e| RestError::Config(format!("invalid table {table}: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    pub(crate) fn pending_query(instance: &str) -> Vec<(&'static str, String)> {
        vec![
            ("select", "*".into()),
            ("status", "eq.pending".into()),
            ("request", format!("ilike.{}", tag::ilike_operand(instance))),
            ("order", "created_at.asc,id.asc".into()),
            ("limit", "1".into()),
        ]
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, RestError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("Unknown").to_string()
        } else {
            body
        };
        Err(RestError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>, RestError> {
        let resp = self.http.get(url).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Send `body` and return the rows the server reports as written.
    async fn write<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        prefer: &str,
        body: &B,
    ) -> Result<Vec<T>, RestError> {
        let resp = self
            .http
            .request(method, url)
            .header("Prefer", prefer)
            .json(body)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn transition(
        &self,
        id: i64,
        from: RequestStatus,
        change: &StatusChange,
    ) -> Result<bool, RestError> {
        let url = self.table_url(
            &self.requests_table,
            &[
                ("id", format!("eq.{id}")),
                ("status", format!("eq.{from}")),
            ],
        )?;
        let rows: Vec<Request> = self
            .write(Method::PATCH, url, "return=representation", change)
            .await?;
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl RequestStore for PostgrestClient {
    async fn next_pending(&self, instance: &str) -> Result<Option<Request>, StoreError> {
        let url = self.table_url(&self.requests_table, &Self::pending_query(instance))?;
        let rows: Vec<Request> = self.fetch(url).await?;
        Ok(rows.into_iter().next())
    }

    async fn mark_processing(&self, id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let change = StatusChange {
            status: RequestStatus::Processing,
            claimed_at: Some(now),
            responded_at: None,
        };
        Ok(self.transition(id, RequestStatus::Pending, &change).await?)
    }

    async fn mark_completed(&self, id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let change = StatusChange {
            status: RequestStatus::Completed,
            claimed_at: None,
            responded_at: Some(now),
        };
        Ok(self.transition(id, RequestStatus::Processing, &change).await?)
    }

    async fn insert_request(&self, new: &NewRequest) -> Result<Request, StoreError> {
        let url = self.table_url(&self.requests_table, &[])?;
        let body = PendingInsert {
            request: new,
            status: RequestStatus::Pending,
        };
        let rows: Vec<Request> = self
            .write(Method::POST, url, "return=representation", &body)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RestError::EmptyResponse("request insert".into()).into())
    }

    async fn reclaim_stale(
        &self,
        instance: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let url = self.table_url(
            &self.requests_table,
            &[
                ("status", "eq.processing".into()),
                ("claimed_at", format!("lt.{}", iso(cutoff))),
                ("request", format!("ilike.{}", tag::ilike_operand(instance))),
            ],
        )?;
        let body = Reclaim {
            status: RequestStatus::Pending,
            claimed_at: None,
        };
        let rows: Vec<Request> = self
            .write(Method::PATCH, url, "return=representation", &body)
            .await?;
        Ok(rows.len() as u64)
    }

    async fn get_request(&self, id: i64) -> Result<Option<Request>, StoreError> {
        let url = self.table_url(
            &self.requests_table,
            &[("id", format!("eq.{id}")), ("limit", "1".into())],
        )?;
        let rows: Vec<Request> = self.fetch(url).await?;
        Ok(rows.into_iter().next())
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: u32,
    ) -> Result<Vec<Request>, StoreError> {
        let mut query = vec![
            ("order", "created_at.desc,id.desc".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(status) = status {
            query.push(("status", format!("eq.{status}")));
        }
        let url = self.table_url(&self.requests_table, &query)?;
        Ok(self.fetch(url).await?)
    }
}

#[async_trait]
impl InstanceRegistry for PostgrestClient {
    async fn upsert_instance(&self, instance: &Instance) -> Result<Instance, StoreError> {
        let url = self.table_url(&self.instances_table, &[("on_conflict", "name".into())])?;
        let rows: Vec<Instance> = self
            .write(
                Method::POST,
                url,
                "resolution=merge-duplicates,return=representation",
                instance,
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RestError::EmptyResponse("instance upsert".into()).into())
    }

    async fn patch_instance(&self, name: &str, patch: &InstancePatch) -> Result<(), StoreError> {
        let url = self.table_url(&self.instances_table, &[("name", format!("eq.{name}"))])?;
        let resp = self
            .http
            .patch(url)
            .header("Prefer", "return=minimal")
            .json(patch)
            .send()
            .await
            .map_err(RestError::from)?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, StoreError> {
        let url = self.table_url(
            &self.instances_table,
            &[("name", format!("eq.{name}")), ("limit", "1".into())],
        )?;
        let rows: Vec<Instance> = self.fetch(url).await?;
        Ok(rows.into_iter().next())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let url = self.table_url(&self.instances_table, &[("order", "name.asc".into())])?;
        Ok(self.fetch(url).await?)
    }
}
