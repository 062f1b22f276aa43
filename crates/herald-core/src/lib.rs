//! Herald Core Library
//!
//! Shared functionality for Herald components:
//! - Request and instance models
//! - `@name` tag routing
//! - Request store / instance registry traits with `SQLite` and `PostgREST` backends
//! - Chat transport (Telegram Bot API)
//! - Configuration resolution and tracing setup

pub mod chat;
pub mod config;
pub mod db;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod models;
pub mod rest;
pub mod store;
pub mod tag;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{Instance, InstanceStatus, NewRequest, Request, RequestStatus};
pub use store::{InstanceRegistry, RequestStore, StoreError, Stores, open_store};
