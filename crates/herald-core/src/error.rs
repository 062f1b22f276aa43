//! Error types for Herald core library.

use thiserror::Error;

/// Result type alias using Herald Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Herald operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid instance name
    #[error("Invalid instance name {name:?}: {reason}")]
    InvalidInstanceName { name: String, reason: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Store backend could not be opened
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}
