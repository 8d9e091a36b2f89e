//! Error types shared by the store contract and the sync layer.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionState;

/// Result type for [`crate::store::RemoteStore`] operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures reported by a remote store implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Network(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("store rejected request: {0}")]
    Rejected(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(format!("serialization error: {err}"))
    }
}

/// Result type for cache, reconciler and session operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failures surfaced to consumers of the sync layer.
///
/// Cloneable so a single in-flight load can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("remote store is not configured (missing or placeholder credentials)")]
    NotConfigured,

    #[error("remote store is not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("no active user; sign in first")]
    NoActiveUser,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("invalid entry: {0}")]
    Invalid(String),

    #[error("store rejected request: {0}")]
    Rejected(String),
}

impl SyncError {
    /// True for failures that mean the store could not be reached at all.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Network(msg) => Self::Network(msg),
            StoreError::Unauthorized(msg) => Self::Unauthorized(msg),
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::Rejected(msg) | StoreError::Backend(msg) => Self::Rejected(msg),
        }
    }
}
