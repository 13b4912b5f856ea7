//! Error types shared across the sync engine.

use thiserror::Error;

/// Failure talking to the remote catalog API.
///
/// HTTP rejections (status >= 400) are *not* errors at this level: the
/// client returns them as a [`crate::api::RemoteResponse`] so the response
/// handler can decide what to do. Only failures where no usable response
/// exists end up here.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("cannot reach catalog API at {0}")]
    Connect(String),
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("network error communicating with {url}: {message}")]
    Transport { url: String, message: String },
    #[error("catalog API returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response from catalog API: {0}")]
    Malformed(String),
    #[error("invalid catalog API configuration: {0}")]
    Config(String),
}

impl RemoteError {
    /// HTTP status to record for a request that failed this way.
    ///
    /// Transport failures have no status; they are reported as 0, which the
    /// response handler treats like any other failure.
    pub fn status(&self) -> u16 {
        match self {
            RemoteError::Status { status, .. } => *status,
            _ => 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
    #[error("{kind} {id} has no remote id")]
    MissingRemoteId { kind: &'static str, id: i64 },
    #[error("inconsistent catalog data: {0}")]
    Inconsistent(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned
    }
}
