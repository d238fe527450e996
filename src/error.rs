use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure opening or operating the per-user embedded store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no storage backend available: {0}")]
    NoBackend(String),
    #[error("store blocked by another connection")]
    Blocked,
    #[error("store open timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage quota exhausted")]
    Quota,
    #[error("storage access denied: {0}")]
    Security(String),
    #[error("store in invalid state: {0}")]
    InvalidState(String),
    #[error("storage error: {0}")]
    Unknown(String),
}

impl StoreError {
    /// Maps an I/O error raised while preparing the data directory.
    pub(crate) fn from_dir_io(err: &io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                StoreError::Security(format!("{}: {err}", path.display()))
            }
            _ => StoreError::NoBackend(format!("{}: {err}", path.display())),
        }
    }

    /// Maps a SQLite error into the store error taxonomy.
    pub(crate) fn from_sqlite(err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(f, _) => match f.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Blocked,
                ErrorCode::DiskFull => StoreError::Quota,
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    StoreError::Security(err.to_string())
                }
                ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt => {
                    StoreError::InvalidState(err.to_string())
                }
                ErrorCode::CannotOpen => StoreError::NoBackend(err.to_string()),
                _ => StoreError::Unknown(err.to_string()),
            },
            _ => StoreError::Unknown(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::from_sqlite(err)
    }
}

/// Transport-level failure talking to the server.
///
/// Protocol-level outcomes (`conflict` on a content upsert, `stale` on a
/// structure snapshot) arrive in 2xx bodies and are modeled as wire enums,
/// not errors.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Connectivity loss, 408, 429, or 5xx. The op stays queued.
    #[error("retryable http failure (status {status:?}): {message}")]
    Retryable {
        status: Option<u16>,
        message: String,
    },
    /// Non-auth 4xx. Replaying would not succeed; the op is dropped.
    #[error("permanent http failure (status {status})")]
    Permanent { status: u16 },
    /// 401/403. Flushing stops until the user re-authenticates.
    #[error("authentication required (status {status})")]
    Auth { status: u16 },
}

impl HttpError {
    /// Classifies an HTTP status per the retry/drop taxonomy.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => HttpError::Auth { status },
            408 | 429 => HttpError::Retryable {
                status: Some(status),
                message: "transient status".into(),
            },
            s if s >= 500 => HttpError::Retryable {
                status: Some(s),
                message: "server error".into(),
            },
            s => HttpError::Permanent { status: s },
        }
    }

    /// True when the failed request may be retried as-is later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HttpError::Retryable { .. })
    }

    /// True when the target vanished (404/410); such ops drop silently.
    pub fn is_gone(&self) -> bool {
        matches!(self, HttpError::Permanent { status: 404 | 410 })
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => HttpError::from_status(status.as_u16()),
            None => HttpError::Retryable {
                status: None,
                message: err.to_string(),
            },
        }
    }
}

/// Umbrella error for engine entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("malformed document: {0}")]
    Doc(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
