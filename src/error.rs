//! Error types
//!
//! `CacheStorageError` is the error every public cache operation resolves to.
//! `BackendError` is produced by the entry store underneath and is folded into
//! `CacheStorageError` at the engine boundary.

use std::fmt;
use thiserror::Error;

/// Errors delivered to the caller of a cache operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStorageError {
    /// No matching entry (Match, Delete, stale WriteSideData)
    NotFound,
    /// The write would grow usage past the origin's quota
    QuotaExceeded,
    /// Backend create/open/read/write failure
    Storage(String),
    /// The cache has been closed, or its backend failed to open
    Closed,
    /// Malformed request, e.g. a batch that mixes operation types
    Invalid(String),
    /// Materialized query results exceed the configured size cap
    QueryTooLarge,
}

/// Fieldless discriminant of `CacheStorageError`, for comparing outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    QuotaExceeded,
    Storage,
    Closed,
    Invalid,
    QueryTooLarge,
}

impl CacheStorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheStorageError::NotFound => ErrorKind::NotFound,
            CacheStorageError::QuotaExceeded => ErrorKind::QuotaExceeded,
            CacheStorageError::Storage(_) => ErrorKind::Storage,
            CacheStorageError::Closed => ErrorKind::Closed,
            CacheStorageError::Invalid(_) => ErrorKind::Invalid,
            CacheStorageError::QueryTooLarge => ErrorKind::QueryTooLarge,
        }
    }

    pub(crate) fn storage(msg: impl Into<String>) -> Self {
        CacheStorageError::Storage(msg.into())
    }
}

impl fmt::Display for CacheStorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStorageError::NotFound => write!(f, "Cache entry not found"),
            CacheStorageError::QuotaExceeded => write!(f, "Quota exceeded"),
            CacheStorageError::Storage(msg) => write!(f, "Storage error: {}", msg),
            CacheStorageError::Closed => write!(f, "Cache is closed"),
            CacheStorageError::Invalid(msg) => write!(f, "Invalid operation: {}", msg),
            CacheStorageError::QueryTooLarge => write!(f, "Query result too large"),
        }
    }
}

impl std::error::Error for CacheStorageError {}

impl From<rmp_serde::encode::Error> for CacheStorageError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CacheStorageError::Storage(format!("metadata encoding failed: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for CacheStorageError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CacheStorageError::Storage(format!("metadata decoding failed: {}", err))
    }
}

/// Errors raised by an entry backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entry already exists: {0}")]
    EntryExists(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Short write: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: usize, written: usize },

    #[error("Backend unavailable")]
    Unavailable,
}

impl From<BackendError> for CacheStorageError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::EntryNotFound(_) => CacheStorageError::NotFound,
            other => CacheStorageError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_variant_has_distinct_kind() {
        let errors = [
            CacheStorageError::NotFound,
            CacheStorageError::QuotaExceeded,
            CacheStorageError::Storage("disk".to_string()),
            CacheStorageError::Closed,
            CacheStorageError::Invalid("mixed".to_string()),
            CacheStorageError::QueryTooLarge,
        ];
        let kinds: std::collections::HashSet<ErrorKind> =
            errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_display_messages() {
        assert!(CacheStorageError::NotFound.to_string().contains("not found"));
        assert!(CacheStorageError::Closed.to_string().contains("closed"));
        let err = CacheStorageError::Storage("write failed".to_string());
        assert_eq!(err.to_string(), "Storage error: write failed");
    }

    #[test]
    fn test_backend_not_found_maps_to_not_found() {
        let err: CacheStorageError = BackendError::EntryNotFound("k".to_string()).into();
        assert_eq!(err, CacheStorageError::NotFound);
    }

    #[test]
    fn test_backend_io_maps_to_storage() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CacheStorageError = BackendError::from(io_err).into();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_cache_storage_error_implements_error_trait() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<CacheStorageError>();
        assert_error::<BackendError>();
    }
}
