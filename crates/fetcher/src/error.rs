//! Error types for the fetch pipeline.

use pgext_core::RemoteObjectKey;
use pgext_storage::{FetchError, StorageError};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Classification reported to callers for a failed key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The object does not exist remotely. Never retried.
    NotFound,
    /// Remote failure that outlasted the retry budget.
    TransientRemote,
    /// Downloaded content didn't match the expected fingerprint twice.
    FingerprintMismatch,
    /// Writing to the local cache failed.
    LocalIo,
    /// The caller stopped waiting. The fetch may still complete.
    Timeout,
    AccessDenied,
    InvalidKey,
    /// The remote rejected the request for a reason other than the above,
    /// such as a bad request or a misconfigured client. Never retried.
    PermanentRemote,
    /// Every waiter detached and the fetch was cancelled.
    Aborted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::TransientRemote => "transient_remote",
            Self::FingerprintMismatch => "fingerprint_mismatch",
            Self::LocalIo => "local_io",
            Self::Timeout => "timeout",
            Self::AccessDenied => "access_denied",
            Self::InvalidKey => "invalid_key",
            Self::PermanentRemote => "permanent_remote",
            Self::Aborted => "aborted",
        }
    }

    /// Whether the failure is a property of the remote object rather than of
    /// one extension's local directory or expected fingerprint.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::TransientRemote | Self::AccessDenied | Self::PermanentRemote
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed request for one key. Cloned to every waiter of the fetch.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind} for {key} after {attempts} attempt(s): {message}")]
pub struct DownloadError {
    pub kind: ErrorKind,
    pub key: RemoteObjectKey,
    /// Remote attempts spent on the fetch that produced this error.
    pub attempts: u32,
    pub message: String,
}

impl DownloadError {
    pub fn new(
        kind: ErrorKind,
        key: RemoteObjectKey,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            key,
            attempts,
            message: message.into(),
        }
    }

    pub fn from_fetch(key: &RemoteObjectKey, err: FetchError) -> Self {
        let kind = match &err.source {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::AccessDenied(_) => ErrorKind::AccessDenied,
            StorageError::InvalidKey(_) => ErrorKind::InvalidKey,
            StorageError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::AccessDenied
            }
            source if source.is_transient() => ErrorKind::TransientRemote,
            _ => ErrorKind::PermanentRemote,
        };
        Self::new(kind, key.clone(), err.attempts, err.source.to_string())
    }

    pub fn from_cache(key: &RemoteObjectKey, attempts: u32, err: CacheError) -> Self {
        let kind = match err {
            CacheError::FingerprintMismatch { .. } => ErrorKind::FingerprintMismatch,
            _ => ErrorKind::LocalIo,
        };
        Self::new(kind, key.clone(), attempts, err.to_string())
    }

    pub fn timeout(key: &RemoteObjectKey, waited: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            key.clone(),
            0,
            format!("gave up waiting after {}ms", waited.as_millis()),
        )
    }

    pub fn aborted(key: &RemoteObjectKey) -> Self {
        Self::new(ErrorKind::Aborted, key.clone(), 0, "fetch cancelled")
    }
}


/// Local cache store errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("blocking task failed: {0}")]
    Join(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors while assembling the pipeline from configuration.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] pgext_core::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("remote error: {0}")]
    Fetch(#[from] FetchError),
}

/// Result type alias for pipeline construction.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RemoteObjectKey {
        RemoteObjectKey::new("v15/lib/test_ext.so").unwrap()
    }

    #[test]
    fn classifies_fetch_errors() {
        let cases = [
            (StorageError::NotFound("k".into()), ErrorKind::NotFound),
            (StorageError::AccessDenied("k".into()), ErrorKind::AccessDenied),
            (StorageError::InvalidKey("k".into()), ErrorKind::InvalidKey),
            (StorageError::Transient("503".into()), ErrorKind::TransientRemote),
            (
                StorageError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow")),
                ErrorKind::TransientRemote,
            ),
            (StorageError::Config("bad endpoint".into()), ErrorKind::PermanentRemote),
            (StorageError::S3("HTTP 400".into()), ErrorKind::PermanentRemote),
            (
                StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad")),
                ErrorKind::PermanentRemote,
            ),
        ];
        for (source, expected) in cases {
            let err = DownloadError::from_fetch(&key(), FetchError {
                operation: "GET",
                key: key().to_string(),
                attempts: 2,
                source,
            });
            assert_eq!(err.kind, expected);
            assert_eq!(err.attempts, 2);
        }
    }

    #[test]
    fn classifies_cache_errors() {
        let mismatch = DownloadError::from_cache(&key(), 1, CacheError::FingerprintMismatch {
            expected: "a".into(),
            actual: "b".into(),
        });
        assert_eq!(mismatch.kind, ErrorKind::FingerprintMismatch);

        let io = DownloadError::from_cache(
            &key(),
            1,
            CacheError::io("/tmp/x", std::io::Error::other("disk full")),
        );
        assert_eq!(io.kind, ErrorKind::LocalIo);
        assert!(io.to_string().contains("local_io"));
    }

    #[test]
    fn only_remote_kinds_are_remote() {
        assert!(ErrorKind::NotFound.is_remote());
        assert!(ErrorKind::PermanentRemote.is_remote());
        assert!(!ErrorKind::FingerprintMismatch.is_remote());
        assert!(!ErrorKind::LocalIo.is_remote());
        assert!(!ErrorKind::Aborted.is_remote());
    }
}
