//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("invalid extension name: {0}")]
    InvalidExtensionName(String),

    #[error("invalid postgres version: {0}")]
    InvalidVersion(String),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
