//! Remote object store access for the extension fetcher.
//!
//! This crate provides:
//! - The `ObjectStore` abstraction with S3 and local filesystem backends
//! - Transient/permanent error classification
//! - `FetchClient`, which applies an explicit `RetryPolicy` to store calls

pub mod backends;
pub mod error;
pub mod fetch;
pub mod retry;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use fetch::{FetchClient, FetchError, Fetched};
pub use retry::{Backoff, RetryPolicy};
pub use traits::{ObjectData, ObjectMeta, ObjectStore};

use pgext_core::RemoteExtConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &RemoteExtConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate()?;

    match config {
        RemoteExtConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        RemoteExtConfig::S3 {
            bucket,
            region,
            endpoint,
            prefix,
            force_path_style,
            access_key_id,
            secret_access_key,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}
