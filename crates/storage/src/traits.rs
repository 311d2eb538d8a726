//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use pgext_core::Fingerprint;

/// Read-mostly object store holding extension files.
///
/// Keys are `/`-separated and relative to the backend's root or prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content and the ETag of the version returned.
    async fn get(&self, key: &str) -> StorageResult<ObjectData>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// List object keys with a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Get the name of this storage backend.
    ///
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// ETag of the current version (if the backend reports one).
    pub etag: Option<Fingerprint>,
}

/// Content of a stored object.
#[derive(Clone, Debug)]
pub struct ObjectData {
    pub bytes: Bytes,
    /// ETag of the version these bytes belong to.
    pub etag: Option<Fingerprint>,
}
