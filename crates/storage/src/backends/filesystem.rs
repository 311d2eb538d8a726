//! Local filesystem storage backend.
//!
//! Mirrors a bucket as a directory tree. Objects have no native ETag, so the
//! SHA-256 of the content stands in for one.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ObjectData, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use pgext_core::{ContentHash, Fingerprint};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::instrument;

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key to a path under the root.
    ///
    /// Runs on the blocking pool since it stats and canonicalizes.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || resolve_key(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }
}

/// Map `key` to `root/key`, rejecting anything that could leave the root,
/// including through symlinks in already existing ancestors.
fn resolve_key(root: &Path, key: &str) -> StorageResult<PathBuf> {
    let trimmed = key.trim_end_matches('/');
    if key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(format!(
            "key must be relative: {key}"
        )));
    }
    if Path::new(trimmed)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "unsafe path component in key: {key}"
        )));
    }

    let path = root.join(trimmed);
    let root_canonical = root.canonicalize()?;

    // The deepest existing ancestor (or the path itself) decides where we land.
    let mut probe = path.as_path();
    loop {
        match std::fs::symlink_metadata(probe) {
            Ok(_) => {
                let canonical = probe.canonicalize().map_err(|_| {
                    StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match probe.parent() {
                Some(parent) => probe = parent,
                None => return Ok(path),
            },
            Err(e) => return Err(StorageError::Io(e)),
        }
    }
}

fn map_read_error(e: std::io::Error, key: &str) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

fn content_etag(data: &[u8]) -> Fingerprint {
    Fingerprint::ETag(ContentHash::compute(data).to_hex())
}

/// Temp files written by `put` are dot-prefixed and never listed.
fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(|e| map_read_error(e, key))?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            etag: Some(content_etag(&data)),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<ObjectData> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(|e| map_read_error(e, key))?;
        let etag = content_etag(&data);
        Ok(ObjectData {
            bytes: Bytes::from(data),
            etag: Some(etag),
        })
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(format!("key has no parent: {key}")))?
            .to_path_buf();

        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            std::fs::create_dir_all(&parent)?;
            let mut temp = tempfile::Builder::new()
                .prefix(".put.")
                .suffix(".tmp")
                .tempfile_in(&parent)?;
            temp.write_all(&data)?;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))?
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // A prefix that doesn't end in '/' may name a partial file name, so
        // walk its directory and filter.
        let dir_key = prefix.rfind('/').map_or("", |idx| &prefix[..idx]);
        let base = if dir_key.is_empty() {
            self.root.clone()
        } else {
            self.key_path(dir_key).await?
        };

        let mut results = Vec::new();
        match fs::try_exists(&base).await {
            Ok(true) => {}
            Ok(false) => return Ok(results),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if is_hidden(&entry.file_name()) {
                    continue;
                }
                let path = entry.path();
                // file_type() doesn't follow symlinks; those are skipped.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        results.push(key);
                    }
                }
            }
        }

        results.sort();
        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}
