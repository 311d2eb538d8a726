//! Local cache store: installed extension files and their state.
//!
//! Files live at `{root}/{pg_major}/{extension}/{file_name}`. Every write goes
//! to a dot-prefixed temp file in the same directory, is fsynced and verified,
//! and only then renamed over the final path, so a reader sees either nothing
//! or a complete file.

use crate::error::CacheError;
use bytes::Bytes;
use dashmap::DashMap;
use pgext_core::{ExtensionName, Fingerprint, PgMajorVersion, RemoteObjectKey};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Suffix of in-progress writes. Files with it are never reported as Present.
const TEMP_SUFFIX: &str = ".tmp";

/// Lifecycle of one cached file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Missing,
    Fetching,
    Present,
    Failed,
}

/// State of one (version, extension, file) slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub state: CacheState,
    /// Remote key this file was installed from. `None` for files found by
    /// [`LocalCacheStore::recover`].
    pub key: Option<RemoteObjectKey>,
    /// Remote fingerprint recorded at install time (the ETag when the store
    /// returned one, else the expected fingerprint).
    pub fingerprint: Option<Fingerprint>,
    /// Requests currently waiting on a fetch for this slot.
    pub waiters: usize,
}

impl CacheEntry {
    fn missing(path: PathBuf) -> Self {
        Self {
            path,
            state: CacheState::Missing,
            key: None,
            fingerprint: None,
            waiters: 0,
        }
    }

    pub fn is_present(&self) -> bool {
        self.state == CacheState::Present
    }
}

/// Slots are keyed by file name: it is unique within an extension and is what
/// the on-disk layout records.
type SlotId = (PgMajorVersion, ExtensionName, String);

/// What [`LocalCacheStore::recover`] found on disk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub present: usize,
    pub removed_temp_files: usize,
}

/// Filesystem-backed table of installed files.
pub struct LocalCacheStore {
    root: PathBuf,
    entries: DashMap<SlotId, CacheEntry>,
}

impl std::fmt::Debug for LocalCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCacheStore")
            .field("root", &self.root)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl LocalCacheStore {
    /// Open a cache rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| CacheError::io(&root, e))?;
        Ok(Self {
            root,
            entries: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path of a file: `{root}/{pg_major}/{extension}/{file_name}`.
    pub fn path_for(
        &self,
        version: PgMajorVersion,
        extension: &ExtensionName,
        key: &RemoteObjectKey,
    ) -> PathBuf {
        self.extension_dir(version, extension).join(key.file_name())
    }

    fn extension_dir(&self, version: PgMajorVersion, extension: &ExtensionName) -> PathBuf {
        self.root.join(version.as_dir()).join(extension.as_str())
    }

    fn slot(version: PgMajorVersion, extension: &ExtensionName, key: &RemoteObjectKey) -> SlotId {
        (version, extension.clone(), key.file_name().to_string())
    }

    /// Current state of a slot; `Missing` if never seen.
    pub fn lookup(
        &self,
        version: PgMajorVersion,
        extension: &ExtensionName,
        key: &RemoteObjectKey,
    ) -> CacheEntry {
        match self.entries.get(&Self::slot(version, extension, key)) {
            Some(entry) => entry.clone(),
            None => CacheEntry::missing(self.path_for(version, extension, key)),
        }
    }

    /// A Present copy of `key` installed for any extension at `version`.
    pub fn find_present(
        &self,
        version: PgMajorVersion,
        key: &RemoteObjectKey,
    ) -> Option<(ExtensionName, CacheEntry)> {
        self.entries.iter().find_map(|item| {
            let (v, ext, _) = item.key();
            let entry = item.value();
            (*v == version && entry.is_present() && entry.key.as_ref() == Some(key))
                .then(|| (ext.clone(), entry.clone()))
        })
    }

    fn update<F>(&self, version: PgMajorVersion, extension: &ExtensionName, key: &RemoteObjectKey, f: F)
    where
        F: FnOnce(&mut CacheEntry),
    {
        let mut entry = self
            .entries
            .entry(Self::slot(version, extension, key))
            .or_insert_with(|| CacheEntry::missing(self.path_for(version, extension, key)));
        f(&mut entry);
    }

    pub fn mark_fetching(&self, version: PgMajorVersion, extension: &ExtensionName, key: &RemoteObjectKey) {
        self.update(version, extension, key, |e| {
            if e.state != CacheState::Present {
                e.state = CacheState::Fetching;
            }
        });
    }

    pub fn mark_failed(&self, version: PgMajorVersion, extension: &ExtensionName, key: &RemoteObjectKey) {
        self.update(version, extension, key, |e| {
            if e.state != CacheState::Present {
                e.state = CacheState::Failed;
            }
        });
    }

    /// Return a Fetching slot to Missing after its fetch was cancelled.
    pub fn mark_missing(&self, version: PgMajorVersion, extension: &ExtensionName, key: &RemoteObjectKey) {
        self.update(version, extension, key, |e| {
            if e.state == CacheState::Fetching {
                e.state = CacheState::Missing;
            }
        });
    }

    pub fn attach_waiter(&self, version: PgMajorVersion, extension: &ExtensionName, key: &RemoteObjectKey) {
        self.update(version, extension, key, |e| e.waiters += 1);
    }

    pub fn detach_waiter(&self, version: PgMajorVersion, extension: &ExtensionName, key: &RemoteObjectKey) {
        self.update(version, extension, key, |e| e.waiters = e.waiters.saturating_sub(1));
    }

    /// Forget that a file is Present so the next request fetches it again.
    ///
    /// The file stays on disk until a new install replaces it.
    pub fn invalidate(&self, version: PgMajorVersion, extension: &ExtensionName, key: &RemoteObjectKey) {
        if let Some(mut entry) = self.entries.get_mut(&Self::slot(version, extension, key))
            && entry.state == CacheState::Present
        {
            debug!(%version, %extension, key = %key, "Invalidating cached file");
            entry.state = CacheState::Missing;
        }
    }

    /// Atomically install `data` as the file for `key`.
    ///
    /// `expected` is checked against the content (SHA-256) or against
    /// `remote_etag` (ETag) after the temp file is synced and before it is
    /// renamed. On any error the temp file is removed and the final path is
    /// left untouched.
    #[instrument(skip(self, key, data, expected, remote_etag), fields(key = %key, size = data.len()))]
    pub async fn install(
        &self,
        version: PgMajorVersion,
        extension: &ExtensionName,
        key: &RemoteObjectKey,
        data: Bytes,
        expected: Option<&Fingerprint>,
        remote_etag: Option<Fingerprint>,
    ) -> Result<CacheEntry, CacheError> {
        let path = self.path_for(version, extension, key);
        let recorded = remote_etag.clone().or_else(|| expected.cloned());
        let expected = expected.cloned();

        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            write_atomically(&target, &data, |data| match &expected {
                Some(fp) => fp.verify(data, remote_etag.as_ref()).map_err(|e| match e {
                    pgext_core::Error::FingerprintMismatch { expected, actual } => {
                        CacheError::FingerprintMismatch { expected, actual }
                    }
                    other => CacheError::FingerprintMismatch {
                        expected: fp.to_string(),
                        actual: other.to_string(),
                    },
                }),
                None => Ok(()),
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))
        .and_then(|r| r);

        match written {
            Ok(()) => {
                let mut result = None;
                self.update(version, extension, key, |e| {
                    e.state = CacheState::Present;
                    e.key = Some(key.clone());
                    e.fingerprint = recorded;
                    result = Some(e.clone());
                });
                debug!(path = %path.display(), "Installed file");
                Ok(result.unwrap_or_else(|| CacheEntry::missing(path)))
            }
            Err(e) => {
                self.mark_failed(version, extension, key);
                Err(e)
            }
        }
    }

    /// Install `key` for `extension` by copying another extension's Present copy.
    pub async fn install_from_local(
        &self,
        version: PgMajorVersion,
        extension: &ExtensionName,
        key: &RemoteObjectKey,
        source: &CacheEntry,
        expected: Option<&Fingerprint>,
    ) -> Result<CacheEntry, CacheError> {
        let data = tokio::fs::read(&source.path)
            .await
            .map_err(|e| CacheError::io(&source.path, e))?;
        self.install(
            version,
            extension,
            key,
            Bytes::from(data),
            expected,
            source.fingerprint.clone(),
        )
        .await
    }

    /// Scan the cache root after a restart.
    ///
    /// Removes temp files left behind by an interrupted install and registers
    /// every complete file as Present with an unknown fingerprint.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn recover(&self) -> Result<RecoveryReport, CacheError> {
        let root = self.root.clone();
        let found = tokio::task::spawn_blocking(move || scan_cache_root(&root))
            .await
            .map_err(|e| CacheError::Join(e.to_string()))??;

        let mut report = RecoveryReport {
            removed_temp_files: found.removed_temp_files,
            ..RecoveryReport::default()
        };
        for (version, extension, file_name, path) in found.files {
            let slot = (version, extension, file_name);
            self.entries.entry(slot).or_insert_with(|| {
                report.present += 1;
                CacheEntry {
                    path,
                    state: CacheState::Present,
                    key: None,
                    fingerprint: None,
                    waiters: 0,
                }
            });
        }

        info!(
            present = report.present,
            removed_temp_files = report.removed_temp_files,
            "Recovered local extension cache"
        );
        Ok(report)
    }
}

/// Write `data` to a temp file next to `path`, sync it, run `verify`, then
/// rename it into place. The temp file is deleted on every error path.
fn write_atomically<F>(path: &Path, data: &[u8], verify: F) -> Result<(), CacheError>
where
    F: FnOnce(&[u8]) -> Result<(), CacheError>,
{
    let dir = path
        .parent()
        .ok_or_else(|| CacheError::io(path, std::io::Error::other("path has no parent")))?;
    std::fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| CacheError::io(dir, e))?;

    temp.write_all(data)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| CacheError::io(temp.path(), e))?;

    verify(data)?;

    temp.persist(path)
        .map_err(|e| CacheError::io(path, e.error))?;

    // Make the rename itself durable.
    if let Ok(dir_handle) = std::fs::File::open(dir)
        && let Err(e) = dir_handle.sync_all()
    {
        warn!(dir = %dir.display(), error = %e, "Failed to sync cache directory");
    }
    Ok(())
}

struct ScannedRoot {
    files: Vec<(PgMajorVersion, ExtensionName, String, PathBuf)>,
    removed_temp_files: usize,
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Walk `{root}/{version}/{extension}/`. Directories that aren't a valid
/// version or extension name are ignored.
fn scan_cache_root(root: &Path) -> Result<ScannedRoot, CacheError> {
    let mut scanned = ScannedRoot {
        files: Vec::new(),
        removed_temp_files: 0,
    };

    for version_dir in read_dir(root)? {
        let Some(version) = dir_name(&version_dir).and_then(|n| n.parse::<PgMajorVersion>().ok())
        else {
            continue;
        };
        for ext_dir in read_dir(&version_dir)? {
            let Some(extension) = dir_name(&ext_dir).and_then(|n| ExtensionName::new(n).ok())
            else {
                continue;
            };
            let entries = std::fs::read_dir(&ext_dir).map_err(|e| CacheError::io(&ext_dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| CacheError::io(&ext_dir, e))?;
                let path = entry.path();
                let file_type = entry.file_type().map_err(|e| CacheError::io(&path, e))?;
                if !file_type.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_temp_file(&name) {
                    match std::fs::remove_file(&path) {
                        Ok(()) => {
                            debug!(path = %path.display(), "Removed stale temp file");
                            scanned.removed_temp_files += 1;
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Failed to remove stale temp file")
                        }
                    }
                    continue;
                }
                scanned
                    .files
                    .push((version, extension.clone(), name, path));
            }
        }
    }
    Ok(scanned)
}

/// Subdirectories of `dir`; empty if it doesn't exist.
fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io(dir, e)),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}
