//! Extension manifest: which remote objects make up each extension.

use crate::fingerprint::Fingerprint;
use crate::key::{ExtensionName, PgMajorVersion, RemoteObjectKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// One remote object belonging to an extension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Remote object key.
    pub key: RemoteObjectKey,
    /// Expected fingerprint of the object, if the catalog publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl ManifestFile {
    /// A file without a published fingerprint.
    pub fn new(key: RemoteObjectKey) -> Self {
        Self {
            key,
            fingerprint: None,
        }
    }

    /// A file with an expected fingerprint.
    pub fn with_fingerprint(key: RemoteObjectKey, fingerprint: Fingerprint) -> Self {
        Self {
            key,
            fingerprint: Some(fingerprint),
        }
    }
}

/// The ordered set of remote objects for one extension at one postgres version.
///
/// The control descriptor always comes first, followed by library and data files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: ExtensionName,
    pub version: PgMajorVersion,
    pub files: Vec<ManifestFile>,
}

impl ManifestEntry {
    /// Create a manifest entry, validating its file list.
    pub fn new(
        name: ExtensionName,
        version: PgMajorVersion,
        files: Vec<ManifestFile>,
    ) -> crate::Result<Self> {
        let entry = Self {
            name,
            version,
            files,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// Check the entry invariants.
    ///
    /// Files share one local directory, so their final key segments must be unique.
    pub fn validate(&self) -> crate::Result<()> {
        let Some(first) = self.files.first() else {
            return Err(crate::Error::Manifest(format!(
                "extension {} ({}) has no files",
                self.name, self.version
            )));
        };
        if !first.key.is_control_file() {
            return Err(crate::Error::Manifest(format!(
                "extension {} ({}): first file must be the .control descriptor, got {}",
                self.name, self.version, first.key
            )));
        }
        let mut seen = HashSet::new();
        for file in &self.files {
            if !seen.insert(file.key.file_name()) {
                return Err(crate::Error::Manifest(format!(
                    "extension {} ({}): duplicate file name {}",
                    self.name,
                    self.version,
                    file.key.file_name()
                )));
            }
        }
        Ok(())
    }

    /// Remote keys in manifest order.
    pub fn keys(&self) -> impl Iterator<Item = &RemoteObjectKey> {
        self.files.iter().map(|f| &f.key)
    }
}

/// A file reference in the remote index document: either a bare key or a
/// key with a fingerprint.
#[derive(Deserialize)]
#[serde(untagged)]
enum IndexFile {
    Key(RemoteObjectKey),
    Full(ManifestFile),
}

#[derive(Deserialize)]
struct IndexExtension {
    files: Vec<IndexFile>,
}

/// Immutable mapping from (version, extension name) to manifest entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<(PgMajorVersion, ExtensionName), ManifestEntry>,
}

impl Manifest {
    /// Build a manifest from explicit entries. Later duplicates are rejected.
    pub fn from_entries(entries: impl IntoIterator<Item = ManifestEntry>) -> crate::Result<Self> {
        let mut map = BTreeMap::new();
        for entry in entries {
            entry.validate()?;
            let id = (entry.version, entry.name.clone());
            if map.contains_key(&id) {
                return Err(crate::Error::Manifest(format!(
                    "duplicate extension {} for {}",
                    entry.name, entry.version
                )));
            }
            map.insert(id, entry);
        }
        Ok(Self { entries: map })
    }

    /// Parse the remote JSON index document.
    ///
    /// ```json
    /// {"v15": {"test_ext": {"files": ["v15/share/extension/test_ext.control",
    ///                                 {"key": "v15/lib/test_ext.so", "fingerprint": "sha256:..."}]}}}
    /// ```
    pub fn from_index_json(data: &[u8]) -> crate::Result<Self> {
        let raw: BTreeMap<PgMajorVersion, BTreeMap<ExtensionName, IndexExtension>> =
            serde_json::from_slice(data)
                .map_err(|e| crate::Error::Manifest(format!("invalid index document: {e}")))?;

        let mut entries = Vec::new();
        for (version, extensions) in raw {
            for (name, ext) in extensions {
                let files = ext
                    .files
                    .into_iter()
                    .map(|f| match f {
                        IndexFile::Key(key) => ManifestFile::new(key),
                        IndexFile::Full(file) => file,
                    })
                    .collect();
                entries.push(ManifestEntry::new(name, version, files)?);
            }
        }
        Self::from_entries(entries)
    }

    /// Derive manifest entries for one version from a listing of remote keys.
    ///
    /// Every `{version}/share/extension/{name}.control` defines an extension.
    /// Its `{name}--*.sql` scripts follow in sorted order, then
    /// `{version}/lib/{name}.so` when present. Keys that don't belong to any
    /// control file are ignored.
    pub fn from_listing(version: PgMajorVersion, keys: &[RemoteObjectKey]) -> crate::Result<Self> {
        let share_dir = format!("{}/share/extension/", version.as_dir());
        let lib_dir = format!("{}/lib/", version.as_dir());

        let mut controls = BTreeMap::new();
        let mut scripts = BTreeSet::new();
        let mut libs = BTreeSet::new();
        for key in keys {
            let s = key.as_str();
            if let Some(file) = s.strip_prefix(&share_dir) {
                if file.contains('/') {
                    continue;
                }
                if let Some(name) = file.strip_suffix(".control") {
                    // Skip names that aren't valid extension names rather than
                    // failing the whole listing.
                    if let Ok(name) = ExtensionName::new(name) {
                        controls.insert(name, key.clone());
                    }
                } else if file.ends_with(".sql") {
                    scripts.insert(key.clone());
                }
            } else if let Some(file) = s.strip_prefix(&lib_dir)
                && !file.contains('/')
            {
                libs.insert(key.clone());
            }
        }

        let mut entries = Vec::with_capacity(controls.len());
        for (name, control) in controls {
            let mut files = vec![ManifestFile::new(control)];
            let script_prefix = format!("{share_dir}{name}--");
            files.extend(
                scripts
                    .iter()
                    .filter(|k| k.as_str().starts_with(&script_prefix))
                    .cloned()
                    .map(ManifestFile::new),
            );
            let lib_key = format!("{lib_dir}{name}.so");
            if let Some(lib) = libs.iter().find(|k| k.as_str() == lib_key) {
                files.push(ManifestFile::new(lib.clone()));
            }
            entries.push(ManifestEntry::new(name, version, files)?);
        }
        Self::from_entries(entries)
    }

    /// Merge another manifest into this one. Duplicates are rejected.
    pub fn merge(self, other: Manifest) -> crate::Result<Self> {
        Self::from_entries(self.entries.into_values().chain(other.entries.into_values()))
    }

    /// Look up one extension.
    pub fn get(&self, version: PgMajorVersion, name: &ExtensionName) -> Option<&ManifestEntry> {
        self.entries.get(&(version, name.clone()))
    }

    /// Extensions known for a version, in name order.
    pub fn extensions(&self, version: PgMajorVersion) -> Vec<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|((v, _), _)| *v == version)
            .map(|(_, entry)| entry)
            .collect()
    }

    /// Versions present in the manifest.
    pub fn versions(&self) -> BTreeSet<PgMajorVersion> {
        self.entries.keys().map(|(v, _)| *v).collect()
    }

    /// Number of (version, extension) entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
