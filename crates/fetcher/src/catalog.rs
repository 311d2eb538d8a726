//! Catalog resolver: which files make up each extension.

use crate::error::Result;
use pgext_core::{
    ExtensionName, Manifest, ManifestEntry, ManifestSource, PgMajorVersion, RemoteObjectKey,
};
use pgext_storage::FetchClient;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, instrument, warn};

/// Load state of the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogStatus {
    /// No remote store configured.
    Disabled,
    Ready { extensions: usize },
    /// The manifest source could not be loaded. Every lookup misses until a
    /// successful [`Catalog::reload`].
    Unavailable { reason: String },
}

impl CatalogStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

struct CatalogState {
    manifest: Arc<Manifest>,
    status: CatalogStatus,
}

/// Resolves (version, extension) to its ordered list of remote files.
pub struct Catalog {
    source: Option<(ManifestSource, FetchClient)>,
    state: RwLock<CatalogState>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("status", &self.status())
            .finish()
    }
}

impl Catalog {
    /// Catalog of a disabled subsystem. Resolves nothing.
    pub fn disabled() -> Self {
        Self {
            source: None,
            state: RwLock::new(CatalogState {
                manifest: Arc::new(Manifest::default()),
                status: CatalogStatus::Disabled,
            }),
        }
    }

    /// Catalog over a fixed manifest.
    pub fn from_manifest(manifest: Manifest) -> Self {
        let status = CatalogStatus::Ready {
            extensions: manifest.len(),
        };
        Self {
            source: None,
            state: RwLock::new(CatalogState {
                manifest: Arc::new(manifest),
                status,
            }),
        }
    }

    /// Load the catalog from `source`.
    ///
    /// Never fails: a source that can't be loaded leaves the catalog
    /// Unavailable.
    pub async fn load(source: ManifestSource, client: FetchClient) -> Self {
        let catalog = Self {
            source: Some((source, client)),
            state: RwLock::new(CatalogState {
                manifest: Arc::new(Manifest::default()),
                status: CatalogStatus::Unavailable {
                    reason: "not loaded".to_string(),
                },
            }),
        };
        catalog.reload().await;
        catalog
    }

    /// Load the manifest source again and replace the current state.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> CatalogStatus {
        let Some((source, client)) = &self.source else {
            return self.status();
        };

        let (manifest, status) = match fetch_manifest(source, client).await {
            Ok(manifest) => {
                info!(
                    extensions = manifest.len(),
                    versions = ?manifest.versions(),
                    "Loaded extension catalog"
                );
                let status = CatalogStatus::Ready {
                    extensions: manifest.len(),
                };
                (manifest, status)
            }
            Err(e) => {
                warn!(error = %e, "Extension catalog unavailable");
                (Manifest::default(), CatalogStatus::Unavailable {
                    reason: e.to_string(),
                })
            }
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.manifest = Arc::new(manifest);
        state.status = status.clone();
        status
    }

    pub fn status(&self) -> CatalogStatus {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
            .clone()
    }

    fn manifest(&self) -> Option<Arc<Manifest>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.status.is_ready().then(|| state.manifest.clone())
    }

    /// Manifest entry for an extension, if the catalog is Ready and knows it.
    pub fn resolve(&self, version: PgMajorVersion, name: &ExtensionName) -> Option<ManifestEntry> {
        let entry = self.manifest()?.get(version, name).cloned();
        if entry.is_none() {
            debug!(%version, extension = %name, "Extension not in catalog");
        }
        entry
    }

    /// Extensions known for a version, in name order.
    pub fn extensions(&self, version: PgMajorVersion) -> Vec<ManifestEntry> {
        self.manifest()
            .map(|m| m.extensions(version).into_iter().cloned().collect())
            .unwrap_or_default()
    }
}

async fn fetch_manifest(source: &ManifestSource, client: &FetchClient) -> Result<Manifest> {
    match source {
        ManifestSource::Static { entries } => Ok(Manifest::from_entries(entries.clone())?),
        ManifestSource::Index { key } => {
            let key = RemoteObjectKey::new(key.clone())?;
            let fetched = client.get(&key).await?;
            Ok(Manifest::from_index_json(&fetched.value.bytes)?)
        }
        ManifestSource::Listing { versions } => {
            let mut manifest = Manifest::default();
            for &version in versions {
                let mut keys = Vec::new();
                for dir in ["share/extension/", "lib/"] {
                    let prefix = format!("{}/{dir}", version.as_dir());
                    keys.extend(client.list(&prefix).await?.value);
                }
                debug!(%version, keys = keys.len(), "Listed remote extension files");
                manifest = manifest.merge(Manifest::from_listing(version, &keys)?)?;
            }
            Ok(manifest)
        }
    }
}
