#![allow(dead_code)]

pub mod mocks;

pub use mocks::{Fault, MockStore};

use pgext_core::{
    ExtensionName, Manifest, ManifestEntry, ManifestFile, PgMajorVersion, RemoteObjectKey,
    StalenessPolicy,
};
use pgext_fetcher::{
    Catalog, CoordinatorConfig, DownloadCoordinator, ExtensionRequestHandler, LocalCacheStore,
};
use pgext_storage::{FetchClient, RetryPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CONTROL_KEY: &str = "v15/share/extension/test_ext.control";
pub const SHARED_KEY: &str = "v15/share/common.so";

pub fn v15() -> PgMajorVersion {
    "v15".parse().unwrap()
}

pub fn v16() -> PgMajorVersion {
    "v16".parse().unwrap()
}

pub fn ext(name: &str) -> ExtensionName {
    ExtensionName::new(name).unwrap()
}

pub fn key(s: &str) -> RemoteObjectKey {
    RemoteObjectKey::new(s).unwrap()
}

pub fn file(s: &str) -> ManifestFile {
    ManifestFile::new(key(s))
}

pub fn entry(name: &str, version: PgMajorVersion, keys: &[&str]) -> ManifestEntry {
    ManifestEntry::new(ext(name), version, keys.iter().map(|k| file(k)).collect()).unwrap()
}

/// Retries without noticeable delay.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
}

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        max_concurrent_fetches: 8,
        negative_cache_ttl: Duration::from_secs(2),
        default_max_wait: Duration::from_secs(10),
        staleness: StalenessPolicy::TrustLocal,
    }
}

/// A coordinator over a mock store and a temporary cache root.
pub struct TestEnv {
    pub temp: TempDir,
    pub store: Arc<MockStore>,
    pub coordinator: DownloadCoordinator,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: CoordinatorConfig) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let store = MockStore::new();
        let coordinator = coordinator_over(&store, temp.path().join("cache"), config).await;
        Self {
            temp,
            store,
            coordinator,
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        self.temp.path().join("cache")
    }

    /// Handler over a fixed manifest.
    pub fn handler(&self, entries: Vec<ManifestEntry>) -> ExtensionRequestHandler {
        let catalog = Catalog::from_manifest(Manifest::from_entries(entries).unwrap());
        ExtensionRequestHandler::new(Arc::new(catalog), self.coordinator.clone())
    }

    /// A fresh coordinator over the same cache root, as after a process restart.
    pub async fn restart(&self) -> DownloadCoordinator {
        let coordinator = coordinator_over(&self.store, self.cache_root(), test_config()).await;
        coordinator.cache().recover().await.unwrap();
        coordinator
    }
}

async fn coordinator_over(
    store: &Arc<MockStore>,
    cache_root: PathBuf,
    config: CoordinatorConfig,
) -> DownloadCoordinator {
    let cache = LocalCacheStore::new(cache_root).await.unwrap();
    let client = FetchClient::new(store.clone(), fast_policy());
    DownloadCoordinator::new(client, Arc::new(cache), config)
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
