//! On-demand fetch, cache and install pipeline for extension files.
//!
//! A compute node asks for an extension by name; the [`ExtensionRequestHandler`]
//! resolves its files through the [`Catalog`], and the [`DownloadCoordinator`]
//! makes each one Present in the [`LocalCacheStore`], fetching it at most once
//! no matter how many requests arrive concurrently.

pub mod cache;
pub mod catalog;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod metrics;

pub use cache::{CacheEntry, CacheState, LocalCacheStore, RecoveryReport};
pub use catalog::{Catalog, CatalogStatus};
pub use coordinator::{
    CoordinatorConfig, CoordinatorStats, DownloadCoordinator, RequestOptions, TaskState,
};
pub use error::{CacheError, DownloadError, Error, ErrorKind, Result};
pub use handler::{ExtensionRequestHandler, Readiness};

use pgext_core::AppConfig;
use pgext_storage::{FetchClient, RetryPolicy};
use std::sync::Arc;
use tracing::{info, warn};

/// Assemble the pipeline from configuration.
///
/// Without a remote store the returned handler answers NotFound to everything.
/// An unreachable manifest source is not an error here: the catalog starts
/// Unavailable and can be reloaded.
pub async fn build(config: &AppConfig) -> Result<ExtensionRequestHandler> {
    config.validate()?;
    metrics::register_metrics();

    let Some(remote) = &config.remote else {
        info!("No remote extension store configured, on-demand fetching disabled");
        return Ok(ExtensionRequestHandler::disabled());
    };

    let store = pgext_storage::from_config(remote).await?;
    if let Err(e) = store.health_check().await {
        warn!(backend = store.backend_name(), error = %e, "Remote store health check failed");
    }
    let client = FetchClient::new(store, RetryPolicy::from_config(&config.fetch));

    let cache = LocalCacheStore::new(&config.cache.root).await?;
    cache.recover().await?;

    let catalog = Catalog::load(config.catalog.source.clone(), client.clone()).await;
    let coordinator = DownloadCoordinator::new(
        client,
        Arc::new(cache),
        CoordinatorConfig::from_config(config),
    );

    info!(
        backend = coordinator.client().store().backend_name(),
        cache_root = %config.cache.root.display(),
        catalog = ?catalog.status(),
        "Extension fetcher ready"
    );
    Ok(ExtensionRequestHandler::new(Arc::new(catalog), coordinator))
}
