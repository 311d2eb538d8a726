//! Extension request handler: make every file of an extension Present.

use crate::catalog::Catalog;
use crate::coordinator::{DownloadCoordinator, RequestOptions};
use crate::error::DownloadError;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use pgext_core::{ExtensionName, PgMajorVersion};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of ensuring one extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Every file is installed. Paths are in manifest order.
    Ready(Vec<PathBuf>),
    /// Unknown extension, catalog unavailable, or subsystem disabled.
    NotFound,
    /// The first file that failed.
    Error(DownloadError),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(paths) => {
                write!(f, "ready")?;
                for path in paths {
                    write!(f, " {}", path.display())?;
                }
                Ok(())
            }
            Self::NotFound => write!(f, "not_found"),
            Self::Error(err) => write!(f, "error {} {}: {}", err.kind, err.key, err.message),
        }
    }
}

/// Entry point for extension requests.
#[derive(Clone, Debug)]
pub struct ExtensionRequestHandler {
    catalog: Arc<Catalog>,
    coordinator: Option<DownloadCoordinator>,
}

impl ExtensionRequestHandler {
    pub fn new(catalog: Arc<Catalog>, coordinator: DownloadCoordinator) -> Self {
        Self {
            catalog,
            coordinator: Some(coordinator),
        }
    }

    /// Handler for a node without a remote store. Every request is NotFound.
    pub fn disabled() -> Self {
        Self {
            catalog: Arc::new(Catalog::disabled()),
            coordinator: None,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn coordinator(&self) -> Option<&DownloadCoordinator> {
        self.coordinator.as_ref()
    }

    pub async fn ensure(&self, version: PgMajorVersion, name: &ExtensionName) -> Readiness {
        self.ensure_with(version, name, RequestOptions::default()).await
    }

    /// Request every file of the extension concurrently.
    ///
    /// Returns on the first failed file. The remaining requests keep running
    /// in the background and still install their files.
    #[instrument(skip(self, version, name, options), fields(%version, extension = %name))]
    pub async fn ensure_with(
        &self,
        version: PgMajorVersion,
        name: &ExtensionName,
        options: RequestOptions,
    ) -> Readiness {
        let Some(coordinator) = &self.coordinator else {
            debug!("Remote extension store not configured");
            return Readiness::NotFound;
        };
        let Some(entry) = self.catalog.resolve(version, name) else {
            return Readiness::NotFound;
        };

        let mut pending: FuturesUnordered<_> = entry
            .files
            .iter()
            .enumerate()
            .map(|(idx, file)| {
                let coordinator = coordinator.clone();
                let name = name.clone();
                let file = file.clone();
                let handle = tokio::spawn(async move {
                    coordinator.request(version, &name, &file, options).await
                });
                async move { (idx, handle.await) }
            })
            .collect();

        let mut paths: Vec<Option<PathBuf>> = vec![None; entry.files.len()];
        while let Some((idx, joined)) = pending.next().await {
            let key = &entry.files[idx].key;
            match joined {
                Ok(Ok(path)) => paths[idx] = Some(path),
                Ok(Err(err)) => {
                    warn!(key = %key, kind = %err.kind, "Extension not ready");
                    return Readiness::Error(err);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Request task failed");
                    return Readiness::Error(DownloadError::aborted(key));
                }
            }
        }

        info!(files = paths.len(), "Extension ready");
        Readiness::Ready(paths.into_iter().flatten().collect())
    }

    /// Ensure several extensions concurrently. One report per name, in order.
    pub async fn ensure_all(
        &self,
        version: PgMajorVersion,
        names: &[ExtensionName],
    ) -> Vec<(ExtensionName, Readiness)> {
        join_all(names.iter().map(|name| async move {
            (name.clone(), self.ensure(version, name).await)
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pgext_core::RemoteObjectKey;

    #[tokio::test]
    async fn disabled_handler_reports_not_found() {
        let handler = ExtensionRequestHandler::disabled();
        let v15 = "v15".parse().unwrap();
        let name = ExtensionName::new("test_ext").unwrap();

        assert_eq!(handler.ensure(v15, &name).await, Readiness::NotFound);
        assert!(handler.coordinator().is_none());

        let all = handler.ensure_all(v15, &[name.clone()]).await;
        assert_eq!(all, vec![(name, Readiness::NotFound)]);
    }

    #[test]
    fn readiness_display() {
        let ready = Readiness::Ready(vec![PathBuf::from("/c/v15/a/a.control")]);
        assert_eq!(ready.to_string(), "ready /c/v15/a/a.control");
        assert!(ready.is_ready());

        let key = RemoteObjectKey::new("v15/lib/a.so").unwrap();
        let err = Readiness::Error(DownloadError::new(ErrorKind::NotFound, key, 1, "missing"));
        assert_eq!(err.to_string(), "error not_found v15/lib/a.so: missing");
        assert_eq!(Readiness::NotFound.to_string(), "not_found");
    }
}
