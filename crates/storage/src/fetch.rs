//! Remote fetch client: object store calls under a retry policy.

use crate::error::StorageError;
use crate::retry::RetryPolicy;
use crate::traits::{ObjectData, ObjectMeta, ObjectStore};
use pgext_core::RemoteObjectKey;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// A successful remote call and the attempts it took.
#[derive(Clone, Debug)]
pub struct Fetched<T> {
    pub value: T,
    pub attempts: u32,
}

/// A remote call that failed permanently or ran out of attempts.
#[derive(Debug, Error)]
#[error("{operation} {key} failed after {attempts} attempt(s): {source}")]
pub struct FetchError {
    pub operation: &'static str,
    pub key: String,
    pub attempts: u32,
    #[source]
    pub source: StorageError,
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        self.source.is_not_found()
    }

    /// Whether the budget ran out on transient errors.
    pub fn is_transient(&self) -> bool {
        self.source.is_transient()
    }
}

/// Retrying wrapper around an [`ObjectStore`]. Holds no local state.
#[derive(Clone)]
pub struct FetchClient {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchClient")
            .field("backend", &self.store.backend_name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl FetchClient {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Download an object.
    #[instrument(skip(self, key), fields(key = %key, backend = self.store.backend_name()))]
    pub async fn get(&self, key: &RemoteObjectKey) -> Result<Fetched<ObjectData>, FetchError> {
        self.with_retry("GET", key.as_str(), || self.store.get(key.as_str()))
            .await
    }

    /// Current metadata (size and ETag) of an object.
    #[instrument(skip(self, key), fields(key = %key, backend = self.store.backend_name()))]
    pub async fn head(&self, key: &RemoteObjectKey) -> Result<Fetched<ObjectMeta>, FetchError> {
        self.with_retry("HEAD", key.as_str(), || self.store.head(key.as_str()))
            .await
    }

    /// List keys under a prefix. Keys that aren't valid object keys are skipped.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn list(&self, prefix: &str) -> Result<Fetched<Vec<RemoteObjectKey>>, FetchError> {
        let listed = self
            .with_retry("LIST", prefix, || self.store.list(prefix))
            .await?;
        let keys = listed
            .value
            .into_iter()
            .filter_map(|k| match RemoteObjectKey::new(k.clone()) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(key = %k, error = %e, "Skipping unusable key in listing");
                    None
                }
            })
            .collect();
        Ok(Fetched {
            value: keys,
            attempts: listed.attempts,
        })
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        mut call: F,
    ) -> Result<Fetched<T>, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut backoff = self.policy.backoff();
        let mut last_error = None;
        while backoff.start_attempt() {
            match call().await {
                Ok(value) => {
                    return Ok(Fetched {
                        value,
                        attempts: backoff.attempts(),
                    });
                }
                Err(e) if e.is_transient() => {
                    if let Some(delay) = backoff.next_delay() {
                        debug!(
                            operation,
                            key,
                            attempt = backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient remote error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            operation,
                            key,
                            attempts = backoff.attempts(),
                            error = %e,
                            "Retry budget exhausted"
                        );
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    return Err(FetchError {
                        operation,
                        key: key.to_string(),
                        attempts: backoff.attempts(),
                        source: e,
                    });
                }
            }
        }

        // A policy always grants at least one attempt.
        Err(FetchError {
            operation,
            key: key.to_string(),
            attempts: backoff.attempts(),
            source: last_error
                .unwrap_or_else(|| StorageError::Transient("no attempt made".to_string())),
        })
    }
}
