//! Configuration types shared across crates.

use crate::key::PgMajorVersion;
use crate::manifest::ManifestEntry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote extension store. `None` disables the subsystem.
    #[serde(default)]
    pub remote: Option<RemoteExtConfig>,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl AppConfig {
    /// Configuration rooted at a temporary directory with a filesystem remote.
    ///
    /// **For testing only.**
    pub fn for_testing(remote_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            remote: Some(RemoteExtConfig::Filesystem {
                path: remote_root.into(),
            }),
            catalog: CatalogConfig::default(),
            cache: CacheConfig {
                root: cache_root.into(),
                staleness: StalenessPolicy::TrustLocal,
            },
            fetch: FetchConfig {
                base_delay_ms: 1,
                max_delay_ms: 10,
                ..FetchConfig::default()
            },
        }
    }

    /// Validate all sections.
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(remote) = &self.remote {
            remote.validate()?;
        }
        self.catalog.validate()?;
        self.fetch.validate()?;
        Ok(())
    }
}

/// Remote extension store configuration.
///
/// Deserializes from the JSON the endpoint start passes
/// (`{"bucket": "...", "region": "...", "endpoint": "..."}`) or from a
/// `{"path": "..."}` object naming a local directory laid out like the bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteExtConfig {
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// AWS region.
        #[serde(default)]
        region: Option<String>,
        /// Optional endpoint URL (for MinIO, etc.).
        #[serde(default)]
        endpoint: Option<String>,
        /// Optional key prefix prepended to every object key.
        #[serde(default)]
        prefix: Option<String>,
        /// Force path-style URLs. Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
        /// Falls back to AWS_ACCESS_KEY_ID if not set.
        #[serde(default)]
        access_key_id: Option<String>,
        /// Falls back to AWS_SECRET_ACCESS_KEY if not set.
        #[serde(default)]
        secret_access_key: Option<String>,
    },
    /// Local directory laid out like the bucket.
    Filesystem {
        /// Root directory.
        path: PathBuf,
    },
}

impl RemoteExtConfig {
    /// Parse the JSON form passed on the command line.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| crate::Error::Config(format!("invalid remote_ext_config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate remote configuration invariants.
    pub fn validate(&self) -> crate::Result<()> {
        match self {
            Self::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err(crate::Error::Config("bucket cannot be empty".to_string()));
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(crate::Error::Config(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    )),
                }
            }
            Self::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err(crate::Error::Config(
                        "filesystem remote path cannot be empty".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Where the manifest comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ManifestSource {
    /// Entries listed inline.
    Static {
        #[serde(default)]
        entries: Vec<ManifestEntry>,
    },
    /// JSON index document stored in the remote store.
    Index {
        #[serde(default = "default_index_key")]
        key: String,
    },
    /// Derived from listing `.control` files under each version.
    Listing { versions: Vec<PgMajorVersion> },
}

fn default_index_key() -> String {
    "ext_index.json".to_string()
}

impl Default for ManifestSource {
    fn default() -> Self {
        Self::Index {
            key: default_index_key(),
        }
    }
}

/// Catalog configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub source: ManifestSource,
}

impl CatalogConfig {
    pub fn validate(&self) -> crate::Result<()> {
        match &self.source {
            ManifestSource::Static { entries } => {
                crate::manifest::Manifest::from_entries(entries.iter().cloned())
                    .map(|_| ())
                    .map_err(|e| crate::Error::Config(format!("static catalog: {e}")))
            }
            ManifestSource::Index { key } => crate::key::RemoteObjectKey::new(key.clone())
                .map(|_| ())
                .map_err(|e| crate::Error::Config(format!("catalog index key: {e}"))),
            ManifestSource::Listing { versions } if versions.is_empty() => Err(
                crate::Error::Config("listing catalog requires at least one version".to_string()),
            ),
            ManifestSource::Listing { .. } => Ok(()),
        }
    }
}

/// How long a locally installed file is trusted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    /// Trust the installed file until explicitly invalidated.
    #[default]
    TrustLocal,
    /// HEAD the remote object on every request and re-fetch when its ETag
    /// differs from the one recorded at install time.
    Revalidate,
}

/// Local cache configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root of `{root}/{pg_major}/{extension}/{file_name}`.
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub staleness: StalenessPolicy,
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("./data/pgext")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            staleness: StalenessPolicy::default(),
        }
    }
}

/// Fetch, retry and coordination limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Total attempts per remote call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fetches allowed in the Fetching state at once.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// How long a failed fetch outcome is served from memory.
    #[serde(default = "default_negative_cache_ttl_ms")]
    pub negative_cache_ttl_ms: u64,
    /// Default maximum wait for a single request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_negative_cache_ttl_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            negative_cache_ttl_ms: default_negative_cache_ttl_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl FetchConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn negative_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.negative_cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate fetch configuration invariants.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(crate::Error::Config(
                "fetch.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(crate::Error::Config(
                "fetch.max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(crate::Error::Config(format!(
                "fetch.base_delay_ms ({}) exceeds fetch.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "fetch.request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
