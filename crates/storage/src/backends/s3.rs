//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ObjectData, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use pgext_core::Fingerprint;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::instrument;

/// Marker included in lazy-credentials errors so they surface as configuration
/// errors rather than transport failures.
const CREDENTIALS_ERROR_MARKER: &str = "pgext-s3-lazy-credentials";

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the AWS default credentials chain on the first signed request.
///
/// Constructing the chain eagerly touches TLS roots and instance metadata,
/// which compute nodes may not have until much later in startup.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_try_init(|| async {
                let region = aws_config::Region::new(self.region.clone());
                tokio::task::spawn(async move {
                    aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                        .region(region)
                        .build()
                        .await
                })
                .await
                .map_err(|e| {
                    CredentialsError::provider_error(format!(
                        "{CREDENTIALS_ERROR_MARKER}: failed to build default credential chain: {e}"
                    ))
                })
            })
            .await?;
        chain.provide_credentials().await.map_err(|e| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_ERROR_MARKER}: default credential resolution failed: {e}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

/// Classify an SDK error.
///
/// 404 is NotFound, 403 AccessDenied; timeouts, dispatch and response
/// failures, 5xx and 429 are transient; everything else is permanent.
fn classify_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if err.to_string().contains(CREDENTIALS_ERROR_MARKER)
        || format!("{err:?}").contains(CREDENTIALS_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure credentials explicitly or ensure ambient AWS credentials are available."
                .to_string(),
        );
    }

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            return StorageError::Transient(format!("{key}: {err}"));
        }
        SdkError::ConstructionFailure(_) => {
            return StorageError::Config(format!("{key}: {err}"));
        }
        _ => {}
    }

    match err.raw_response().map(|r| r.status().as_u16()) {
        Some(404) => StorageError::NotFound(key.to_string()),
        Some(403) => StorageError::AccessDenied(key.to_string()),
        Some(429) => StorageError::Transient(format!("{key}: throttled")),
        Some(status) if status >= 500 => StorageError::Transient(format!("{key}: HTTP {status}")),
        _ if matches!(err, SdkError::ResponseError(_)) => {
            StorageError::Transient(format!("{key}: {err}"))
        }
        _ => StorageError::S3(Box::new(err)),
    }
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: Option<String>,
    region: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects `endpoint/bucket/key` URLs, which MinIO needs.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() != secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        builder = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => builder.credentials_provider(
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "pgext-config"),
            ),
            _ => builder.credentials_provider(LazyDefaultCredentialsProvider::new(region.clone())),
        };

        // Bare host:port endpoints (e.g. "minio:9000") are plain HTTP.
        let endpoint = endpoint.map(|url| {
            let lower = url.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                url
            } else {
                format!("http://{url}")
            }
        });

        if let Some(url) = &endpoint {
            builder = builder.endpoint_url(url);
            if url.to_ascii_lowercase().starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            builder = builder.force_path_style(true);
        }

        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix,
            endpoint,
            region,
        })
    }

    /// Object key in the bucket, with the configured prefix applied.
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Key relative to the configured prefix.
    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full_key)
                .to_string(),
            None => full_key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            etag: output.e_tag().map(Fingerprint::etag),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<ObjectData> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;

        let etag = output.e_tag().map(Fingerprint::etag);
        // A body that breaks off mid-stream is worth another attempt.
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transient(format!("{key}: body read failed: {e}")))?
            .into_bytes();

        Ok(ObjectData { bytes, etag })
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(data.into())
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| classify_sdk_error(e, prefix))?;

            results.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(|k| self.strip_prefix(k)),
            );

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        results.sort();
        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    /// HEAD the bucket. Read-only credentials are enough.
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        let check = self.client.head_bucket().bucket(&self.bucket).send();
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check)
            .await
            .map_err(|_| {
                StorageError::Transient(format!(
                    "S3 health check timed out after {}s",
                    HEALTH_CHECK_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| classify_sdk_error(e, &self.bucket))?;
        Ok(())
    }
}
