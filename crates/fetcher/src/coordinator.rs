//! Download coordinator: at most one fetch per (version, key).
//!
//! Every request first consults the local cache. On a miss it atomically
//! checks the in-flight registry and either attaches to the running
//! [`DownloadTask`] or creates one. The task runs as its own tokio task under a
//! semaphore permit and publishes a single outcome to every waiter through a
//! `watch` channel. Waiters that give up detach; the fetch is only aborted once
//! nobody is left waiting for it.

use crate::cache::{CacheEntry, LocalCacheStore};
use crate::error::{CacheError, DownloadError};
use crate::metrics::{
    self, BYTES_DOWNLOADED, CACHE_HITS, COALESCED_WAITERS, FETCHES_STARTED, FETCH_ATTEMPTS,
    FETCH_DURATION, FETCH_RETRIES, InFlightGuard, LOCAL_COPIES, NEGATIVE_CACHE_HITS,
};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pgext_core::{
    AppConfig, ExtensionName, Fingerprint, ManifestFile, PgMajorVersion, RemoteObjectKey,
    StalenessPolicy,
};
use pgext_storage::FetchClient;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Coordinator limits and policies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Tasks allowed in the Fetching state at once.
    pub max_concurrent_fetches: usize,
    /// How long a failed outcome is replayed without a network call.
    /// Zero disables negative caching.
    pub negative_cache_ttl: Duration,
    /// Wait limit for requests that don't set their own.
    pub default_max_wait: Duration,
    pub staleness: StalenessPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl CoordinatorConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_concurrent_fetches: config.fetch.max_concurrent_fetches.max(1),
            negative_cache_ttl: config.fetch.negative_cache_ttl(),
            default_max_wait: config.fetch.request_timeout(),
            staleness: config.cache.staleness,
        }
    }
}

/// Per-request options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Give up waiting after this long. The fetch itself keeps running while
    /// other requests wait on it.
    pub max_wait: Option<Duration>,
}

impl RequestOptions {
    pub fn with_max_wait(max_wait: Duration) -> Self {
        Self {
            max_wait: Some(max_wait),
        }
    }
}

/// Lifecycle of a download task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a fetch permit.
    Pending,
    Fetching,
    Succeeded,
    Failed,
}

impl TaskState {
    fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Snapshot of coordinator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub fetches_started: u64,
    pub coalesced_waiters: u64,
    pub cache_hits: u64,
    pub local_copies: u64,
    pub negative_cache_hits: u64,
}

#[derive(Default)]
struct StatCounters {
    fetches_started: AtomicU64,
    coalesced_waiters: AtomicU64,
    cache_hits: AtomicU64,
    local_copies: AtomicU64,
    negative_cache_hits: AtomicU64,
}

/// A downloaded and installed object, shared with every waiter.
#[derive(Clone, Debug)]
struct FetchedObject {
    bytes: Bytes,
    remote_etag: Option<Fingerprint>,
    path: PathBuf,
    installed_for: ExtensionName,
}

type Outcome = Result<FetchedObject, DownloadError>;

/// One in-flight fetch for a (version, key).
struct DownloadTask {
    id: u64,
    /// Extension whose directory the fetch installs into.
    origin: ExtensionName,
    state: Mutex<TaskState>,
    /// Attached requests. Only changed under the registry entry lock.
    waiters: AtomicUsize,
    outcome: watch::Sender<Option<Outcome>>,
    abort: Mutex<Option<AbortHandle>>,
}

impl DownloadTask {
    fn new(id: u64, origin: ExtensionName) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id,
            origin,
            state: Mutex::new(TaskState::Pending),
            waiters: AtomicUsize::new(1),
            outcome,
            abort: Mutex::new(None),
        }
    }

    fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_abort_handle(&self, handle: AbortHandle) {
        *self.abort.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn take_abort_handle(&self) -> Option<AbortHandle> {
        self.abort.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

struct NegativeEntry {
    error: DownloadError,
    expires_at: Instant,
}

type TaskId = (PgMajorVersion, RemoteObjectKey);

struct Inner {
    client: FetchClient,
    cache: Arc<LocalCacheStore>,
    tasks: DashMap<TaskId, Arc<DownloadTask>>,
    failures: DashMap<TaskId, NegativeEntry>,
    permits: Arc<Semaphore>,
    config: CoordinatorConfig,
    next_task_id: AtomicU64,
    stats: StatCounters,
}

/// Result of the registry check-and-create step.
enum Attach {
    /// Became Present while we waited for the entry lock.
    Present(PathBuf),
    /// Another extension holds a Present copy of the key.
    LocalCopy(CacheEntry),
    /// A recent failure for this key.
    Failed(DownloadError),
    /// Attached to an existing task or started a new one.
    Task(Arc<DownloadTask>),
}

/// Deduplicates concurrent fetches and installs their results.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("config", &self.inner.config)
            .field("in_flight", &self.inner.tasks.len())
            .finish()
    }
}

impl DownloadCoordinator {
    pub fn new(client: FetchClient, cache: Arc<LocalCacheStore>, config: CoordinatorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1)));
        Self {
            inner: Arc::new(Inner {
                client,
                cache,
                tasks: DashMap::new(),
                failures: DashMap::new(),
                permits,
                config,
                next_task_id: AtomicU64::new(1),
                stats: StatCounters::default(),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<LocalCacheStore> {
        &self.inner.cache
    }

    pub fn client(&self) -> &FetchClient {
        &self.inner.client
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Number of tasks in the registry.
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    /// State of the task registered for (version, key), if any.
    pub fn task_state(&self, version: PgMajorVersion, key: &RemoteObjectKey) -> Option<TaskState> {
        self.inner
            .tasks
            .get(&(version, key.clone()))
            .map(|task| task.state())
    }

    pub fn stats(&self) -> CoordinatorStats {
        let s = &self.inner.stats;
        CoordinatorStats {
            fetches_started: s.fetches_started.load(Ordering::Relaxed),
            coalesced_waiters: s.coalesced_waiters.load(Ordering::Relaxed),
            cache_hits: s.cache_hits.load(Ordering::Relaxed),
            local_copies: s.local_copies.load(Ordering::Relaxed),
            negative_cache_hits: s.negative_cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Make `file` Present in `extension`'s directory and return its path.
    ///
    /// Completes once the file is installed, the fetch failed, or `max_wait`
    /// elapsed. Dropping the returned future detaches from the fetch.
    #[instrument(
        skip(self, version, extension, file, options),
        fields(%version, %extension, key = %file.key)
    )]
    pub async fn request(
        &self,
        version: PgMajorVersion,
        extension: &ExtensionName,
        file: &ManifestFile,
        options: RequestOptions,
    ) -> Result<PathBuf, DownloadError> {
        let key = &file.key;

        let mut allow_local_copy = true;
        let entry = self.inner.cache.lookup(version, extension, key);
        if entry.is_present() {
            if self.is_fresh(key, &entry).await {
                self.record_cache_hit();
                return Ok(entry.path);
            }
            self.inner.cache.invalidate(version, extension, key);
            // Siblings may hold the same stale version.
            allow_local_copy = false;
        }

        let task = loop {
            match self.attach(version, extension, file, allow_local_copy) {
                Attach::Present(path) => {
                    self.record_cache_hit();
                    return Ok(path);
                }
                Attach::LocalCopy(source) => {
                    if let Some(path) = self.copy_local(version, extension, file, &source).await {
                        return Ok(path);
                    }
                    allow_local_copy = false;
                }
                Attach::Failed(err) => return Err(err),
                Attach::Task(task) => break task,
            }
        };

        self.wait(version, extension, file, task, options).await
    }

    /// Check-and-create under the registry entry lock.
    ///
    /// With no task registered for the key, re-checks the cache and the
    /// negative cache before creating and spawning a new task.
    fn attach(
        &self,
        version: PgMajorVersion,
        extension: &ExtensionName,
        file: &ManifestFile,
        allow_local_copy: bool,
    ) -> Attach {
        let key = &file.key;
        let inner = &self.inner;

        let task = match inner.tasks.entry((version, key.clone())) {
            Entry::Occupied(entry) => {
                let task = entry.get().clone();
                task.waiters.fetch_add(1, Ordering::SeqCst);
                inner.cache.attach_waiter(version, extension, key);
                COALESCED_WAITERS.inc();
                inner.stats.coalesced_waiters.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = task.id, "Attached to in-flight fetch");
                return Attach::Task(task);
            }
            Entry::Vacant(entry) => {
                let local = inner.cache.lookup(version, extension, key);
                if local.is_present() {
                    return Attach::Present(local.path);
                }
                if allow_local_copy
                    && let Some((owner, source)) = inner.cache.find_present(version, key)
                    && owner != *extension
                {
                    return Attach::LocalCopy(source);
                }
                if let Some(err) = self.recent_failure(version, key) {
                    return Attach::Failed(err);
                }
                let id = inner.next_task_id.fetch_add(1, Ordering::Relaxed);
                let task = Arc::new(DownloadTask::new(id, extension.clone()));
                entry.insert(task.clone());
                inner.cache.mark_fetching(version, extension, key);
                inner.cache.attach_waiter(version, extension, key);
                task
            }
        };

        let handle = tokio::spawn(run_fetch(
            self.inner.clone(),
            task.clone(),
            version,
            file.clone(),
        ));
        task.set_abort_handle(handle.abort_handle());
        debug!(task_id = task.id, "Started download task");
        Attach::Task(task)
    }

    async fn wait(
        &self,
        version: PgMajorVersion,
        extension: &ExtensionName,
        file: &ManifestFile,
        task: Arc<DownloadTask>,
        options: RequestOptions,
    ) -> Result<PathBuf, DownloadError> {
        let key = &file.key;
        let guard = WaiterGuard {
            inner: self.inner.clone(),
            task: task.clone(),
            version,
            extension: extension.clone(),
            key: key.clone(),
        };

        let max_wait = options.max_wait.unwrap_or(self.inner.config.default_max_wait);
        let mut rx = task.outcome.subscribe();
        let outcome = match tokio::time::timeout(max_wait, rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => value
                .clone()
                .unwrap_or_else(|| Err(DownloadError::aborted(key))),
            Ok(Err(_)) => Err(DownloadError::aborted(key)),
            Err(_) => {
                drop(guard);
                warn!(
                    task_id = task.id,
                    waited_ms = max_wait.as_millis() as u64,
                    "Gave up waiting for fetch"
                );
                return Err(DownloadError::timeout(key, max_wait));
            }
        };
        drop(guard);

        let fetched = outcome?;
        if fetched.installed_for == *extension {
            return Ok(fetched.path);
        }

        // Fetched for another extension: install our own copy from the payload.
        let entry = self
            .inner
            .cache
            .install(
                version,
                extension,
                key,
                fetched.bytes,
                file.fingerprint.as_ref(),
                fetched.remote_etag,
            )
            .await
            .map_err(|e| DownloadError::from_cache(key, 0, e))?;
        LOCAL_COPIES.inc();
        self.inner.stats.local_copies.fetch_add(1, Ordering::Relaxed);
        Ok(entry.path)
    }

    /// Install from another extension's Present copy. `None` if that failed.
    async fn copy_local(
        &self,
        version: PgMajorVersion,
        extension: &ExtensionName,
        file: &ManifestFile,
        source: &CacheEntry,
    ) -> Option<PathBuf> {
        match self
            .inner
            .cache
            .install_from_local(version, extension, &file.key, source, file.fingerprint.as_ref())
            .await
        {
            Ok(entry) => {
                debug!(source = %source.path.display(), "Installed from local copy");
                LOCAL_COPIES.inc();
                self.inner.stats.local_copies.fetch_add(1, Ordering::Relaxed);
                Some(entry.path)
            }
            Err(e) => {
                warn!(source = %source.path.display(), error = %e, "Local copy failed");
                None
            }
        }
    }

    /// Whether a Present entry may be served under the staleness policy.
    async fn is_fresh(&self, key: &RemoteObjectKey, entry: &CacheEntry) -> bool {
        match self.inner.config.staleness {
            StalenessPolicy::TrustLocal => true,
            StalenessPolicy::Revalidate => {
                let Some(recorded) = &entry.fingerprint else {
                    debug!("No recorded fingerprint, revalidating");
                    return false;
                };
                match self.inner.client.head(key).await {
                    Ok(meta) => {
                        let fresh = meta.value.etag.as_ref() == Some(recorded);
                        if !fresh {
                            info!(recorded = %recorded, "Remote object changed");
                        }
                        fresh
                    }
                    Err(e) => {
                        warn!(error = %e, "Revalidation failed, serving local copy");
                        true
                    }
                }
            }
        }
    }

    fn recent_failure(&self, version: PgMajorVersion, key: &RemoteObjectKey) -> Option<DownloadError> {
        let id = (version, key.clone());
        let cached = self.inner.failures.get(&id).map(|f| (f.error.clone(), f.expires_at));
        match cached {
            Some((error, expires_at)) if Instant::now() < expires_at => {
                NEGATIVE_CACHE_HITS.inc();
                self.inner
                    .stats
                    .negative_cache_hits
                    .fetch_add(1, Ordering::Relaxed);
                debug!(kind = %error.kind, "Replaying recent failure");
                Some(error)
            }
            Some(_) => {
                self.inner.failures.remove(&id);
                None
            }
            None => None,
        }
    }

    fn record_cache_hit(&self) {
        CACHE_HITS.inc();
        self.inner.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Detaches a request from its task on drop, including on timeout or when the
/// request future is dropped. The last waiter to leave an unfinished task
/// removes it from the registry and aborts it.
struct WaiterGuard {
    inner: Arc<Inner>,
    task: Arc<DownloadTask>,
    version: PgMajorVersion,
    extension: ExtensionName,
    key: RemoteObjectKey,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner
            .cache
            .detach_waiter(self.version, &self.extension, &self.key);

        let mut abort = None;
        if let Entry::Occupied(entry) = inner.tasks.entry((self.version, self.key.clone()))
            && entry.get().id == self.task.id
        {
            let remaining = entry.get().waiters.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining == 0 && !entry.get().state().is_finished() {
                let task = entry.remove();
                inner.cache.mark_missing(self.version, &task.origin, &self.key);
                abort = task.take_abort_handle();
            }
        }

        if let Some(handle) = abort {
            debug!(task_id = self.task.id, key = %self.key, "No waiters left, aborting fetch");
            handle.abort();
        }
    }
}

/// Publishes the task outcome exactly once. Dropping it unfinished (the task
/// was aborted or panicked) publishes `Aborted`.
struct Completion {
    inner: Arc<Inner>,
    task: Arc<DownloadTask>,
    version: PgMajorVersion,
    key: RemoteObjectKey,
    finished: bool,
}

impl Completion {
    fn finish(mut self, outcome: Outcome) {
        self.finished = true;
        let inner = &self.inner;

        match &outcome {
            Ok(fetched) => {
                self.task.set_state(TaskState::Succeeded);
                inner.failures.remove(&(self.version, self.key.clone()));
                debug!(task_id = self.task.id, path = %fetched.path.display(), "Fetch succeeded");
            }
            Err(err) => {
                self.task.set_state(TaskState::Failed);
                metrics::record_failure(err.kind);
                inner
                    .cache
                    .mark_failed(self.version, &self.task.origin, &self.key);
                // Local failures are specific to the requesting extension.
                if err.kind.is_remote() && !inner.config.negative_cache_ttl.is_zero() {
                    inner.failures.insert(
                        (self.version, self.key.clone()),
                        NegativeEntry {
                            error: err.clone(),
                            expires_at: Instant::now() + inner.config.negative_cache_ttl,
                        },
                    );
                }
                warn!(
                    task_id = self.task.id,
                    kind = %err.kind,
                    attempts = err.attempts,
                    error = %err.message,
                    "Fetch failed"
                );
            }
        }

        // Later requests see the Present file or the negative entry, never
        // this task.
        self.remove_from_registry();
        self.task.outcome.send_replace(Some(outcome));
    }

    fn remove_from_registry(&self) {
        let task_id = self.task.id;
        self.inner
            .tasks
            .remove_if(&(self.version, self.key.clone()), |_, task| task.id == task_id);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.task.set_state(TaskState::Failed);
        self.remove_from_registry();
        self.task
            .outcome
            .send_replace(Some(Err(DownloadError::aborted(&self.key))));
    }
}

/// Body of a spawned download task.
async fn run_fetch(inner: Arc<Inner>, task: Arc<DownloadTask>, version: PgMajorVersion, file: ManifestFile) {
    let completion = Completion {
        inner: inner.clone(),
        task: task.clone(),
        version,
        key: file.key.clone(),
        finished: false,
    };
    let outcome = fetch_and_install(&inner, &task, version, &file).await;
    completion.finish(outcome);
}

/// GET the object and install it, retrying the whole fetch once on a
/// fingerprint mismatch.
async fn fetch_and_install(
    inner: &Inner,
    task: &DownloadTask,
    version: PgMajorVersion,
    file: &ManifestFile,
) -> Outcome {
    let key = &file.key;
    let _permit = inner
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| DownloadError::aborted(key))?;

    task.set_state(TaskState::Fetching);
    let _in_flight = InFlightGuard::new();
    FETCHES_STARTED.inc();
    inner.stats.fetches_started.fetch_add(1, Ordering::Relaxed);
    let started = std::time::Instant::now();

    let mut attempts = 0u32;
    let mut mismatch_retried = false;
    loop {
        let fetched = match inner.client.get(key).await {
            Ok(fetched) => fetched,
            Err(e) => {
                record_attempts(e.attempts);
                let mut err = DownloadError::from_fetch(key, e);
                err.attempts += attempts;
                return Err(err);
            }
        };
        record_attempts(fetched.attempts);
        attempts += fetched.attempts;

        let data = fetched.value;
        BYTES_DOWNLOADED.inc_by(data.bytes.len() as u64);

        match inner
            .cache
            .install(
                version,
                &task.origin,
                key,
                data.bytes.clone(),
                file.fingerprint.as_ref(),
                data.etag.clone(),
            )
            .await
        {
            Ok(entry) => {
                FETCH_DURATION.observe(started.elapsed().as_secs_f64());
                return Ok(FetchedObject {
                    bytes: data.bytes,
                    remote_etag: data.etag,
                    path: entry.path,
                    installed_for: task.origin.clone(),
                });
            }
            Err(CacheError::FingerprintMismatch { expected, actual }) if !mismatch_retried => {
                warn!(%expected, %actual, "Fingerprint mismatch, fetching again");
                mismatch_retried = true;
            }
            Err(e) => return Err(DownloadError::from_cache(key, attempts, e)),
        }
    }
}

fn record_attempts(attempts: u32) {
    FETCH_ATTEMPTS.inc_by(u64::from(attempts));
    FETCH_RETRIES.inc_by(u64::from(attempts.saturating_sub(1)));
}
