use async_trait::async_trait;
use bytes::Bytes;
use pgext_core::{ContentHash, Fingerprint};
use pgext_storage::{ObjectData, ObjectMeta, ObjectStore, StorageError, StorageResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// A failure injected into the next call for a key.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug)]
pub enum Fault {
    Transient,
    AccessDenied,
    /// A permanent rejection that is neither not-found nor access denied.
    Rejected,
    /// Return this payload instead of the stored one.
    Corrupt(&'static [u8]),
}

/// In-memory object store with call counters, scripted faults, an optional
/// gate that holds every GET until released, and a per-GET delay.
pub struct MockStore {
    objects: Mutex<HashMap<String, Bytes>>,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    gate: watch::Sender<bool>,
    delay: Mutex<Option<Duration>>,
    pub gets: AtomicUsize,
    pub heads: AtomicUsize,
    pub lists: AtomicUsize,
    active_gets: AtomicUsize,
    pub max_active_gets: AtomicUsize,
}

#[allow(dead_code)]
impl MockStore {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            gate,
            delay: Mutex::new(None),
            gets: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            active_gets: AtomicUsize::new(0),
            max_active_gets: AtomicUsize::new(0),
        })
    }

    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.into());
    }

    /// Fail the next calls for `key` with `faults`, in order.
    pub fn script(&self, key: &str, faults: impl IntoIterator<Item = Fault>) {
        self.faults
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend(faults);
    }

    /// Hold every GET until [`MockStore::open`] is called.
    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// Total remote calls of any kind.
    pub fn calls(&self) -> usize {
        self.gets() + self.heads() + self.lists()
    }

    pub fn max_active_gets(&self) -> usize {
        self.max_active_gets.load(Ordering::SeqCst)
    }

    /// ETag the store reports for `data`.
    pub fn etag(data: &[u8]) -> Fingerprint {
        Fingerprint::ETag(ContentHash::compute(data).to_hex())
    }

    fn next_fault(&self, key: &str) -> Option<Fault> {
        self.faults
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|q| q.pop_front())
    }

    fn lookup(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

/// Tracks the number of GETs in progress, including aborted ones.
struct ActiveGet<'a>(&'a MockStore);

impl<'a> ActiveGet<'a> {
    fn enter(store: &'a MockStore) -> Self {
        let active = store.active_gets.fetch_add(1, Ordering::SeqCst) + 1;
        store.max_active_gets.fetch_max(active, Ordering::SeqCst);
        Self(store)
    }
}

impl Drop for ActiveGet<'_> {
    fn drop(&mut self) {
        self.0.active_gets.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        match self.next_fault(key) {
            Some(Fault::Transient) => return Err(StorageError::Transient(format!("{key}: HTTP 503"))),
            Some(Fault::AccessDenied) => return Err(StorageError::AccessDenied(key.to_string())),
            _ => {}
        }
        let data = self.lookup(key)?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            etag: Some(Self::etag(&data)),
        })
    }

    async fn get(&self, key: &str) -> StorageResult<ObjectData> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGet::enter(self);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let data = match self.next_fault(key) {
            Some(Fault::Transient) => {
                return Err(StorageError::Transient(format!("{key}: HTTP 503")));
            }
            Some(Fault::AccessDenied) => return Err(StorageError::AccessDenied(key.to_string())),
            Some(Fault::Rejected) => {
                return Err(StorageError::Config(format!("{key}: HTTP 400 Bad Request")));
            }
            Some(Fault::Corrupt(bytes)) => {
                self.lookup(key)?;
                Bytes::from_static(bytes)
            }
            None => self.lookup(key)?,
        };
        Ok(ObjectData {
            etag: Some(Self::etag(&data)),
            bytes: data,
        })
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.insert(key, data);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if let Some(Fault::Transient) = self.next_fault(prefix) {
            return Err(StorageError::Transient(format!("{prefix}: HTTP 503")));
        }
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }
}
