use async_trait::async_trait;
use bytes::Bytes;
use pgext_core::{ContentHash, Fingerprint};
use pgext_storage::error::{StorageError, StorageResult};
use pgext_storage::traits::{ObjectData, ObjectMeta, ObjectStore};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A failure injected into the next call for a key.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug)]
pub enum Fault {
    Transient,
    AccessDenied,
}

/// In-memory store with per-key scripted faults and call counters.
#[derive(Default)]
pub struct ScriptedStore {
    objects: Mutex<HashMap<String, Bytes>>,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    pub gets: AtomicUsize,
    pub heads: AtomicUsize,
    pub lists: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
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

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn next_fault(&self, key: &str) -> StorageResult<()> {
        let fault = self
            .faults
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|q| q.pop_front());
        match fault {
            None => Ok(()),
            Some(Fault::Transient) => Err(StorageError::Transient(format!("{key}: HTTP 503"))),
            Some(Fault::AccessDenied) => Err(StorageError::AccessDenied(key.to_string())),
        }
    }

    fn etag(data: &[u8]) -> Fingerprint {
        Fingerprint::ETag(ContentHash::compute(data).to_hex())
    }
}

#[async_trait]
impl ObjectStore for ScriptedStore {
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.next_fault(key)?;
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            etag: Some(Self::etag(data)),
        })
    }

    async fn get(&self, key: &str) -> StorageResult<ObjectData> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.next_fault(key)?;
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectData {
            bytes: data.clone(),
            etag: Some(Self::etag(data)),
        })
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.insert(key, data);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.next_fault(prefix)?;
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
        "scripted"
    }
}
