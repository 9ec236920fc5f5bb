//! In-memory object store used by the test suite.
//!
//! Mirrors the observable behavior of the B2 adapter closely enough for
//! protocol-level tests: versioned objects, listing that returns the next
//! name at or after the queried one, and per-operation counters so tests
//! can assert on dedup and cache behavior.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use crate::config::RemoteConfig;
use crate::storage::{ByteStream, ObjectInfo, RemoteObject, RemoteStore, StoreConnector, StoreError};

#[derive(Debug, Clone)]
struct StoredObject {
    file_id: String,
    sha1_hex: String,
    data: Vec<u8>,
}

/// Calls made against a [`MemoryStore`], for assertions.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub lists: usize,
    pub infos: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub deletes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    counters: Counters,
    next_id: u64,
    fail_next_list: bool,
}

/// Cloneable handle to one shared in-memory bucket.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing the upload path.
    pub fn put(&self, name: &str, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let file_id = format!("id-{}", inner.next_id);
        inner.next_id += 1;
        inner.objects.insert(
            name.to_string(),
            StoredObject {
                file_id,
                sha1_hex: hex::encode(Sha1::digest(data)),
                data: data.to_vec(),
            },
        );
    }

    /// Raw stored bytes for `name`, if present.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(name)
            .map(|obj| obj.data.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().objects.contains_key(name)
    }

    pub fn counters(&self) -> Counters {
        self.inner.lock().unwrap().counters
    }

    /// Make the next listing fail, simulating a remote outage.
    pub fn fail_next_list(&self) {
        self.inner.lock().unwrap().fail_next_list = true;
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_by_exact_name(&self, name: &str) -> Result<Option<RemoteObject>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.lists += 1;
        if inner.fail_next_list {
            inner.fail_next_list = false;
            return Err(StoreError::Api {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        // B2 listing semantics: first file at or after the requested name.
        Ok(inner
            .objects
            .range(name.to_string()..)
            .next()
            .map(|(file_name, obj)| RemoteObject {
                file_name: file_name.clone(),
                file_id: obj.file_id.clone(),
            }))
    }

    async fn get_info(&self, file_id: &str) -> Result<ObjectInfo, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.infos += 1;
        inner
            .objects
            .values()
            .find(|obj| obj.file_id == file_id)
            .map(|obj| ObjectInfo {
                content_sha1: obj.sha1_hex.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))
    }

    async fn upload(
        &self,
        name: &str,
        mut content: ByteStream,
        sha1_hex: &str,
        length: u64,
    ) -> Result<(), StoreError> {
        let mut data = Vec::with_capacity(length as usize);
        content.read_to_end(&mut data).await?;

        let mut inner = self.inner.lock().unwrap();
        inner.counters.uploads += 1;
        if data.len() as u64 != length {
            return Err(StoreError::Api {
                status: 400,
                message: format!("length mismatch: declared {length}, got {}", data.len()),
            });
        }
        let computed = hex::encode(Sha1::digest(&data));
        if computed != sha1_hex {
            return Err(StoreError::Api {
                status: 400,
                message: "checksum did not verify".to_string(),
            });
        }
        let file_id = format!("id-{}", inner.next_id);
        inner.next_id += 1;
        inner.objects.insert(
            name.to_string(),
            StoredObject {
                file_id,
                sha1_hex: sha1_hex.to_string(),
                data,
            },
        );
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<ByteStream, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.downloads += 1;
        let obj = inner
            .objects
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(Box::new(Cursor::new(obj.data.clone())))
    }

    async fn delete_version(&self, name: &str, file_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.deletes += 1;
        match inner.objects.get(name) {
            Some(obj) if obj.file_id == file_id => {
                inner.objects.remove(name);
                Ok(())
            }
            _ => Err(StoreError::NotFound(name.to_string())),
        }
    }
}

/// Connector over a shared [`MemoryStore`], counting connect calls so tests
/// can observe that setup runs at most once.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
    connects: Arc<Mutex<usize>>,
    bucket_exists: Arc<Mutex<bool>>,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            connects: Arc::new(Mutex::new(0)),
            bucket_exists: Arc::new(Mutex::new(true)),
        }
    }

    /// Make the next connect behave as if the bucket were missing.
    pub fn set_bucket_exists(&self, exists: bool) {
        *self.bucket_exists.lock().unwrap() = exists;
    }

    pub fn connect_count(&self) -> usize {
        *self.connects.lock().unwrap()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(
        &self,
        config: &RemoteConfig,
        may_create: bool,
    ) -> Result<Box<dyn RemoteStore>, StoreError> {
        *self.connects.lock().unwrap() += 1;
        let mut exists = self.bucket_exists.lock().unwrap();
        if !*exists {
            if !may_create {
                return Err(StoreError::BucketMissing(config.bucket.clone()));
            }
            *exists = true;
        }
        Ok(Box::new(self.store.clone()))
    }
}
