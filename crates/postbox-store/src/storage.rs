//! Object storage abstraction used as the persistence backend.
//!
//! Every record the service keeps ends up as a single object addressed by a
//! slash separated key. Backends only need to offer plain put/get/delete and a
//! prefix listing; anything resembling a query is built on top of `list`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;

/// Errors surfaced by object storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store request failed: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("object store configuration error: {0}")]
    Config(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Payload of a stored object together with the content type it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectData {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes (or overwrites) the object stored under `key`.
    async fn put(&self, key: &str, bytes: Bytes, content_type: Option<&str>) -> StorageResult<()>;

    /// Reads an object, returning `None` when the key does not exist.
    async fn get(&self, key: &str) -> StorageResult<Option<ObjectData>>;

    /// Removes an object. Returns `false` if nothing was stored under `key`.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Lists every key under `prefix`, following pagination until exhausted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Verifies the backend is reachable.
    async fn health_check(&self) -> StorageResult<()>;
}

/// Process-local store. Used by tests and `POSTBOX_STORAGE=memory`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, ObjectData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: Option<&str>) -> StorageResult<()> {
        self.objects.write().insert(
            key.to_string(),
            ObjectData {
                bytes,
                content_type: content_type.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<ObjectData>> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.write().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let objects = self.objects.read();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
