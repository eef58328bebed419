//! Storage contract consumed by the key store.
//!
//! The host owns the byte-addressable backend; the key store only needs
//! `get`, `put`, `delete` and one-level `list`. [`RequestContext`] pairs a
//! backend with the caller's cancellation token so every storage call is a
//! cancellation point.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::error::TransitError;

/// A single value written to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    /// Path relative to the mount.
    pub key: String,
    /// Opaque payload.
    pub value: Vec<u8>,
    /// Ask the host to wrap this value at rest.
    pub seal_wrap: bool,
}

impl StorageEntry {
    /// Create an entry that is not seal-wrapped.
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            seal_wrap: false,
        }
    }

    /// Create an entry marked for at-rest wrapping.
    pub fn sealed(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            seal_wrap: true,
        }
    }
}

/// Byte-addressable storage backend.
///
/// Errors are propagated to the caller unchanged; the key store never
/// retries a failed write.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Get the value at `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store an entry, replacing any existing value.
    async fn put(&self, entry: StorageEntry) -> Result<()>;

    /// Delete the value at `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List the children of `prefix`, one level deep.
    ///
    /// Children that have descendants are returned with a trailing `/`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory storage for tests and embedded use.
#[derive(Default)]
pub struct InMemoryStorage {
    data: RwLock<HashMap<String, StorageEntry>>,
}

impl InMemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the entry at `key` was written with `seal_wrap` set.
    pub async fn is_sealed(&self, key: &str) -> Option<bool> {
        self.data.read().await.get(key).map(|e| e.seal_wrap)
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// True when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.read().await;
        Ok(data.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, entry: StorageEntry) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.read().await;
        let mut children = BTreeSet::new();

        for key in data.keys() {
            if let Some(relative) = key.strip_prefix(prefix) {
                if let Some(slash_pos) = relative.find('/') {
                    children.insert(format!("{}/", &relative[..slash_pos]));
                } else if !relative.is_empty() {
                    children.insert(relative.to_string());
                }
            }
        }

        Ok(children.into_iter().collect())
    }
}

/// Storage handle scoped to one request.
///
/// Every call checks the cancellation token first. Writes that already
/// completed are never rolled back.
#[derive(Clone)]
pub struct RequestContext {
    storage: Arc<dyn Storage>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Bind a backend to a cancellation token.
    pub fn new(storage: Arc<dyn Storage>, cancel: CancellationToken) -> Self {
        Self { storage, cancel }
    }

    /// The caller's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with [`TransitError::Cancelled`] if the token fired.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TransitError::Cancelled);
        }
        Ok(())
    }

    /// Cancellation-aware [`Storage::get`].
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_cancelled()?;
        self.storage.get(key).await
    }

    /// Cancellation-aware [`Storage::put`].
    pub async fn put(&self, entry: StorageEntry) -> Result<()> {
        self.check_cancelled()?;
        self.storage.put(entry).await
    }

    /// Cancellation-aware [`Storage::delete`].
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.check_cancelled()?;
        self.storage.delete(key).await
    }

    /// Cancellation-aware [`Storage::list`].
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_cancelled()?;
        self.storage.list(prefix).await
    }

    /// Read and decode a JSON value.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| TransitError::Serialization {
                    reason: format!("corrupted entry at {key}: {e}"),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value.
    pub async fn put_json<T: serde::Serialize>(&self, key: &str, value: &T, seal_wrap: bool) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| TransitError::Serialization { reason: e.to_string() })?;
        let entry = if seal_wrap {
            StorageEntry::sealed(key, bytes)
        } else {
            StorageEntry::new(key, bytes)
        };
        self.put(entry).await
    }
}
