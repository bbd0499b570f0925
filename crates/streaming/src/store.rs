//! Persistent key-value backends for the response cache.
//!
//! Backends store whole entries keyed by `CacheKey::storage_key()`. TTL
//! evaluation happens in `TtlCache`; stores only persist what they are given.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use foundation::time::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

/// Boxed future that can be sent between tasks; keeps the store traits
/// dyn-compatible.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One cached response. At most one exists per key; writes overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub payload: serde_json::Value,
    pub stored_at: Timestamp,
    pub ttl_ms: u64,
    /// Size of the response body the payload was decoded from.
    pub bytes: usize,
}

impl StoredEntry {
    /// Expired once strictly older than its TTL.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now.millis_since(self.stored_at) > self.ttl_ms
    }
}

pub trait CacheStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StoredEntry>, StoreError>>;

    fn set<'a>(&'a self, key: &'a str, entry: StoredEntry) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Returns `true` if an entry was removed.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn clear(&self) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Process-local store; contents do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Direct insert, bypassing the async trait; used to seed sessions.
    pub fn insert(&self, key: impl Into<String>, entry: StoredEntry) {
        self.entries.lock().insert(key.into(), entry);
    }
}

impl CacheStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StoredEntry>, StoreError>> {
        Box::pin(async move { Ok(self.entries.lock().get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, entry: StoredEntry) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.entries.lock().insert(key.to_string(), entry);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move { Ok(self.entries.lock().remove(key).is_some()) })
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.entries.lock().clear();
            Ok(())
        })
    }
}

/// One JSON file per entry under `root`, named by the blake3 hash of the key.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::Io(format!("create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = blake3::hash(key.as_bytes()).to_hex();
        self.root.join(format!("{name}.json"))
    }
}

impl CacheStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StoredEntry>, StoreError>> {
        let path = self.path_for(key);
        Box::pin(async move {
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(StoreError::Io(format!("read {}: {e}", path.display()))),
            };
            match serde_json::from_slice::<StoredEntry>(&raw) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    warn!(key, error = %e, "discarding corrupt cache file");
                    let _ = tokio::fs::remove_file(&path).await;
                    Ok(None)
                }
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, entry: StoredEntry) -> BoxFuture<'a, Result<(), StoreError>> {
        let path = self.path_for(key);
        Box::pin(async move {
            let raw = serde_json::to_vec(&entry).map_err(|e| StoreError::Io(e.to_string()))?;
            // Write-then-rename so a crash never leaves a half-written entry.
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, &raw)
                .await
                .map_err(|e| StoreError::Io(format!("write {}: {e}", tmp.display())))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| StoreError::Io(format!("rename {}: {e}", path.display())))?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        let path = self.path_for(key);
        Box::pin(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(StoreError::Io(format!("remove {}: {e}", path.display()))),
            }
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut dir = tokio::fs::read_dir(&self.root)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            while let Some(item) = dir
                .next_entry()
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?
            {
                let path = item.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| StoreError::Io(format!("remove {}: {e}", path.display())))?;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use foundation::time::Timestamp;
    use serde_json::json;

    use super::{CacheStore, FileStore, MemoryStore, StoredEntry};

    fn entry(stored_at: u64) -> StoredEntry {
        StoredEntry {
            payload: json!({"type": "FeatureCollection", "features": []}),
            stored_at: Timestamp(stored_at),
            ttl_ms: 1_000,
            bytes: 42,
        }
    }

    #[test]
    fn expiry_is_strictly_older_than_ttl() {
        let e = entry(10_000);
        assert!(!e.is_expired(Timestamp(11_000)));
        assert!(e.is_expired(Timestamp(11_001)));
    }

    #[tokio::test]
    async fn memory_store_overwrites() {
        let store = MemoryStore::new();
        store.set("k", entry(1)).await.unwrap();
        store.set("k", entry(2)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k").await.unwrap().unwrap().stored_at, Timestamp(2));
        assert!(store.remove("k").await.unwrap());
        assert!(!store.remove("k").await.unwrap());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.set("buildings|posno:00100", entry(5)).await.unwrap();
        }
        let reopened = FileStore::open(dir.path()).await.unwrap();
        let got = reopened.get("buildings|posno:00100").await.unwrap();
        assert_eq!(got, Some(entry(5)));
        assert_eq!(reopened.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_drops_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.set("k", entry(1)).await.unwrap();
        tokio::fs::write(store.path_for("k"), b"{not json").await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.path_for("k").exists());
    }

    #[tokio::test]
    async fn file_store_clear_removes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.set("a", entry(1)).await.unwrap();
        store.set("b", entry(1)).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), None);
    }
}
