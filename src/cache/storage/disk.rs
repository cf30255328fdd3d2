//! Filesystem cache storage backed by
//! [`cacache`](https://github.com/zkat/cacache-rs).

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::cache::storage::{CacheEntry, CacheStorage};
use crate::error::{Error, Result};

/// Implements [`CacheStorage`] on a content-addressable disk cache.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    /// Directory where the cache is stored.
    pub path: PathBuf,
}

impl Default for DiskStorage {
    fn default() -> Self {
        Self { path: "./http-pipeline-cache".into() }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Store {
    entry: CacheEntry,
    expires_at: Option<SystemTime>,
}

impl DiskStorage {
    /// Create a storage rooted at `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait::async_trait]
impl CacheStorage for DiskStorage {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let raw = match cacache::read(&self.path, key).await {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let store: Store = match postcard::from_bytes(&raw) {
            Ok(store) => store,
            // Unreadable entries are treated as misses and dropped.
            Err(_) => {
                let _ = cacache::remove(&self.path, key).await;
                return Ok(None);
            }
        };
        if store.expires_at.is_some_and(|expiry| expiry <= SystemTime::now()) {
            let _ = cacache::remove(&self.path, key).await;
            return Ok(None);
        }
        Ok(Some(store.entry))
    }

    async fn set(
        &self,
        key: &str,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let store =
            Store { entry, expires_at: ttl.map(|t| SystemTime::now() + t) };
        let bytes = postcard::to_allocvec(&store)
            .map_err(|e| Error::Storage(format!("encode: {e}")))?;
        cacache::write(&self.path, key, bytes)
            .await
            .map_err(|e| Error::Storage(format!("write: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _ = cacache::remove(&self.path, key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        cacache::clear(&self.path)
            .await
            .map_err(|e| Error::Storage(format!("clear: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, StatusCode};

    fn entry() -> CacheEntry {
        CacheEntry::from_parts(
            StatusCode::OK,
            &HeaderMap::new(),
            b"on disk".to_vec(),
            &url::Url::parse("https://example.com/x").unwrap(),
            SystemTime::now(),
        )
    }

    #[tokio::test]
    async fn round_trips_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStorage::new(dir.path().to_path_buf());
        store.set("GET:https://example.com/x", entry(), None).await.unwrap();
        let loaded =
            store.get("GET:https://example.com/x").await.unwrap().unwrap();
        assert_eq!(loaded.body, b"on disk");
        store.delete("GET:https://example.com/x").await.unwrap();
        assert!(store.get("GET:https://example.com/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn storage_ttl_expires_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStorage::new(dir.path().to_path_buf());
        store.set("k", entry(), Some(Duration::ZERO)).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_keys_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStorage::new(dir.path().to_path_buf());
        assert!(store.get("absent").await.unwrap().is_none());
        store.delete("absent").await.unwrap();
    }
}
