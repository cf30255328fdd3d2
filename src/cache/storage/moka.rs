//! In-memory cache storage backed by
//! [`moka`](https://github.com/moka-rs/moka), for callers that want a
//! concurrent cache with its own eviction instead of the accounting in
//! [`MemoryStorage`](crate::cache::storage::memory::MemoryStorage).

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::cache::storage::{CacheEntry, CacheStorage};
use crate::error::{Error, Result};

/// Implements [`CacheStorage`] over a `moka::future::Cache`.
#[derive(Clone)]
pub struct MokaStorage {
    /// The wrapped cache instance.
    pub cache: Arc<Cache<String, Arc<Vec<u8>>>>,
}

impl std::fmt::Debug for MokaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaStorage").finish_non_exhaustive()
    }
}

impl Default for MokaStorage {
    fn default() -> Self {
        Self::new(Cache::new(1000))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Store {
    entry: CacheEntry,
    expires_at: Option<SystemTime>,
}

impl MokaStorage {
    /// Create a storage from a pre-configured cache.
    #[must_use]
    pub fn new(cache: Cache<String, Arc<Vec<u8>>>) -> Self {
        Self { cache: Arc::new(cache) }
    }
}

#[async_trait::async_trait]
impl CacheStorage for MokaStorage {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(raw) = self.cache.get(key).await else { return Ok(None) };
        let store: Store = postcard::from_bytes(&raw)
            .map_err(|e| Error::Storage(format!("decode: {e}")))?;
        if store.expires_at.is_some_and(|expiry| expiry <= SystemTime::now()) {
            self.cache.invalidate(key).await;
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
        self.cache.insert(key.to_string(), Arc::new(bytes)).await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, StatusCode};

    #[tokio::test]
    async fn round_trips_entries() {
        let store = MokaStorage::default();
        let entry = CacheEntry::from_parts(
            StatusCode::OK,
            &HeaderMap::new(),
            b"moka".to_vec(),
            &url::Url::parse("https://example.com/").unwrap(),
            SystemTime::now(),
        );
        store.set("k", entry, None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().body, b"moka");
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }
}
