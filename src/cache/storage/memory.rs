//! In-memory cache storage with LRU/FIFO eviction, byte accounting, and
//! optional transparent compression of large entries.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::cache::storage::{CacheEntry, CacheStorage};
use crate::error::{Error, Result};

/// Which entry goes first when space is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Least recently accessed first
    #[default]
    Lru,
    /// Oldest insertion first
    Fifo,
}

/// How the byte budget is expressed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemoryLimit {
    /// An explicit number of bytes
    Bytes(u64),
    /// A fraction of total system memory
    FractionOfSystem(f64),
    /// Resolve from the container/cgroup limit, falling back to a tenth
    /// of system memory
    Auto,
}

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    /// Maximum entry count before eviction; `None` means unbounded.
    pub max_entries: Option<usize>,
    /// Byte budget; `None` disables byte accounting.
    pub limit: Option<MemoryLimit>,
    /// Eviction order.
    pub policy: EvictionPolicy,
    /// Serialized entries at or above this size are stored gzipped.
    /// `None` disables compression.
    pub compression_threshold: Option<usize>,
    /// Process-over-system memory ratio above which a health check evicts
    /// down to half the store's current bytes.
    pub pressure_ratio: Option<f64>,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            max_entries: Some(1000),
            limit: None,
            policy: EvictionPolicy::Lru,
            compression_threshold: None,
            pressure_ratio: None,
        }
    }
}

#[derive(Debug, Clone)]
struct EntryMeta {
    created: SystemTime,
    expires_at: Option<SystemTime>,
    last_access: SystemTime,
    insert_order: u64,
    access_order: u64,
    compressed: bool,
    original_size: u64,
    stored_size: u64,
}

struct Inner {
    entries: HashMap<String, Vec<u8>>,
    meta: HashMap<String, EntryMeta>,
    insert_seq: u64,
    access_seq: u64,
    current_bytes: u64,
}

/// Map-based storage backend with metadata tracking and memory pressure
/// eviction.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    budget: Option<u64>,
    config: MemoryStorageConfig,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("memory storage poisoned");
        f.debug_struct("MemoryStorage")
            .field("entries", &inner.entries.len())
            .field("current_bytes", &inner.current_bytes)
            .field("budget", &self.budget)
            .field("policy", &self.config.policy)
            .finish()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }
}

impl MemoryStorage {
    /// Create a store, resolving the byte budget up front.
    #[must_use]
    pub fn new(config: MemoryStorageConfig) -> Self {
        let budget = config.limit.map(resolve_budget);
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                meta: HashMap::new(),
                insert_seq: 0,
                access_seq: 0,
                current_bytes: 0,
            }),
            budget,
            config,
        }
    }

    /// Current accounted bytes.
    #[must_use]
    pub fn current_bytes(&self) -> u64 {
        self.inner.lock().expect("memory storage poisoned").current_bytes
    }

    /// Resolved byte budget, if accounting is enabled.
    #[must_use]
    pub fn budget(&self) -> Option<u64> {
        self.budget
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("memory storage poisoned").entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`health_check`](Self::health_check) on a fixed cadence until
    /// the returned task is aborted or the store is dropped.
    pub fn spawn_health_checks(
        self: &std::sync::Arc<Self>,
        every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = std::sync::Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match store.upgrade() {
                    Some(store) => store.health_check(),
                    None => break,
                }
            }
        })
    }

    /// Drop expired entries and enforce the byte budget. When the process
    /// is under memory pressure, evict down to half the store's current
    /// size.
    pub fn health_check(&self) {
        let mut inner = self.inner.lock().expect("memory storage poisoned");
        let now = SystemTime::now();
        let expired: Vec<String> = inner
            .meta
            .iter()
            .filter(|(_, meta)| {
                meta.expires_at.is_some_and(|expiry| expiry <= now)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            remove_entry(&mut inner, &key);
        }
        if let Some(budget) = self.budget {
            evict_to(&mut inner, self.config.policy, budget);
        }
        if let (Some(ratio), Some(pressure)) =
            (self.config.pressure_ratio, process_memory_ratio())
        {
            if pressure > ratio {
                let target = inner.current_bytes / 2;
                log::debug!(
                    "memory pressure {pressure:.2} over {ratio:.2}, evicting to {target} bytes"
                );
                evict_to(&mut inner, self.config.policy, target);
            }
        }
    }
}

#[async_trait::async_trait]
impl CacheStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut inner = self.inner.lock().expect("memory storage poisoned");
        let Some(meta) = inner.meta.get(key) else { return Ok(None) };
        if meta.expires_at.is_some_and(|expiry| expiry <= SystemTime::now()) {
            remove_entry(&mut inner, key);
            return Ok(None);
        }
        let compressed = meta.compressed;
        let Some(stored) = inner.entries.get(key).cloned() else {
            return Ok(None);
        };
        inner.access_seq += 1;
        let seq = inner.access_seq;
        if let Some(meta) = inner.meta.get_mut(key) {
            meta.last_access = SystemTime::now();
            meta.access_order = seq;
        }
        drop(inner);

        let serialized = if compressed {
            let mut decoder = flate2::read::GzDecoder::new(stored.as_slice());
            let mut raw = Vec::new();
            decoder
                .read_to_end(&mut raw)
                .map_err(|e| Error::Storage(format!("decompress: {e}")))?;
            raw
        } else {
            stored
        };
        let entry: CacheEntry = postcard::from_bytes(&serialized)
            .map_err(|e| Error::Storage(format!("decode: {e}")))?;
        Ok(Some(entry))
    }

    async fn set(
        &self,
        key: &str,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let serialized = postcard::to_allocvec(&entry)
            .map_err(|e| Error::Storage(format!("encode: {e}")))?;
        let original_size = serialized.len() as u64;

        let (stored, compressed) = match self.config.compression_threshold {
            Some(threshold) if serialized.len() >= threshold => {
                match gzip(&serialized) {
                    Ok(packed) if packed.len() < serialized.len() => {
                        (packed, true)
                    }
                    // Compression failed or did not help; store raw.
                    _ => (serialized, false),
                }
            }
            _ => (serialized, false),
        };
        let stored_size = stored.len() as u64;

        if let Some(budget) = self.budget {
            if stored_size > budget {
                return Err(Error::Storage(format!(
                    "entry of {stored_size} bytes exceeds memory budget of {budget}"
                )));
            }
        }

        let now = SystemTime::now();
        let mut inner = self.inner.lock().expect("memory storage poisoned");
        remove_entry(&mut inner, key);

        if let Some(budget) = self.budget {
            let headroom = budget.saturating_sub(stored_size);
            evict_to(&mut inner, self.config.policy, headroom);
        }
        if let Some(max_entries) = self.config.max_entries {
            while inner.entries.len() >= max_entries {
                if !evict_one(&mut inner, self.config.policy) {
                    break;
                }
            }
        }

        inner.insert_seq += 1;
        inner.access_seq += 1;
        let meta = EntryMeta {
            created: now,
            expires_at: ttl.map(|t| now + t),
            last_access: now,
            insert_order: inner.insert_seq,
            access_order: inner.access_seq,
            compressed,
            original_size,
            stored_size,
        };
        inner.current_bytes += stored_size;
        inner.entries.insert(key.to_string(), stored);
        inner.meta.insert(key.to_string(), meta);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory storage poisoned");
        remove_entry(&mut inner, key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory storage poisoned");
        inner.entries.clear();
        inner.meta.clear();
        inner.current_bytes = 0;
        Ok(())
    }
}

fn remove_entry(inner: &mut Inner, key: &str) {
    if let Some(meta) = inner.meta.remove(key) {
        inner.current_bytes =
            inner.current_bytes.saturating_sub(meta.stored_size);
    }
    inner.entries.remove(key);
}

fn evict_one(inner: &mut Inner, policy: EvictionPolicy) -> bool {
    let victim = inner
        .meta
        .iter()
        .min_by_key(|(_, meta)| match policy {
            EvictionPolicy::Lru => meta.access_order,
            EvictionPolicy::Fifo => meta.insert_order,
        })
        .map(|(key, _)| key.clone());
    match victim {
        Some(key) => {
            log::trace!("evicting cache entry {key}");
            remove_entry(inner, &key);
            true
        }
        None => false,
    }
}

fn evict_to(inner: &mut Inner, policy: EvictionPolicy, target_bytes: u64) {
    while inner.current_bytes > target_bytes {
        if !evict_one(inner, policy) {
            break;
        }
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::default(),
    );
    encoder.write_all(data)?;
    encoder.finish()
}

fn resolve_budget(limit: MemoryLimit) -> u64 {
    match limit {
        MemoryLimit::Bytes(bytes) => bytes,
        MemoryLimit::FractionOfSystem(fraction) => {
            let total = system_memory_bytes().unwrap_or(u64::MAX);
            (total as f64 * fraction.clamp(0.0, 1.0)) as u64
        }
        MemoryLimit::Auto => {
            let base = cgroup_limit_bytes()
                .or_else(system_memory_bytes)
                .unwrap_or(u64::MAX);
            base / 10
        }
    }
}

fn system_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

fn cgroup_limit_bytes() -> Option<u64> {
    for path in
        ["/sys/fs/cgroup/memory.max", "/sys/fs/cgroup/memory/memory.limit_in_bytes"]
    {
        if let Ok(raw) = std::fs::read_to_string(path) {
            let raw = raw.trim();
            if raw != "max" {
                if let Ok(bytes) = raw.parse::<u64>() {
                    return Some(bytes);
                }
            }
        }
    }
    None
}

fn process_memory_ratio() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 =
        statm.split_whitespace().nth(1)?.parse().ok()?;
    let resident = resident_pages * 4096;
    let total = system_memory_bytes()?;
    Some(resident as f64 / total as f64)
}
