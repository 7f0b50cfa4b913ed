//! Shared in-memory object cache with least-recently-used eviction.
//!
//! Recency is a global access sequence: every hit and every insert takes the
//! next value, and eviction always removes the entry holding the smallest one.
//! All bookkeeping happens under one short lock; bodies are `Bytes`, so handing
//! one out on a hit is a reference-count bump rather than a copy.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// Normalized lookup key: lowercase host, the port when it is not 80, and the path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(host: &str, port: &str, path: &str) -> Self {
        let host = host.to_ascii_lowercase();
        if port == "80" {
            Self(format!("{}{}", host, path))
        } else {
            Self(format!("{}:{}{}", host, port, path))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub size_bytes: usize,
    pub last_access_seq: u64,
}

/// What a hit hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedObject {
    pub body: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { evicted: usize },
    /// Larger than the per-object limit; nothing was touched.
    TooLarge,
    /// Larger than the whole cache; everything was evicted and the object dropped.
    Refused { evicted: usize },
}

impl InsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted { .. })
    }
}

/// Counters kept alongside the entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub rejected: u64,
    pub current_size_bytes: usize,
    pub current_item_count: usize,
    pub max_size_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Access sequence -> key, so the oldest entry is always the first one.
    recency: BTreeMap<u64, CacheKey>,
    total_bytes: usize,
    access_seq: u64,
    stats: CacheStats,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }

    fn evict_one(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.recency.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.total_bytes -= entry.size_bytes;
        self.stats.evictions += 1;
        debug!(key = %entry.key, size = entry.size_bytes, "Evicted cache entry");
        Some(entry)
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_access_seq);
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }
}

/// The object cache shared by all workers.
#[derive(Debug)]
pub struct Cache {
    state: Mutex<CacheState>,
    capacity_bytes: usize,
    max_object_bytes: usize,
}

impl Cache {
    pub fn new(capacity_bytes: usize, max_object_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity_bytes,
            max_object_bytes,
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn max_object_bytes(&self) -> usize {
        self.max_object_bytes
    }

    /// Find `key` and mark it most recently used.
    pub fn lookup(&self, key: &CacheKey) -> Option<CachedObject> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(key) else {
            state.stats.misses += 1;
            return None;
        };
        state.access_seq += 1;
        let seq = state.access_seq;
        let previous = std::mem::replace(&mut entry.last_access_seq, seq);
        let hit = CachedObject {
            body: entry.body.clone(),
            content_type: entry.content_type.clone(),
        };
        state.recency.remove(&previous);
        state.recency.insert(seq, key.clone());
        state.stats.hits += 1;
        Some(hit)
    }

    /// Store `body` under `key`, evicting least recently used entries until it fits.
    /// The cache owns the buffer from here on.
    pub fn insert(&self, key: CacheKey, body: Bytes, content_type: Option<String>) -> InsertOutcome {
        let size = body.len();
        if size > self.max_object_bytes {
            self.state.lock().stats.rejected += 1;
            debug!(key = %key, size, "Object too large to cache");
            return InsertOutcome::TooLarge;
        }

        let mut state = self.state.lock();
        // A concurrent miss may already have stored this key.
        state.remove(&key);

        let mut evicted = 0;
        while state.total_bytes + size > self.capacity_bytes {
            if state.evict_one().is_none() {
                break;
            }
            evicted += 1;
        }
        if state.total_bytes + size > self.capacity_bytes {
            state.stats.rejected += 1;
            debug!(key = %key, size, "Object larger than cache capacity");
            return InsertOutcome::Refused { evicted };
        }

        let seq = state.next_seq();
        state.recency.insert(seq, key.clone());
        state.total_bytes += size;
        state.stats.inserts += 1;
        debug!(key = %key, size, evicted, total = state.total_bytes, "Cached object");
        state.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                body,
                content_type,
                size_bytes: size,
                last_access_seq: seq,
            },
        );
        InsertOutcome::Inserted { evicted }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Whether `key` is present, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            current_size_bytes: state.total_bytes,
            current_item_count: state.entries.len(),
            max_size_bytes: self.capacity_bytes,
            ..state.stats.clone()
        }
    }
}
