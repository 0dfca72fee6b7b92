//! Bounded, time-limited memo of store read results.
//!
//! Keys are call signatures prefixed with the record kind they read
//! (`tx:`, `hook:`, `file:`). Eviction is least-recently-inserted: reads use
//! `peek`, so a hit never refreshes an entry's position. Mutations drop every
//! key under the affected kind's prefix plus the stats entry.

use crate::store::StoreStats;
use actlog_types::{Hook, IndexedFile, Transaction};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Default number of memoized results.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Default lifetime of a memoized result.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Key of the memoized `stats()` result. Invalidated by every mutation.
pub const STATS_KEY: &str = "stats";

/// Record kinds, as far as cache invalidation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Transaction,
    Hook,
    IndexedFile,
}

impl RecordKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RecordKind::Transaction => "tx:",
            RecordKind::Hook => "hook:",
            RecordKind::IndexedFile => "file:",
        }
    }

    /// Build a cache key for an operation and its arguments.
    pub fn key(&self, op: &str, args: std::fmt::Arguments<'_>) -> String {
        format!("{}{}:{}", self.prefix(), op, args)
    }
}

#[derive(Debug, Clone)]
pub enum CachedValue {
    Transaction(Option<Transaction>),
    Transactions(Vec<Transaction>),
    Hook(Option<Hook>),
    Hooks(Vec<Hook>),
    IndexedFile(Option<IndexedFile>),
    Stats(StoreStats),
}

struct CacheEntry {
    value: CachedValue,
    inserted_at: Instant,
}

/// Hit/miss counters, mostly for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
}

pub struct QueryCache {
    entries: LruCache<String, CacheEntry>,
    ttl: Duration,
    counters: CacheCounters,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
            counters: CacheCounters::default(),
        }
    }

    /// Look up a live entry without refreshing its position.
    pub fn get(&mut self, key: &str) -> Option<CachedValue> {
        let expired = match self.entries.peek(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.counters.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.pop(key);
        }
        self.counters.misses += 1;
        None
    }

    pub fn insert(&mut self, key: String, value: CachedValue) {
        self.entries.put(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every entry under `kind`'s prefix, and the stats entry.
    pub fn invalidate(&mut self, kind: RecordKind) {
        let prefix = kind.prefix();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.entries.pop(&key);
        }
        self.entries.pop(STATS_KEY);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counters(&self) -> CacheCounters {
        self.counters
    }
}
