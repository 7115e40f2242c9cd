use crate::filters::FilterSetHash;
use crate::key::CanonicalKey;
use chrono::{DateTime, Utc};
use formula_storage::{Storage, StorageError};
use log::{debug, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

const PERSISTED_PREFIX: &str = "cache:";
/// Bumped on every invalidation. Kept outside `cache:` so clearing the cache
/// never resets a generation.
const GENERATION_PREFIX: &str = "cache-generation:";
const ALL_FILTER_SETS: &str = "*";

/// Where a cached value came from. Ordered by confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Copied from another confirmed entry (e.g. promoted from the persisted tier).
    CacheHit,
    /// Returned by the ledger service.
    CollaboratorResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CanonicalKey,
    pub value: f64,
    pub confirmed_at: DateTime<Utc>,
    pub provenance: Provenance,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub persisted_hits: u64,
    pub misses: u64,
    pub confirmations: u64,
    pub evictions: u64,
    pub persist_failures: u64,
    /// Memory entries dropped because some context invalidated them.
    pub stale_drops: u64,
}

/// Invalidation counters (the store's write versions of the generation keys)
/// observed when an entry entered memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Generation {
    all: i64,
    filter_set: i64,
}

struct Cached {
    entry: CacheEntry,
    generation: Generation,
}

struct Inner {
    entries: LruCache<CanonicalKey, Cached>,
    stats: CacheStats,
}

impl Inner {
    /// Insert unless a more confident entry of the same generation is already
    /// present. Returns the entry that ends up cached.
    fn admit(&mut self, entry: CacheEntry, generation: Generation) -> CacheEntry {
        if let Some(existing) = self.entries.get(&entry.key) {
            if existing.generation == generation && existing.entry.provenance > entry.provenance {
                return existing.entry.clone();
            }
        }
        let cached = Cached {
            entry: entry.clone(),
            generation,
        };
        if let Some((evicted, _)) = self.entries.push(entry.key.clone(), cached) {
            if evicted != entry.key {
                self.stats.evictions = self.stats.evictions.saturating_add(1);
            }
        }
        entry
    }
}

/// Two-tier store of confirmed values.
///
/// The memory tier is a bounded LRU. Every confirmed value is also written to
/// the persisted tier under `cache:<canonical key>`, which is unbounded and
/// shared with other execution contexts; a miss in memory consults it and
/// promotes what it finds.
///
/// Invalidations made by any context bump a generation in the store. [`get`]
/// compares it against the generation a memory entry was admitted under and
/// drops entries another context invalidated. [`snapshot`] never reads the
/// store, so it can keep returning such an entry until the next `get`.
///
/// Nothing but a collaborator-confirmed number ever enters the cache.
///
/// [`get`]: ValueCache::get
/// [`snapshot`]: ValueCache::snapshot
#[derive(Clone)]
pub struct ValueCache {
    storage: Storage,
    inner: Arc<Mutex<Inner>>,
}

impl ValueCache {
    pub fn new(storage: Storage, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            storage,
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::new(cap),
                stats: CacheStats::default(),
            })),
        }
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<CacheEntry> {
        let generation = self.generation(key.filter_component());
        {
            let mut guard = self.inner.lock().expect("value cache mutex poisoned");
            let inner = &mut *guard;
            match inner.entries.get(key) {
                // Unknown generation (store unreachable): trust memory.
                Some(cached) if generation.map_or(true, |g| g == cached.generation) => {
                    inner.stats.memory_hits = inner.stats.memory_hits.saturating_add(1);
                    return Some(cached.entry.clone());
                }
                Some(_) => {
                    inner.entries.pop(key);
                    debug!("dropping {key}: invalidated by another context");
                    inner.stats.stale_drops = inner.stats.stale_drops.saturating_add(1);
                }
                None => {}
            }
        }

        let persisted = self.load_persisted(key);

        let mut inner = self.inner.lock().expect("value cache mutex poisoned");
        match persisted {
            Some(mut entry) => {
                entry.provenance = Provenance::CacheHit;
                inner.stats.persisted_hits = inner.stats.persisted_hits.saturating_add(1);
                Some(inner.admit(entry, generation.unwrap_or_default()))
            }
            None => {
                inner.stats.misses = inner.stats.misses.saturating_add(1);
                None
            }
        }
    }

    /// Memory-only peek. Never touches storage, never changes recency.
    pub fn snapshot(&self, key: &CanonicalKey) -> Option<f64> {
        let inner = self.inner.lock().expect("value cache mutex poisoned");
        inner.entries.peek(key).map(|cached| cached.entry.value)
    }

    /// Record a value the collaborator just returned. This is the only way a
    /// value enters the cache.
    pub(crate) fn confirm(&self, key: &CanonicalKey, value: f64) -> CacheEntry {
        let generation = self.generation(key.filter_component()).unwrap_or_default();
        let entry = CacheEntry {
            key: key.clone(),
            value,
            confirmed_at: Utc::now(),
            provenance: Provenance::CollaboratorResponse,
        };

        let persisted = serde_json::to_string(&entry)
            .map_err(|err| err.to_string())
            .and_then(|json| {
                self.storage
                    .put(&persisted_key(key), &json)
                    .map_err(|err| err.to_string())
            });

        let mut inner = self.inner.lock().expect("value cache mutex poisoned");
        inner.stats.confirmations = inner.stats.confirmations.saturating_add(1);
        if let Err(err) = persisted {
            inner.stats.persist_failures = inner.stats.persist_failures.saturating_add(1);
            warn!("failed to persist cache entry {key}: {err}");
        }
        inner.admit(entry, generation)
    }

    pub fn invalidate_filter_set(&self, filter_hash: &FilterSetHash) -> Result<usize, StorageError> {
        let prefix = CanonicalKey::filter_prefix(filter_hash);
        let removed_memory = {
            let mut inner = self.inner.lock().expect("value cache mutex poisoned");
            let doomed: Vec<CanonicalKey> = inner
                .entries
                .iter()
                .filter(|(key, _)| key.as_str().starts_with(&prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &doomed {
                inner.entries.pop(key);
            }
            doomed.len()
        };
        let removed_persisted = self
            .storage
            .delete_prefix(&format!("{PERSISTED_PREFIX}{prefix}"))?;
        self.bump_generation(filter_hash.as_str())?;
        debug!(
            "invalidated filter set {filter_hash}: {removed_memory} in memory, {removed_persisted} persisted"
        );
        Ok(removed_persisted.max(removed_memory))
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.inner
            .lock()
            .expect("value cache mutex poisoned")
            .entries
            .clear();
        self.storage.delete_prefix(PERSISTED_PREFIX)?;
        self.bump_generation(ALL_FILTER_SETS)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("value cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().expect("value cache mutex poisoned").stats
    }

    /// Current invalidation generation for one filter set, or `None` when the
    /// store cannot be read.
    fn generation(&self, filter_hash: &str) -> Option<Generation> {
        let version = |scope: &str| match self.storage.get_versioned(&generation_key(scope)) {
            Ok(stored) => Some(stored.map_or(0, |stored| stored.version)),
            Err(err) => {
                warn!("cache generation lookup for {scope} failed: {err}");
                None
            }
        };
        Some(Generation {
            all: version(ALL_FILTER_SETS)?,
            filter_set: version(filter_hash)?,
        })
    }

    fn bump_generation(&self, scope: &str) -> Result<(), StorageError> {
        self.storage
            .put(&generation_key(scope), &Utc::now().to_rfc3339())
    }

    fn load_persisted(&self, key: &CanonicalKey) -> Option<CacheEntry> {
        let raw = match self.storage.get(&persisted_key(key)) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!("persisted cache lookup for {key} failed; treating as a miss: {err}");
                return None;
            }
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.key == *key && entry.value.is_finite() => Some(entry),
            Ok(_) => {
                warn!("persisted cache entry for {key} does not match its key; ignoring");
                None
            }
            Err(err) => {
                warn!("persisted cache entry for {key} is corrupt; ignoring: {err}");
                None
            }
        }
    }
}

fn persisted_key(key: &CanonicalKey) -> String {
    format!("{PERSISTED_PREFIX}{key}")
}

fn generation_key(scope: &str) -> String {
    format!("{GENERATION_PREFIX}{scope}")
}
