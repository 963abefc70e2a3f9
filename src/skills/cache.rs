//! Bounded LRU maps with per-entry absolute expiry.
//!
//! Three named tiers back the skill loaders: metadata (hot, large),
//! content (warm, medium), resources (cold, small). Operations are
//! internally locked; per-key atomicity holds, cross-key ordering does not.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    last_used: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub max_size: usize,
}

pub struct TtlCache<K, V> {
    name: &'static str,
    max_size: usize,
    default_ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(name: &'static str, max_size: usize, default_ttl: Duration) -> Self {
        Self {
            name,
            max_size: max_size.max(1),
            default_ttl,
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get a value, deleting it first if it has outlived its ttl.
    pub fn get(&self, key: &K) -> Option<V> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) => {
                if entry.inserted_at.elapsed() > entry.ttl {
                    entries.remove(key);
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                } else {
                    entry.last_used = tick;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(entry.value.clone())
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            // Evict the least-recently-used entry.
            if let Some(lru) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                ttl,
                last_used: tick,
            },
        );
    }

    pub fn delete(&self, key: &K) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    /// Liveness check that does not count as a hit or miss and does not
    /// refresh recency.
    pub fn contains(&self, key: &K) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .map(|e| e.inserted_at.elapsed() <= e.ttl)
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries past their expiry without touching live ones.
    pub fn prune_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() <= e.ttl);
        let removed = before - entries.len();
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Evict roughly `fraction` of entries in LRU order. Used by the memory
    /// cleaner under pressure. Returns the number of entries removed.
    pub fn evict_fraction(&self, fraction: f64) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        let mut entries = self.entries.lock().unwrap();
        let target = ((entries.len() as f64) * fraction).ceil() as usize;
        if target == 0 {
            return 0;
        }
        let mut order: Vec<(K, u64)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_used))
            .collect();
        order.sort_by_key(|(_, used)| *used);
        let mut removed = 0;
        for (key, _) in order.into_iter().take(target) {
            entries.remove(&key);
            removed += 1;
        }
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size: self.len(),
            max_size: self.max_size,
        }
    }
}

/// The three cache tiers shared by the loaders, the cleaner and the
/// preload manager.
pub struct CacheSet {
    pub metadata: std::sync::Arc<TtlCache<String, std::sync::Arc<super::metadata::SkillMetadata>>>,
    pub content: std::sync::Arc<TtlCache<String, std::sync::Arc<super::content::SkillContent>>>,
    pub resources:
        std::sync::Arc<TtlCache<String, std::sync::Arc<super::resources::SkillResources>>>,
}

impl CacheSet {
    pub fn new(cfg: &crate::config::CacheConfig) -> Self {
        Self {
            metadata: std::sync::Arc::new(TtlCache::new(
                "metadata",
                cfg.metadata_size,
                Duration::from_secs(cfg.metadata_ttl_secs),
            )),
            content: std::sync::Arc::new(TtlCache::new(
                "content",
                cfg.content_size,
                Duration::from_secs(cfg.content_ttl_secs),
            )),
            resources: std::sync::Arc::new(TtlCache::new(
                "resources",
                cfg.resources_size,
                Duration::from_secs(cfg.resources_ttl_secs),
            )),
        }
    }

    pub fn invalidate_skill(&self, name: &str) {
        let key = name.to_lowercase();
        self.metadata.delete(&key);
        self.content.delete(&key);
        self.resources.delete(&key);
    }
}
