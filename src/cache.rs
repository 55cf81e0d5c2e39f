//! Bounded in-process caches with TTL.
//!
//! Four named caches back the hot paths: resolved mappings, query
//! embeddings, search responses, and FHIR responses. Each is an LRU map
//! whose entries also expire by wall clock; expired entries are dropped on
//! read. Counters feed the admin stats endpoint. Values are cloned out, so
//! concurrent readers never hold the lock across awaits.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::CacheConfig;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of one cache's counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_rate: f64,
}

/// LRU cache with per-entry TTL.
pub struct TtlCache<V> {
    inner: Mutex<LruCache<String, Entry<V>>>,
    ttl: Duration,
    counters: Counters,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            counters: Counters::default(),
        }
    }

    /// Returns the value iff present and unexpired; an expired entry is
    /// removed and counted as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut cache = self.inner.lock();
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                cache.pop(key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: String, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        let mut cache = self.inner.lock();
        let at_capacity = cache.len() == usize::from(cache.cap());
        if at_capacity && !cache.contains(&key) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        cache.put(key, entry);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            size: self.inner.lock().len(),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}

/// The four named caches.
pub struct CacheRegistry {
    pub mappings: TtlCache<crate::service::MappingPayload>,
    pub embeddings: TtlCache<Vec<f32>>,
    pub search: TtlCache<serde_json::Value>,
    pub fhir: TtlCache<serde_json::Value>,
}

impl CacheRegistry {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            mappings: TtlCache::new(config.mappings_capacity, config.mappings_ttl),
            embeddings: TtlCache::new(config.embeddings_capacity, config.embeddings_ttl),
            search: TtlCache::new(config.search_capacity, config.search_ttl),
            fhir: TtlCache::new(config.fhir_capacity, config.fhir_ttl),
        }
    }

    pub fn clear_all(&self) {
        self.mappings.clear();
        self.embeddings.clear();
        self.search.clear();
        self.fhir.clear();
    }
}

/// Key for the mappings cache.
pub fn mapping_key(system: crate::models::SourceSystem, code: &str) -> String {
    format!("{}:{}", system.as_str(), code)
}

/// Key for the embeddings cache: deterministic truncation to the first 100
/// characters of the input text.
pub fn embedding_key(text: &str) -> String {
    text.chars().take(100).collect()
}

/// Key for the search/fhir response caches: normalized path plus sorted
/// query parameters plus an optional body hash.
pub fn response_key(
    path: &str,
    query: &[(String, String)],
    body: Option<&serde_json::Value>,
) -> String {
    let mut pairs: Vec<&(String, String)> = query.iter().collect();
    pairs.sort();
    let mut key = String::from(path.trim_end_matches('/'));
    for (name, value) in pairs {
        key.push('&');
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    if let Some(body) = body {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        body.to_string().hash(&mut hasher);
        key.push('#');
        key.push_str(&hasher.finish().to_string());
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_set_round_trip() {
        let cache: TtlCache<i32> = TtlCache::new(4, Duration::from_secs(60));
        cache.set("a".into(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache: TtlCache<i32> = TtlCache::new(4, Duration::from_millis(0));
        cache.set("a".into(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache: TtlCache<i32> = TtlCache::new(2, Duration::from_secs(60));
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        cache.set("c".into(), 3);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache: TtlCache<i32> = TtlCache::new(4, Duration::from_secs(60));
        cache.set("a".into(), 1);
        cache.invalidate("a");
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn embedding_key_truncates_at_100_chars() {
        let long = "x".repeat(250);
        assert_eq!(embedding_key(&long).chars().count(), 100);
        // Multi-byte characters count as characters, not bytes.
        let native = "ज्वर".repeat(50);
        assert_eq!(embedding_key(&native).chars().count(), 100);
    }

    #[test]
    fn response_key_sorts_query_params() {
        let a = response_key(
            "/autocomplete/source",
            &[("q".into(), "fev".into()), ("limit".into(), "5".into())],
            None,
        );
        let b = response_key(
            "/autocomplete/source",
            &[("limit".into(), "5".into()), ("q".into(), "fev".into())],
            None,
        );
        assert_eq!(a, b);
    }
}
