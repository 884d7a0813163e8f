//! TTL + LRU response cache keyed by request fingerprint.
//!
//! Entries carry their own TTL. Expiry is checked on every read, so a stale
//! entry is never returned even before it is physically purged. When the
//! store is full the least-recently-used entry is evicted.

use lex_core::config::CacheSettings;
use lru::LruCache;
use ring::digest;
use serde::Serialize;
use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// TTL used when the caller has no better idea.
    pub default_ttl: Duration,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(s: &CacheSettings) -> Self {
        Self {
            enabled: s.enabled,
            default_ttl: Duration::from_secs(s.ttl_seconds),
            max_size: s.max_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub max_size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Bounded in-memory cache. All operations are synchronous and short.
#[derive(Debug)]
pub struct Cache<V> {
    config: CacheConfig,
    store: Mutex<LruCache<String, CacheEntry<V>>>,
    counters: Counters,
}

impl<V: Clone> Cache<V> {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            store: Mutex::new(LruCache::new(capacity)),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn store(&self) -> MutexGuard<'_, LruCache<String, CacheEntry<V>>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Value for `key` if present and unexpired. An expired entry is removed
    /// and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.config.enabled {
            return None;
        }
        let now = Instant::now();
        let mut store = self.store();

        let expired = match store.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            store.pop(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or overwrite `key`, restarting its expiry clock.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        if !self.config.enabled || ttl.is_zero() {
            return;
        }
        let key = key.into();
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        let mut store = self.store();
        if let Some((evicted, _)) = store.push(key.clone(), entry) {
            // push also hands back the previous value of an overwritten key
            if evicted != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %evicted, "cache evicted least-recently-used entry");
            }
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// `set` with the configured default TTL.
    pub fn set_default(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.config.default_ttl);
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.store().pop(key).is_some()
    }

    pub fn clear(&self) {
        self.store().clear();
    }

    /// Physically remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut store = self.store();
        let expired: Vec<String> = store
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            store.pop(key);
        }
        self.counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot. Reads only; LRU order is not touched.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.config.enabled,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            size: self.len(),
            max_size: self.config.max_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Deterministic cache key for `operation` called with `params`.
///
/// Object keys are sorted at every depth before hashing, so two parameter
/// objects built in different orders share a key. `null` is treated as `{}`.
pub fn fingerprint(operation: &str, params: &serde_json::Value) -> String {
    let mut canonical = String::new();
    match params {
        serde_json::Value::Null => canonical.push_str("{}"),
        other => write_canonical(other, &mut canonical),
    }
    let hash = digest::digest(&digest::SHA256, canonical.as_bytes());
    let mut out = String::with_capacity(operation.len() + 1 + 64);
    out.push_str(operation);
    out.push(':');
    for byte in hash.as_ref() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Compact JSON with object keys sorted.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let v = json!({"b": 1, "a": {"z": [1, {"y": 2, "x": 3}], "c": "s"}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"c":"s","z":[1,{"x":3,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn fingerprint_shape() {
        let fp = fingerprint("get_opinion", &json!({"opinion_id": 1}));
        let (op, hash) = fp.split_once(':').unwrap();
        assert_eq!(op, "get_opinion");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn null_params_equal_empty_object() {
        assert_eq!(
            fingerprint("list_courts", &serde_json::Value::Null),
            fingerprint("list_courts", &json!({}))
        );
    }
}
