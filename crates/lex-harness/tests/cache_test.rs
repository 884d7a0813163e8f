use lex_harness::cache::{fingerprint, Cache, CacheConfig};
use serde_json::json;
use std::time::Duration;

fn cache(max_size: usize) -> Cache<String> {
    Cache::new(CacheConfig {
        enabled: true,
        default_ttl: Duration::from_secs(300),
        max_size,
    })
}

const TTL: Duration = Duration::from_secs(30);

#[tokio::test(start_paused = true)]
async fn set_then_get_returns_value() {
    let c = cache(10);
    c.set("k", "v".to_string(), TTL);
    assert_eq!(c.get("k").as_deref(), Some("v"));

    let stats = c.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.sets, 1);
    assert_eq!(stats.size, 1);
}

#[tokio::test(start_paused = true)]
async fn entry_expires_after_ttl() {
    let c = cache(10);
    c.set("k", "v".to_string(), TTL);

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(c.get("k").is_some());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(c.get("k").is_none());

    let stats = c.stats();
    assert_eq!(stats.expirations, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.size, 0);
}

#[tokio::test(start_paused = true)]
async fn overwrite_restarts_expiry_clock() {
    let c = cache(10);
    c.set("k", "old".to_string(), TTL);
    tokio::time::advance(Duration::from_secs(20)).await;
    c.set("k", "new".to_string(), TTL);
    tokio::time::advance(Duration::from_secs(20)).await;

    assert_eq!(c.get("k").as_deref(), Some("new"));
    assert_eq!(c.stats().evictions, 0);
}

#[tokio::test(start_paused = true)]
async fn per_entry_ttl() {
    let c = cache(10);
    c.set("short", "a".to_string(), Duration::from_secs(5));
    c.set("long", "b".to_string(), Duration::from_secs(500));
    tokio::time::advance(Duration::from_secs(6)).await;

    assert!(c.get("short").is_none());
    assert!(c.get("long").is_some());
}

#[tokio::test(start_paused = true)]
async fn full_cache_evicts_least_recently_used() {
    let c = cache(2);
    c.set("a", "1".to_string(), TTL);
    c.set("b", "2".to_string(), TTL);
    // touch a so b becomes the LRU entry
    assert!(c.get("a").is_some());
    c.set("c", "3".to_string(), TTL);

    assert!(c.get("b").is_none());
    assert!(c.get("a").is_some());
    assert!(c.get("c").is_some());
    assert_eq!(c.stats().evictions, 1);
    assert_eq!(c.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn disabled_cache_never_stores() {
    let c: Cache<String> = Cache::new(CacheConfig {
        enabled: false,
        default_ttl: TTL,
        max_size: 0,
    });
    c.set("k", "v".to_string(), TTL);
    assert!(c.get("k").is_none());
    assert!(c.is_empty());
    assert!(!c.stats().enabled);
}

#[tokio::test(start_paused = true)]
async fn purge_invalidate_clear() {
    let c = cache(10);
    c.set("old", "1".to_string(), Duration::from_secs(1));
    c.set("keep", "2".to_string(), TTL);
    c.set_default("default", "3".to_string());
    tokio::time::advance(Duration::from_secs(2)).await;

    assert_eq!(c.purge_expired(), 1);
    assert_eq!(c.len(), 2);

    assert!(c.invalidate("keep"));
    assert!(!c.invalidate("keep"));
    c.clear();
    assert!(c.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stats_reads_are_pure() {
    let c = cache(10);
    c.set("k", "v".to_string(), TTL);
    c.get("k");
    c.get("missing");
    let first = c.stats();
    let second = c.stats();
    assert_eq!(first, second);
    assert!((first.hit_rate() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn fingerprint_ignores_key_order() {
    let a = json!({"query": "miranda", "court": "scotus", "page_size": 20});
    let b = json!({"page_size": 20, "court": "scotus", "query": "miranda"});
    assert_eq!(fingerprint("search_opinions", &a), fingerprint("search_opinions", &b));
}

#[test]
fn fingerprint_distinguishes_operation_and_values() {
    let params = json!({"id": 1});
    assert_ne!(fingerprint("get_opinion", &params), fingerprint("get_cluster", &params));
    assert_ne!(
        fingerprint("get_opinion", &params),
        fingerprint("get_opinion", &json!({"id": 2}))
    );
    // "1" and 1 are different inputs
    assert_ne!(
        fingerprint("get_opinion", &params),
        fingerprint("get_opinion", &json!({"id": "1"}))
    );
}
