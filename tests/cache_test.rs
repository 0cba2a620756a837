use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use query_resilience::cache_key::{by_search_params, by_user_and_operation};
use query_resilience::{
    generate_key, tags, CacheConfig, CacheOptions, CachedOperation, InvalidatingOperation, QueryCache,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Word {
    word: String,
    definition: String,
}

#[tokio::test(start_paused = true)]
async fn test_word_lookup_hit_then_invalidate_then_recompute() {
    let cache: QueryCache<Value> = QueryCache::new(CacheConfig::default());
    let skeer = json!({ "word": "skeer", "definition": "broke, out of money" });

    cache.set("word:skeer", skeer.clone(), Some(Duration::from_secs(5 * 60)), &[tags::WORDS]);

    tokio::time::advance(Duration::from_secs(4 * 60)).await;
    assert_eq!(cache.get("word:skeer"), Some(skeer.clone()));
    assert_eq!(cache.statistics().hits(), 1);

    assert_eq!(cache.invalidate_by_tags(&[tags::WORDS]), 1);
    assert_eq!(cache.get("word:skeer"), None);
    assert_eq!(cache.statistics().misses(), 1);

    let fetches = AtomicUsize::new(0);
    let recomputed = cache
        .get_or_set(
            "word:skeer",
            || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(json!({ "word": "skeer", "definition": "blut" }))
            },
            None,
            &[tags::WORDS],
        )
        .await
        .unwrap();

    assert_eq!(recomputed["definition"], "blut");
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(cache.contains("word:skeer"));
}

#[tokio::test(start_paused = true)]
async fn test_entries_expire_at_their_ttl() {
    let cache: QueryCache<Value> = QueryCache::new(CacheConfig::new(Duration::from_secs(60), 10));
    cache.set("short", json!(1), Some(Duration::from_secs(10)), &[]);
    cache.set("default", json!(2), None, &[]);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(cache.get("short"), None);
    assert_eq!(cache.get("default"), Some(json!(2)));

    tokio::time::advance(Duration::from_secs(50)).await;
    assert_eq!(cache.get("default"), None);
    assert!(cache.is_empty());
}

#[test]
fn test_capacity_evicts_least_recently_used() {
    let cache: QueryCache<Value> = QueryCache::new(CacheConfig::new(Duration::from_secs(60), 10));
    for i in 0..10 {
        cache.set(&format!("k{i}"), json!(i), None, &[]);
    }
    // k0 becomes the most recently used entry
    assert!(cache.get("k0").is_some());

    cache.set("k10", json!(10), None, &[]);

    assert_eq!(cache.len(), 10);
    assert!(cache.contains("k0"));
    assert!(!cache.contains("k1"));
    assert!(cache.contains("k10"));
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn test_typed_cache_and_stats() {
    let cache: QueryCache<Vec<Word>> = QueryCache::new(CacheConfig::default());
    let words = vec![Word {
        word: "gezellig".to_string(),
        definition: "cosy".to_string(),
    }];
    let key = by_search_params("gez", Some(20), None);

    cache.set(&key, words.clone(), None, &[tags::WORDS, tags::DAILY_WORDS]);
    assert_eq!(cache.get(&key), Some(words));
    assert_eq!(cache.get("missing"), None);

    let stats = cache.stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate, 0.5);
    assert!(stats.memory_bytes > 100);
    assert!(stats.oldest_entry.is_some());
}

#[test]
fn test_generated_keys_are_order_independent() {
    let a = generate_key("WordService.search", &json!({ "limit": 10, "query": "huis" }));
    let b = generate_key("WordService.search", &json!({ "query": "huis", "limit": 10 }));

    assert_eq!(a, b);
    assert_eq!(a, "WordService.search:limit:10|query:\"huis\"");
    assert_ne!(
        by_user_and_operation("u1", "progress", &[]),
        by_user_and_operation("u2", "progress", &[])
    );
}

#[tokio::test]
async fn test_decorated_reads_are_purged_by_decorated_writes() {
    let cache = Arc::new(QueryCache::new(CacheConfig::default()));
    let reads = AtomicUsize::new(0);

    let search = CachedOperation::new(
        cache.clone(),
        "WordService.search",
        CacheOptions::new().with_tags([tags::WORDS, tags::DAILY_WORDS]),
        |query: String| {
            reads.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(json!([query])) }
        },
    );
    let add_word = InvalidatingOperation::new(
        cache.clone(),
        "WordService.add",
        [tags::WORDS],
        |word: String| async move { Ok::<_, String>(word) },
    );

    search.call("fiets".to_string()).await.unwrap();
    search.call("fiets".to_string()).await.unwrap();
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    add_word.call("fietsen".to_string()).await.unwrap();
    search.call("fiets".to_string()).await.unwrap();
    assert_eq!(reads.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_removes_expired_entries_in_background() {
    let config = CacheConfig::new(Duration::from_secs(5), 100).with_cleanup_interval(Duration::from_secs(60));
    let cache: Arc<QueryCache<Value>> = Arc::new(QueryCache::new(config));
    cache.start_sweeper();
    cache.set("a", json!(1), None, &[]);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(cache.inspect("a").is_none());

    cache.destroy();
    assert!(cache.is_empty());
}
