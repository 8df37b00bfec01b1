use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::builder::BlockBuilder;
use crate::block::Block;
use crate::cache::{BlockCache, CacheKey};

fn block_of(key: &str) -> Arc<Block> {
    let mut builder = BlockBuilder::new(4096);
    assert!(builder.add(key.as_bytes(), b"value"));
    Arc::new(builder.build())
}

#[test]
fn test_get_and_insert() {
    let cache = BlockCache::new(4);
    assert!(cache.is_empty());
    cache.insert((1, 0), block_of("a"));
    assert_eq!(cache.len(), 1);
    assert!(cache.get(&(1, 0)).is_some());
    assert!(cache.get(&(1, 1)).is_none());
    assert_eq!(cache.cap(), 4);
}

#[test]
fn test_strict_lru_eviction_order() {
    let evicted: Arc<Mutex<Vec<CacheKey>>> = Arc::new(Mutex::new(Vec::new()));
    let log = evicted.clone();
    let cache = BlockCache::with_observer(
        2,
        Box::new(move |key, _block, _at| {
            log.lock().unwrap().push(*key);
        }),
    );

    cache.insert((1, 0), block_of("a"));
    cache.insert((1, 1), block_of("b"));
    // refresh (1, 0) so (1, 1) becomes the least recently used
    assert!(cache.get(&(1, 0)).is_some());
    cache.insert((1, 2), block_of("c"));

    assert_eq!(*evicted.lock().unwrap(), vec![(1, 1)]);
    assert!(cache.get(&(1, 0)).is_some());
    assert!(cache.get(&(1, 1)).is_none());
    assert!(cache.get(&(1, 2)).is_some());
}

#[test]
fn test_overwrite_does_not_fire_observer() {
    let evictions = Arc::new(AtomicUsize::new(0));
    let count = evictions.clone();
    let cache = BlockCache::with_observer(
        2,
        Box::new(move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
        }),
    );
    cache.insert((1, 0), block_of("a"));
    cache.insert((1, 0), block_of("b"));
    assert_eq!(cache.len(), 1);
    assert_eq!(evictions.load(Ordering::SeqCst), 0);
}

#[test]
fn test_get_or_compute_runs_producer_once() {
    let cache = BlockCache::new(4);
    let computed = AtomicUsize::new(0);

    let block = cache
        .get_or_compute((7, 3), || {
            computed.fetch_add(1, Ordering::SeqCst);
            Ok(block_of("x"))
        })
        .unwrap();
    assert_eq!(block.num_entries(), 1);

    cache
        .get_or_compute((7, 3), || {
            computed.fetch_add(1, Ordering::SeqCst);
            Ok(block_of("x"))
        })
        .unwrap();
    assert_eq!(computed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_get_or_compute_propagates_producer_error() {
    let cache = BlockCache::new(4);
    let result = cache.get_or_compute((7, 3), || anyhow::bail!("disk exploded"));
    assert!(result.is_err());
    // nothing was cached
    assert!(cache.get(&(7, 3)).is_none());
}

#[test]
fn test_contains_remove_clear() {
    let cache = BlockCache::new(4);
    cache.insert((1, 0), block_of("a"));
    cache.insert((1, 1), block_of("b"));
    assert!(cache.contains(&(1, 0)));
    assert!(!cache.contains(&(9, 9)));

    assert!(cache.remove(&(1, 0)));
    assert!(!cache.remove(&(1, 0)));
    assert_eq!(cache.len(), 1);

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.size_bytes(), 0);
}

#[test]
fn test_size_bytes_tracks_evictions() {
    let cache = BlockCache::new(2);
    cache.insert((1, 0), block_of("a"));
    cache.insert((1, 1), block_of("b"));
    let full = cache.size_bytes();
    assert!(full > 0);
    cache.insert((1, 2), block_of("c"));
    // one in, one out: byte accounting stays balanced
    assert_eq!(cache.size_bytes(), full);
    assert_eq!(cache.len(), 2);
}
