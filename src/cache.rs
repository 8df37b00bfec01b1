use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;

use crate::block::Block;

/// Cache key: (table id, block index within the table).
pub type CacheKey = (usize, usize);

/// Called for every entry pushed out by capacity, with the wall-clock time of
/// the eviction.
pub type EvictionObserver = Box<dyn Fn(&CacheKey, &Arc<Block>, SystemTime) + Send + Sync>;

struct CacheInner {
    entries: LruCache<CacheKey, Arc<Block>>,
    size_bytes: usize,
}

/// Bounded LRU over decoded blocks, shared by every table of one engine.
/// Capacity counts entries; eviction is strict least-recently-used. All
/// operations take the internal lock, so the cache is safe for concurrent
/// use.
pub struct BlockCache {
    inner: Mutex<CacheInner>,
    observer: Option<EvictionObserver>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache").finish_non_exhaustive()
    }
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self::create(capacity, None)
    }

    pub fn with_observer(capacity: usize, observer: EvictionObserver) -> Self {
        Self::create(capacity, Some(observer))
    }

    fn create(capacity: usize, observer: Option<EvictionObserver>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                size_bytes: 0,
            }),
            observer,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Block>> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, block: Arc<Block>) {
        let mut inner = self.inner.lock();
        self.insert_inner(&mut inner, key, block);
    }

    /// Atomic check-then-insert. On a miss the producer runs while the lock
    /// is held, so a missing block is loaded exactly once.
    pub fn get_or_compute(
        &self,
        key: CacheKey,
        produce: impl FnOnce() -> Result<Arc<Block>>,
    ) -> Result<Arc<Block>> {
        let mut inner = self.inner.lock();
        if let Some(hit) = inner.entries.get(&key) {
            return Ok(hit.clone());
        }
        let block = produce()?;
        self.insert_inner(&mut inner, key, block.clone());
        Ok(block)
    }

    fn insert_inner(&self, inner: &mut CacheInner, key: CacheKey, block: Arc<Block>) {
        inner.size_bytes += block.encoded_size();
        if let Some((evicted_key, evicted_block)) = inner.entries.push(key, block) {
            inner.size_bytes -= evicted_block.encoded_size();
            // `push` also returns the old value on overwrite; only a
            // different key is a real eviction.
            if evicted_key != key {
                if let Some(observer) = &self.observer {
                    observer(&evicted_key, &evicted_block, SystemTime::now());
                }
            }
        }
    }

    /// Membership probe that leaves the recency order alone.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Drops one entry. Removal is not an eviction; the observer stays quiet.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(key) {
            Some(block) => {
                inner.size_bytes -= block.encoded_size();
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.size_bytes = 0;
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry capacity.
    pub fn cap(&self) -> usize {
        self.inner.lock().entries.cap().get()
    }

    /// Total serialized size of the cached blocks, for metrics.
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().size_bytes
    }
}
