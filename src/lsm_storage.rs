use std::collections::HashMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::BlockCache;
use crate::error::{SiltError, MAX_ENTRY_COMPONENT};
use crate::iterators::concat_iterator::SstConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::iterators::StorageIterator;
use crate::lsm_iterator::{FusedIterator, LsmIterator};
use crate::mem_table::{map_bound, MemTable};
use crate::table::iterator::SsTableIterator;
use crate::table::{SsTable, SsTableBuilder};

/// One consistent view of every storage source. The engine mutates it by
/// cloning, editing the clone and swapping the `Arc`, so readers holding the
/// old `Arc` keep a stable set of component references.
#[derive(Clone)]
pub struct LsmStorageState {
    /// The mutable memtable all writes go to.
    pub memtable: Arc<MemTable>,
    /// Frozen memtables, newest last.
    pub imm_memtables: Vec<Arc<MemTable>>,
    /// Level-0 table ids, newest last. L0 tables may overlap each other.
    pub l0_sstables: Vec<usize>,
    /// Deeper levels; within each, tables are disjoint and sorted by first
    /// key.
    pub levels: Vec<Vec<usize>>,
    /// Table id to open handle.
    pub sstables: HashMap<usize, Arc<SsTable>>,
}

impl LsmStorageState {
    fn create(options: &LsmStorageOptions) -> Self {
        Self {
            memtable: Arc::new(MemTable::with_max_level(0, options.skiplist_max_level)),
            imm_memtables: Vec::new(),
            l0_sstables: Vec::new(),
            levels: vec![Vec::new(); options.sst_level_count],
            sstables: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LsmStorageOptions {
    /// Byte budget of one block.
    pub block_size: usize,
    /// Memtable size that triggers rotation.
    pub max_table_size: usize,
    /// Number of levels below L0.
    pub sst_level_count: usize,
    /// Block cache capacity, in entries.
    pub block_cache_size: usize,
    /// Express levels of the memtable skip lists.
    pub skiplist_max_level: usize,
    /// Target false-positive rate of per-table bloom filters.
    pub bloom_false_positive_rate: f64,
}

impl Default for LsmStorageOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_table_size: 256 << 20,
            sst_level_count: 6,
            block_cache_size: 4096,
            skiplist_max_level: 20,
            bloom_false_positive_rate: 0.01,
        }
    }
}

fn range_overlap(
    user_begin: Bound<&[u8]>,
    user_end: Bound<&[u8]>,
    table_begin: &[u8],
    table_end: &[u8],
) -> bool {
    match user_end {
        Bound::Excluded(key) if key <= table_begin => return false,
        Bound::Included(key) if key < table_begin => return false,
        _ => {}
    }
    match user_begin {
        Bound::Excluded(key) if key >= table_end => return false,
        Bound::Included(key) if key > table_end => return false,
        _ => {}
    }
    true
}

fn check_entry_bounds(key: &[u8], value: &[u8]) -> Result<()> {
    if key.len() > MAX_ENTRY_COMPONENT {
        return Err(SiltError::InvalidInput(key.len()).into());
    }
    if value.len() > MAX_ENTRY_COMPONENT {
        return Err(SiltError::InvalidInput(value.len()).into());
    }
    Ok(())
}

/// The storage engine proper. Wrapped by [`Silt`] for public use.
pub(crate) struct LsmStorageInner {
    /// Guards the state pointer. Shared for every normal operation; exclusive
    /// only for the pointer swap during rotation and flush.
    pub(crate) state: Arc<RwLock<Arc<LsmStorageState>>>,
    /// Serializes rotations and flushes so a thundering herd above the size
    /// threshold cannot freeze empty memtables.
    pub(crate) state_lock: Mutex<()>,
    path: PathBuf,
    pub(crate) block_cache: Arc<BlockCache>,
    /// Source of memtable and table ids; later allocation means a higher id.
    next_table_id: AtomicUsize,
    pub(crate) options: Arc<LsmStorageOptions>,
}

impl LsmStorageInner {
    pub(crate) fn open(path: impl AsRef<Path>, options: LsmStorageOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            std::fs::create_dir_all(&path).map_err(SiltError::Io)?;
        }
        info!(path = %path.display(), "opening storage");
        Ok(Self {
            state: Arc::new(RwLock::new(Arc::new(LsmStorageState::create(&options)))),
            state_lock: Mutex::new(()),
            path,
            block_cache: Arc::new(BlockCache::new(options.block_cache_size)),
            next_table_id: AtomicUsize::new(1),
            options: Arc::new(options),
        })
    }

    pub(crate) fn next_table_id(&self) -> usize {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn path_of_sst(&self, id: usize) -> PathBuf {
        self.path.join(format!("{id:05}.sst"))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!key.is_empty(), "key should not be empty");
        assert!(!value.is_empty(), "value should not be empty");
        check_entry_bounds(key, value)?;
        self.write_entry(key, value)
    }

    /// Applies the records front to back. Each record is an independent
    /// write; there is no atomicity across the batch.
    pub fn write_batch<T: AsRef<[u8]>>(&self, batch: &[WriteBatchRecord<T>]) -> Result<()> {
        for record in batch {
            match record {
                WriteBatchRecord::Put(key, value) => self.put(key.as_ref(), value.as_ref())?,
                WriteBatchRecord::Del(key) => self.delete(key.as_ref())?,
            }
        }
        Ok(())
    }

    /// Records a tombstone for the key.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        assert!(!key.is_empty(), "key should not be empty");
        check_entry_bounds(key, b"")?;
        self.write_entry(key, b"")
    }

    fn write_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let approximate_size = {
            let guard = self.state.read();
            guard.memtable.put(key, value)?;
            guard.memtable.approximate_size()
        };
        self.try_freeze(approximate_size)
    }

    fn try_freeze(&self, estimated_size: usize) -> Result<()> {
        if estimated_size >= self.options.max_table_size {
            let state_lock = self.state_lock.lock();
            let guard = self.state.read();
            // Another writer may have rotated while we waited on the lock.
            if guard.memtable.approximate_size() >= self.options.max_table_size {
                drop(guard);
                self.force_freeze_memtable(&state_lock)?;
            }
        }
        Ok(())
    }

    /// Swaps in a fresh memtable; the old one joins the frozen list. The
    /// write lock covers only the pointer swap.
    pub(crate) fn force_freeze_memtable(
        &self,
        _state_lock: &MutexGuard<'_, ()>,
    ) -> Result<()> {
        let memtable = Arc::new(MemTable::with_max_level(
            self.next_table_id(),
            self.options.skiplist_max_level,
        ));
        let frozen_id;
        {
            let mut guard = self.state.write();
            let mut snapshot = guard.as_ref().clone();
            let old = std::mem::replace(&mut snapshot.memtable, memtable);
            frozen_id = old.id();
            snapshot.imm_memtables.push(old);
            *guard = Arc::new(snapshot);
        }
        debug!(memtable = frozen_id, "memtable frozen");
        Ok(())
    }

    /// Flushes the oldest frozen memtable into a new L0 table.
    pub(crate) fn force_flush_next_imm_memtable(&self) -> Result<()> {
        let _state_lock = self.state_lock.lock();
        let flush_memtable = {
            let guard = self.state.read();
            match guard.imm_memtables.first() {
                Some(memtable) => memtable.clone(),
                None => anyhow::bail!("no frozen memtable to flush"),
            }
        };

        let mut builder = SsTableBuilder::with_bloom_fpr(
            self.options.block_size,
            self.options.bloom_false_positive_rate,
        );
        flush_memtable.flush(&mut builder)?;
        let sst_id = flush_memtable.id();
        let sst = Arc::new(builder.build(
            sst_id,
            Some(self.block_cache.clone()),
            self.path_of_sst(sst_id),
        )?);

        {
            let mut guard = self.state.write();
            let mut snapshot = guard.as_ref().clone();
            let flushed = snapshot.imm_memtables.remove(0);
            debug_assert_eq!(flushed.id(), sst_id);
            snapshot.l0_sstables.push(sst_id);
            snapshot.sstables.insert(sst_id, sst);
            *guard = Arc::new(snapshot);
        }
        info!(sst = sst_id, "flushed memtable to level 0");
        Ok(())
    }

    /// Point lookup: active memtable, frozen memtables newest-first, then the
    /// tables. An empty value anywhere is a tombstone and hides the key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let snapshot = {
            let guard = self.state.read();
            Arc::clone(&guard)
        };

        if let Some(value) = snapshot.memtable.get(key) {
            if value.is_empty() {
                return Ok(None);
            }
            return Ok(Some(value));
        }
        for memtable in snapshot.imm_memtables.iter().rev() {
            if let Some(value) = memtable.get(key) {
                if value.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(value));
            }
        }

        let mut l0_iters = Vec::with_capacity(snapshot.l0_sstables.len());
        for id in snapshot.l0_sstables.iter().rev() {
            let table = snapshot.sstables[id].clone();
            if table.contains(key) {
                l0_iters.push(Box::new(SsTableIterator::create_and_seek_to_key(
                    table, key,
                )?));
            }
        }
        let l0_iter = MergeIterator::create(l0_iters);

        let mut level_iters = Vec::with_capacity(snapshot.levels.len());
        for level_sst_ids in &snapshot.levels {
            let mut level_ssts = Vec::with_capacity(level_sst_ids.len());
            for id in level_sst_ids {
                let table = snapshot.sstables[id].clone();
                if table.contains(key) {
                    level_ssts.push(table);
                }
            }
            level_iters.push(Box::new(SstConcatIterator::create_and_seek_to_key(
                level_ssts, key,
            )?));
        }

        let iter = TwoMergeIterator::create(l0_iter, MergeIterator::create(level_iters))?;
        if iter.is_valid() && iter.key() == key && !iter.value().is_empty() {
            return Ok(Some(Bytes::copy_from_slice(iter.value())));
        }
        Ok(None)
    }

    /// Range scan. Snapshots the component set under the read lock, then
    /// builds the merge tree with every source positioned at the lower bound.
    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<FusedIterator<LsmIterator>> {
        let snapshot = {
            let guard = self.state.read();
            Arc::clone(&guard)
        };

        let mut memtable_iters = Vec::with_capacity(snapshot.imm_memtables.len() + 1);
        memtable_iters.push(Box::new(snapshot.memtable.scan(lower, upper)));
        for memtable in snapshot.imm_memtables.iter().rev() {
            memtable_iters.push(Box::new(memtable.scan(lower, upper)));
        }
        let memtable_iter = MergeIterator::create(memtable_iters);

        let mut l0_iters = Vec::with_capacity(snapshot.l0_sstables.len());
        for id in snapshot.l0_sstables.iter().rev() {
            let table = snapshot.sstables[id].clone();
            if range_overlap(lower, upper, table.first_key(), table.last_key()) {
                l0_iters.push(Box::new(seek_table_to_lower(table, lower)?));
            }
        }
        let l0_iter = MergeIterator::create(l0_iters);

        let mut level_iters = Vec::with_capacity(snapshot.levels.len());
        for level_sst_ids in &snapshot.levels {
            let mut level_ssts = Vec::with_capacity(level_sst_ids.len());
            for id in level_sst_ids {
                let table = snapshot.sstables[id].clone();
                if range_overlap(lower, upper, table.first_key(), table.last_key()) {
                    level_ssts.push(table);
                }
            }
            level_iters.push(Box::new(seek_concat_to_lower(level_ssts, lower)?));
        }
        let level_iter = MergeIterator::create(level_iters);

        let inner = TwoMergeIterator::create(
            TwoMergeIterator::create(memtable_iter, l0_iter)?,
            level_iter,
        )?;
        Ok(FusedIterator::new(LsmIterator::new(
            inner,
            map_bound(upper),
        )?))
    }

    /// Closes every open table handle. Idempotent; reads through the handles
    /// fail afterwards.
    pub(crate) fn close(&self) -> Result<()> {
        let snapshot = {
            let guard = self.state.read();
            Arc::clone(&guard)
        };
        for table in snapshot.sstables.values() {
            table.close();
        }
        info!(path = %self.path.display(), "storage closed");
        Ok(())
    }
}

fn seek_table_to_lower(table: Arc<SsTable>, lower: Bound<&[u8]>) -> Result<SsTableIterator> {
    match lower {
        Bound::Included(key) => SsTableIterator::create_and_seek_to_key(table, key),
        Bound::Excluded(key) => {
            let mut iter = SsTableIterator::create_and_seek_to_key(table, key)?;
            while iter.is_valid() && iter.key() == key {
                iter.next()?;
            }
            Ok(iter)
        }
        Bound::Unbounded => SsTableIterator::create_and_seek_to_first(table),
    }
}

fn seek_concat_to_lower(
    tables: Vec<Arc<SsTable>>,
    lower: Bound<&[u8]>,
) -> Result<SstConcatIterator> {
    match lower {
        Bound::Included(key) => SstConcatIterator::create_and_seek_to_key(tables, key),
        Bound::Excluded(key) => {
            let mut iter = SstConcatIterator::create_and_seek_to_key(tables, key)?;
            while iter.is_valid() && iter.key() == key {
                iter.next()?;
            }
            Ok(iter)
        }
        Bound::Unbounded => SstConcatIterator::create_and_seek_to_first(tables),
    }
}

pub enum WriteBatchRecord<T: AsRef<[u8]>> {
    Put(T, T),
    Del(T),
}

/// Public handle on one storage instance. Several instances with distinct
/// directories can coexist in a process.
pub struct Silt {
    pub(crate) inner: Arc<LsmStorageInner>,
}

impl Silt {
    pub fn open(path: impl AsRef<Path>, options: LsmStorageOptions) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(LsmStorageInner::open(path, options)?),
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)
    }

    pub fn write_batch<T: AsRef<[u8]>>(&self, batch: &[WriteBatchRecord<T>]) -> Result<()> {
        self.inner.write_batch(batch)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.get(key)
    }

    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<FusedIterator<LsmIterator>> {
        self.inner.scan(lower, upper)
    }

    /// Freezes a non-empty active memtable, then flushes every frozen
    /// memtable to level 0, oldest first.
    pub fn force_flush(&self) -> Result<()> {
        if !self.inner.state.read().memtable.is_empty() {
            self.inner
                .force_freeze_memtable(&self.inner.state_lock.lock())?;
        }
        while !self.inner.state.read().imm_memtables.is_empty() {
            self.inner.force_flush_next_imm_memtable()?;
        }
        Ok(())
    }

    /// Reserved: there is no write-ahead log yet, so there is nothing to
    /// sync.
    pub fn sync(&self) -> Result<()> {
        unimplemented!("durability is not part of this engine yet")
    }

    /// Reserved: transactions are not part of this engine yet.
    pub fn transaction(&self) -> Result<()> {
        unimplemented!("transactions are not part of this engine yet")
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
