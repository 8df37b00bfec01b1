use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use crate::error::SiltError;
use crate::iterators::StorageIterator;
use crate::skiplist::{SkipList, SkipListIterator, DEFAULT_MAX_LEVEL};
use crate::table::SsTableBuilder;

/// Create a bound of `Bytes` from a bound of `&[u8]`.
pub(crate) fn map_bound(bound: Bound<&[u8]>) -> Bound<Bytes> {
    match bound {
        Bound::Included(x) => Bound::Included(Bytes::copy_from_slice(x)),
        Bound::Excluded(x) => Bound::Excluded(Bytes::copy_from_slice(x)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// An in-memory sorted write buffer over a [`SkipList`]. Tombstones live
/// alongside data as empty values; interpreting them is the engine's job, not
/// the memtable's.
///
/// Higher id means created later. The size counter is the running sum of
/// inserted key and value bytes; overwrites add, they never subtract, so the
/// counter may overestimate.
pub struct MemTable {
    list: Arc<SkipList>,
    id: usize,
    approximate_size: Arc<AtomicUsize>,
}

impl MemTable {
    pub fn create(id: usize) -> Self {
        Self::with_max_level(id, DEFAULT_MAX_LEVEL)
    }

    pub fn with_max_level(id: usize, max_level: usize) -> Self {
        Self {
            list: Arc::new(SkipList::new(max_level)),
            id,
            approximate_size: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.list.get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let estimated_size = key.len() + value.len();
        self.list.put(key, value);
        self.approximate_size
            .fetch_add(estimated_size, Ordering::Relaxed);
        Ok(())
    }

    /// A delete is a put of the empty value.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.put(key, b"")
    }

    /// Bounded iterator over `[lower, upper]`. The scan pins the skip list's
    /// shared lock until closed or dropped.
    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> MemTableIterator {
        MemTableIterator {
            iter: self.list.scan(lower, upper),
        }
    }

    /// Unbounded form of [`scan`](Self::scan).
    pub fn iter(&self) -> MemTableIterator {
        self.scan(Bound::Unbounded, Bound::Unbounded)
    }

    /// Streams every entry, tombstones included, into a table builder.
    pub fn flush(&self, builder: &mut SsTableBuilder) -> Result<()> {
        let mut iter = self.iter();
        while iter.is_valid() {
            builder.add(iter.key(), iter.value());
            iter.next()?;
        }
        Ok(())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }
}

/// Adapts the skip list's internal iterator (which signals exhaustion with an
/// error sentinel) to the [`StorageIterator`] validity protocol.
pub struct MemTableIterator {
    iter: SkipListIterator,
}

impl MemTableIterator {
    /// Releases the underlying shared lock; idempotent.
    pub fn close(&mut self) {
        self.iter.close();
    }
}

impl StorageIterator for MemTableIterator {
    type KeyType<'a> = &'a [u8];

    fn key(&self) -> &[u8] {
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        self.iter.value()
    }

    fn is_valid(&self) -> bool {
        self.iter.has_next()
    }

    fn next(&mut self) -> Result<()> {
        match self.iter.next() {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.downcast_ref(), Some(SiltError::IteratorEnded)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
