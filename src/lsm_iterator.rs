use std::ops::Bound;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::iterators::concat_iterator::SstConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::iterators::StorageIterator;
use crate::mem_table::MemTableIterator;
use crate::table::iterator::SsTableIterator;

/// The merge composition an engine scan is built from: memtables over L0
/// tables, the pair over the concatenated deeper levels. Newer streams sit in
/// the A seats.
pub type LsmIteratorInner = TwoMergeIterator<
    TwoMergeIterator<MergeIterator<MemTableIterator>, MergeIterator<SsTableIterator>>,
    MergeIterator<SstConcatIterator>,
>;

/// Outermost scan iterator: clips the merged stream at the upper bound and
/// hides tombstones, so callers only ever see live, in-range entries.
pub struct LsmIterator {
    inner: LsmIteratorInner,
    end_bound: Bound<Bytes>,
    is_valid: bool,
}

impl LsmIterator {
    pub(crate) fn new(iter: LsmIteratorInner, end_bound: Bound<Bytes>) -> Result<Self> {
        let mut iter = Self {
            is_valid: iter.is_valid(),
            inner: iter,
            end_bound,
        };
        iter.clip_to_end_bound();
        iter.move_to_non_delete()?;
        Ok(iter)
    }

    fn clip_to_end_bound(&mut self) {
        if !self.is_valid {
            return;
        }
        match self.end_bound.as_ref() {
            Bound::Unbounded => {}
            Bound::Included(key) => self.is_valid = self.inner.key() <= key.as_ref(),
            Bound::Excluded(key) => self.is_valid = self.inner.key() < key.as_ref(),
        }
    }

    fn next_inner(&mut self) -> Result<()> {
        self.inner.next()?;
        if !self.inner.is_valid() {
            self.is_valid = false;
            return Ok(());
        }
        self.clip_to_end_bound();
        Ok(())
    }

    /// Skips tombstones; called on every boundary so a deleted key is never
    /// observable from the outside.
    fn move_to_non_delete(&mut self) -> Result<()> {
        while self.is_valid() && self.inner.value().is_empty() {
            self.next_inner()?;
        }
        Ok(())
    }
}

impl StorageIterator for LsmIterator {
    type KeyType<'a> = &'a [u8];

    fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn next(&mut self) -> Result<()> {
        self.next_inner()?;
        self.move_to_non_delete()?;
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.inner.number_of_iterators()
    }
}

/// Guards an iterator against misuse after exhaustion or an error: past-end
/// `next` is a quiet no-op, and once an error escaped, every further `next`
/// fails.
pub struct FusedIterator<I: StorageIterator> {
    iter: I,
    has_errored: bool,
}

impl<I: StorageIterator> FusedIterator<I> {
    pub fn new(iter: I) -> Self {
        Self {
            iter,
            has_errored: false,
        }
    }
}

impl<I: StorageIterator> StorageIterator for FusedIterator<I> {
    type KeyType<'a>
        = I::KeyType<'a>
    where
        Self: 'a;

    fn is_valid(&self) -> bool {
        !self.has_errored && self.iter.is_valid()
    }

    fn key(&self) -> Self::KeyType<'_> {
        assert!(self.is_valid(), "invalid access to the underlying iterator");
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.is_valid(), "invalid access to the underlying iterator");
        self.iter.value()
    }

    fn next(&mut self) -> Result<()> {
        if self.has_errored {
            bail!("the iterator is tainted");
        }
        if self.iter.is_valid() {
            if let Err(e) = self.iter.next() {
                self.has_errored = true;
                return Err(e);
            }
        }
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.iter.number_of_iterators()
    }
}
