use std::sync::Arc;

use anyhow::Result;

use super::StorageIterator;
use crate::table::iterator::SsTableIterator;
use crate::table::SsTable;

/// Serves a run of key-sorted, non-overlapping tables one after another.
/// Only one table is open at a time.
pub struct SstConcatIterator {
    current: Option<SsTableIterator>,
    next_sst_idx: usize,
    sstables: Vec<Arc<SsTable>>,
}

impl SstConcatIterator {
    pub fn create_and_seek_to_first(sstables: Vec<Arc<SsTable>>) -> Result<Self> {
        Self::check_sst_valid(&sstables);
        if sstables.is_empty() {
            return Ok(Self {
                current: None,
                next_sst_idx: 0,
                sstables,
            });
        }
        let mut iter = Self {
            current: Some(SsTableIterator::create_and_seek_to_first(
                sstables[0].clone(),
            )?),
            next_sst_idx: 1,
            sstables,
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    /// Opens on the last table whose first key is not greater than `key` (the
    /// only table that can hold it) and seeks within; walks forward while
    /// tables come up empty.
    pub fn create_and_seek_to_key(sstables: Vec<Arc<SsTable>>, key: &[u8]) -> Result<Self> {
        Self::check_sst_valid(&sstables);
        if sstables.is_empty() {
            return Ok(Self {
                current: None,
                next_sst_idx: 0,
                sstables,
            });
        }
        let idx = sstables
            .partition_point(|table| table.first_key().as_ref() <= key)
            .saturating_sub(1);
        let mut iter = Self {
            current: Some(SsTableIterator::create_and_seek_to_key(
                sstables[idx].clone(),
                key,
            )?),
            next_sst_idx: idx + 1,
            sstables,
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    fn check_sst_valid(sstables: &[Arc<SsTable>]) {
        for table in sstables {
            debug_assert!(table.first_key() <= table.last_key());
        }
        if !sstables.is_empty() {
            for i in 0..sstables.len() - 1 {
                debug_assert!(sstables[i].last_key() < sstables[i + 1].first_key());
            }
        }
    }

    fn move_until_valid(&mut self) -> Result<()> {
        while let Some(iter) = self.current.as_ref() {
            if iter.is_valid() {
                break;
            }
            if self.next_sst_idx >= self.sstables.len() {
                self.current = None;
            } else {
                self.current = Some(SsTableIterator::create_and_seek_to_first(
                    self.sstables[self.next_sst_idx].clone(),
                )?);
                self.next_sst_idx += 1;
            }
        }
        Ok(())
    }
}

impl StorageIterator for SstConcatIterator {
    type KeyType<'a> = &'a [u8];

    fn key(&self) -> &[u8] {
        self.current.as_ref().expect("invalid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().expect("invalid iterator").value()
    }

    fn is_valid(&self) -> bool {
        self.current
            .as_ref()
            .map(|iter| iter.is_valid())
            .unwrap_or(false)
    }

    fn next(&mut self) -> Result<()> {
        self.current.as_mut().expect("invalid iterator").next()?;
        self.move_until_valid()?;
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        1
    }
}
