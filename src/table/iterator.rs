use std::sync::Arc;

use anyhow::Result;

use super::SsTable;
use crate::block::iterator::BlockIterator;
use crate::iterators::StorageIterator;

/// Iterates one sorted table, hopping block to block.
pub struct SsTableIterator {
    table: Arc<SsTable>,
    block_iter: BlockIterator,
    block_idx: usize,
}

impl SsTableIterator {
    pub fn create_and_seek_to_first(table: Arc<SsTable>) -> Result<Self> {
        let (block_idx, block_iter) = Self::seek_to_first_inner(&table)?;
        Ok(Self {
            block_iter,
            block_idx,
            table,
        })
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        let (block_idx, block_iter) = Self::seek_to_first_inner(&self.table)?;
        self.block_idx = block_idx;
        self.block_iter = block_iter;
        Ok(())
    }

    fn seek_to_first_inner(table: &Arc<SsTable>) -> Result<(usize, BlockIterator)> {
        Ok((
            0,
            BlockIterator::create_and_seek_to_first(table.read_block_cached(0)?),
        ))
    }

    pub fn create_and_seek_to_key(table: Arc<SsTable>, key: &[u8]) -> Result<Self> {
        let (block_idx, block_iter) = Self::seek_to_key_inner(&table, key)?;
        Ok(Self {
            block_idx,
            block_iter,
            table,
        })
    }

    /// Positions on the first entry with key >= `key`; invalid when the
    /// table holds no such entry.
    pub fn seek_to_key(&mut self, key: &[u8]) -> Result<()> {
        let (block_idx, block_iter) = Self::seek_to_key_inner(&self.table, key)?;
        self.block_iter = block_iter;
        self.block_idx = block_idx;
        Ok(())
    }

    fn seek_to_key_inner(table: &Arc<SsTable>, key: &[u8]) -> Result<(usize, BlockIterator)> {
        let mut block_idx = table.find_block_idx(key);
        let mut block_iter =
            BlockIterator::create_and_seek_to_key(table.read_block_cached(block_idx)?, key);
        // The in-block seek parks on the final entry when every key in the
        // block is smaller than the target; step over it into the next block.
        if block_iter.is_valid() && block_iter.key() < key {
            block_iter.next();
            if !block_iter.is_valid() {
                block_idx += 1;
                if block_idx < table.num_of_blocks() {
                    block_iter = BlockIterator::create_and_seek_to_first(
                        table.read_block_cached(block_idx)?,
                    );
                }
            }
        }
        Ok((block_idx, block_iter))
    }
}

impl StorageIterator for SsTableIterator {
    type KeyType<'a> = &'a [u8];

    fn value(&self) -> &[u8] {
        self.block_iter.value()
    }

    fn key(&self) -> &[u8] {
        self.block_iter.key()
    }

    fn is_valid(&self) -> bool {
        self.block_iter.is_valid()
    }

    fn next(&mut self) -> Result<()> {
        self.block_iter.next();
        if !self.block_iter.is_valid() {
            self.block_idx += 1;
            if self.block_idx < self.table.num_of_blocks() {
                self.block_iter = BlockIterator::create_and_seek_to_first(
                    self.table.read_block_cached(self.block_idx)?,
                );
            }
        }
        Ok(())
    }
}
