use std::sync::Arc;

use bytes::Buf;

use super::{Block, SIZEOF_U16};

/// Random-access cursor over one block's entries.
pub struct BlockIterator {
    block: Arc<Block>,
    /// Key at the cursor; empty when the iterator has ended.
    key: Vec<u8>,
    /// Byte range of the current value inside the block data.
    value_range: (usize, usize),
    /// Entry index at the cursor.
    idx: usize,
}

impl BlockIterator {
    fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            key: Vec::new(),
            value_range: (0, 0),
            idx: 0,
        }
    }

    pub fn create_and_seek_to_first(block: Arc<Block>) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_first();
        iter
    }

    pub fn create_and_seek_to_key(block: Arc<Block>, key: &[u8]) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_key(key);
        iter
    }

    /// Panics after the end; callers must check `is_valid` first.
    pub fn key(&self) -> &[u8] {
        assert!(!self.key.is_empty(), "invalid iterator");
        &self.key
    }

    /// Panics after the end; callers must check `is_valid` first.
    pub fn value(&self) -> &[u8] {
        assert!(!self.key.is_empty(), "invalid iterator");
        &self.block.data[self.value_range.0..self.value_range.1]
    }

    pub fn is_valid(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn seek_to_first(&mut self) {
        self.seek_to(0);
    }

    /// Positions on the idx-th entry; past the last entry the iterator
    /// becomes invalid. An empty block is invalid from the start.
    pub fn seek_to(&mut self, idx: usize) {
        if idx >= self.block.offsets.len() {
            self.key.clear();
            return;
        }
        let offset = self.block.offsets[idx] as usize;
        self.seek_to_offset(offset);
        self.idx = idx;
    }

    fn seek_to_offset(&mut self, offset: usize) {
        let mut entry = &self.block.data[offset..];
        let key_len = entry.get_u16() as usize;
        self.key.clear();
        self.key.extend_from_slice(&entry[..key_len]);
        entry.advance(key_len);
        let value_len = entry.get_u16() as usize;
        let value_start = offset + SIZEOF_U16 + key_len + SIZEOF_U16;
        self.value_range = (value_start, value_start + value_len);
    }

    /// Binary-searches for the first entry with key >= `key`. When every key
    /// is smaller, the cursor parks on the last entry and stays valid; the
    /// caller is expected to compare the landed key.
    pub fn seek_to_key(&mut self, key: &[u8]) {
        if self.block.offsets.is_empty() {
            self.key.clear();
            return;
        }
        let mut low = 0;
        let mut high = self.block.offsets.len();
        while low < high {
            let mid = low + (high - low) / 2;
            self.seek_to(mid);
            debug_assert!(self.is_valid());
            match self.key().cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return,
            }
        }
        if low >= self.block.offsets.len() {
            self.seek_to(self.block.offsets.len() - 1);
        } else {
            self.seek_to(low);
        }
    }

    /// Past-end `next` is a no-op that leaves the iterator invalid.
    pub fn next(&mut self) {
        if !self.is_valid() {
            return;
        }
        self.seek_to(self.idx + 1);
    }
}
