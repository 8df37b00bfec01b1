use super::{entry_size, put_entry, Block, SIZEOF_U16};

/// Accumulates sorted entries until the next one would overflow the byte
/// budget. Keys must arrive in strictly ascending order; the builder does not
/// verify.
pub struct BlockBuilder {
    /// Serialized key-value entries.
    data: Vec<u8>,
    /// Offset of each entry's first byte.
    offsets: Vec<u16>,
    /// Byte budget for the serialized block.
    block_size: usize,
}

impl BlockBuilder {
    pub fn new(block_size: usize) -> Self {
        Self {
            data: Vec::new(),
            offsets: Vec::new(),
            block_size,
        }
    }

    /// Size the block would serialize to right now:
    /// count + offset array + entry data.
    fn estimated_size(&self) -> usize {
        SIZEOF_U16 + self.offsets.len() * SIZEOF_U16 + self.data.len()
    }

    /// Adds an entry, or returns false (leaving the builder untouched) when
    /// it would push the block past its budget. The first entry is always
    /// accepted, however large, so the caller can always make progress.
    #[must_use]
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> bool {
        assert!(!key.is_empty(), "key must not be empty");
        let add_on = entry_size(key, value) + SIZEOF_U16;
        if self.estimated_size() + add_on > self.block_size && !self.is_empty() {
            return false;
        }
        self.offsets.push(self.data.len() as u16);
        put_entry(&mut self.data, key, value);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn build(self) -> Block {
        assert!(!self.is_empty(), "block should not be empty");
        Block {
            data: self.data,
            offsets: self.offsets,
        }
    }
}
