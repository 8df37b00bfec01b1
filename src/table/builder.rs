use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bytes::{BufMut, Bytes};

use super::{bloom::Bloom, BlockMeta, FileObject, SsTable};
use crate::block::builder::BlockBuilder;
use crate::cache::BlockCache;

pub(crate) const DEFAULT_BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Streams strictly-ascending key-value pairs into a sorted table file.
/// Ordering is the caller's contract; the builder does not verify it.
pub struct SsTableBuilder {
    builder: BlockBuilder,
    block_size: usize,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    data: Vec<u8>,
    pub(crate) meta: Vec<BlockMeta>,
    key_hashes: Vec<u32>,
    bloom_false_positive_rate: f64,
}

impl SsTableBuilder {
    pub fn new(block_size: usize) -> Self {
        Self::with_bloom_fpr(block_size, DEFAULT_BLOOM_FALSE_POSITIVE_RATE)
    }

    pub fn with_bloom_fpr(block_size: usize, bloom_false_positive_rate: f64) -> Self {
        Self {
            builder: BlockBuilder::new(block_size),
            block_size,
            first_key: Vec::new(),
            last_key: Vec::new(),
            data: Vec::new(),
            meta: Vec::new(),
            key_hashes: Vec::new(),
            bloom_false_positive_rate,
        }
    }

    /// Adds a key-value pair. When the current block rejects the entry, the
    /// block is sealed and the entry opens a fresh one.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        if self.first_key.is_empty() {
            self.first_key = key.to_vec();
        }
        self.key_hashes.push(farmhash::fingerprint32(key));

        if self.builder.add(key, value) {
            self.last_key.clear();
            self.last_key.extend_from_slice(key);
            return;
        }

        self.finish_block();

        assert!(self.builder.add(key, value));
        self.first_key = key.to_vec();
        self.last_key = key.to_vec();
    }

    /// Seals the current block: encodes it, records its meta, and appends
    /// `block || u32 crc` to the data region.
    fn finish_block(&mut self) {
        let builder = std::mem::replace(&mut self.builder, BlockBuilder::new(self.block_size));
        let encoded_block = builder.build().encode();
        self.meta.push(BlockMeta {
            offset: self.data.len(),
            first_key: Bytes::from(std::mem::take(&mut self.first_key)),
            last_key: Bytes::from(std::mem::take(&mut self.last_key)),
        });
        let checksum = crc32fast::hash(&encoded_block);
        self.data.extend(encoded_block);
        self.data.put_u32(checksum);
    }

    /// Finalizes the table and writes the whole buffer to `path` in one call:
    /// data region, data checksum, meta region, meta offset, bloom filter
    /// (sized from the final key count), bloom offset.
    pub fn build(
        mut self,
        id: usize,
        block_cache: Option<Arc<BlockCache>>,
        path: impl AsRef<Path>,
    ) -> Result<SsTable> {
        if !self.builder.is_empty() {
            self.finish_block();
        }
        assert!(!self.meta.is_empty(), "cannot build an empty table");

        let mut buf = self.data;
        buf.put_u32(crc32fast::hash(&buf));
        let meta_offset = buf.len();
        BlockMeta::encode_block_meta(&self.meta, &mut buf);
        buf.put_u32(meta_offset as u32);
        let bloom = Bloom::build_from_key_hashes(
            &self.key_hashes,
            Bloom::bloom_bits_per_key(self.key_hashes.len(), self.bloom_false_positive_rate),
        );
        let bloom_offset = buf.len();
        bloom.encode(&mut buf);
        buf.put_u32(bloom_offset as u32);

        let file = FileObject::create(path.as_ref(), buf)?;
        Ok(SsTable {
            id,
            file,
            first_key: self.meta.first().map(|m| m.first_key.clone()).unwrap_or_default(),
            last_key: self.meta.last().map(|m| m.last_key.clone()).unwrap_or_default(),
            block_meta: self.meta,
            block_meta_offset: meta_offset,
            block_cache,
            bloom,
        })
    }

    /// Size of the data written so far; metadata is negligible next to it.
    pub fn estimated_size(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub(crate) fn build_for_test(self, path: impl AsRef<Path>) -> Result<SsTable> {
        self.build(0, None, path)
    }
}
