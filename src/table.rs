pub(crate) mod bloom;
pub mod builder;
pub mod iterator;

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes};
use parking_lot::RwLock;

use self::bloom::Bloom;
use crate::block::Block;
use crate::cache::BlockCache;
use crate::error::SiltError;

pub use builder::SsTableBuilder;

/// Where one block lives in the file and the key range it covers.
/// Encoded as `u32 offset | u16 len | first_key | u16 len | last_key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    pub(crate) offset: usize,
    pub(crate) first_key: Bytes,
    pub(crate) last_key: Bytes,
}

impl BlockMeta {
    /// Appends `u32 count | metas | u32 crc` to the buffer.
    pub fn encode_block_meta(block_meta: &[BlockMeta], buf: &mut Vec<u8>) {
        let mut estimated_size = std::mem::size_of::<u32>();
        for meta in block_meta {
            estimated_size += std::mem::size_of::<u32>();
            estimated_size += std::mem::size_of::<u16>() + meta.first_key.len();
            estimated_size += std::mem::size_of::<u16>() + meta.last_key.len();
        }
        estimated_size += std::mem::size_of::<u32>();

        buf.reserve(estimated_size);
        let original_len = buf.len();
        buf.put_u32(block_meta.len() as u32);
        for meta in block_meta {
            buf.put_u32(meta.offset as u32);
            buf.put_u16(meta.first_key.len() as u16);
            buf.put_slice(&meta.first_key);
            buf.put_u16(meta.last_key.len() as u16);
            buf.put_slice(&meta.last_key);
        }
        buf.put_u32(crc32fast::hash(&buf[original_len..]));
        debug_assert_eq!(estimated_size, buf.len() - original_len);
    }

    /// Decodes a meta region. The checksum covers the count and every meta
    /// and is verified before anything is parsed.
    pub fn decode_block_meta(buf: &[u8]) -> Result<Vec<BlockMeta>> {
        let truncated = || SiltError::CorruptData("truncated block meta region".into());
        if buf.len() < 2 * std::mem::size_of::<u32>() {
            return Err(truncated().into());
        }
        let stored_checksum = (&buf[buf.len() - 4..]).get_u32();
        if crc32fast::hash(&buf[..buf.len() - 4]) != stored_checksum {
            return Err(SiltError::CorruptData("block meta checksum mismatch".into()).into());
        }

        let mut body = &buf[..buf.len() - 4];
        let num = body.get_u32() as usize;
        let mut block_meta = Vec::with_capacity(num);
        for _ in 0..num {
            if body.remaining() < 4 + 2 {
                return Err(truncated().into());
            }
            let offset = body.get_u32() as usize;
            let first_key_len = body.get_u16() as usize;
            if body.remaining() < first_key_len + 2 {
                return Err(truncated().into());
            }
            let first_key = body.copy_to_bytes(first_key_len);
            let last_key_len = body.get_u16() as usize;
            if body.remaining() < last_key_len {
                return Err(truncated().into());
            }
            let last_key = body.copy_to_bytes(last_key_len);
            block_meta.push(BlockMeta {
                offset,
                first_key,
                last_key,
            });
        }
        if body.has_remaining() {
            return Err(SiltError::CorruptData("trailing bytes after block meta".into()).into());
        }
        Ok(block_meta)
    }
}

/// Read-only handle on an SST file. `close` drops the descriptor; reads after
/// that fail with [`SiltError::TableClosed`].
#[derive(Debug)]
pub struct FileObject {
    file: RwLock<Option<File>>,
    size: u64,
}

impl FileObject {
    /// Writes the whole buffer, then reopens it read-only. No rename or fsync
    /// dance; durability is out of scope.
    pub fn create(path: &Path, data: Vec<u8>) -> Result<Self> {
        std::fs::write(path, &data).map_err(SiltError::Io)?;
        let file = File::options()
            .read(true)
            .write(false)
            .open(path)
            .map_err(SiltError::Io)?;
        Ok(Self {
            file: RwLock::new(Some(file)),
            size: data.len() as u64,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(false)
            .open(path)
            .map_err(SiltError::Io)?;
        let size = file.metadata().map_err(SiltError::Io)?.len();
        Ok(Self {
            file: RwLock::new(Some(file)),
            size,
        })
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(SiltError::TableClosed)?;
        let mut data = vec![0; len as usize];
        file.read_exact_at(&mut data[..], offset)
            .map_err(SiltError::Io)?;
        Ok(data)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Idempotent.
    pub fn close(&self) {
        *self.file.write() = None;
    }
}

/// An immutable sorted table: key-sorted entries grouped into checksummed
/// blocks, with a trailing block index, data checksum and bloom filter.
#[derive(Debug)]
pub struct SsTable {
    pub(crate) file: FileObject,
    pub(crate) block_meta: Vec<BlockMeta>,
    /// File offset of the meta region; the data region ends 4 bytes before
    /// it, at the data checksum.
    pub(crate) block_meta_offset: usize,
    id: usize,
    block_cache: Option<Arc<BlockCache>>,
    first_key: Bytes,
    last_key: Bytes,
    pub(crate) bloom: Bloom,
}

impl SsTable {
    /// Opens a table by decoding the file tail inward: bloom offset, bloom,
    /// meta offset, meta region (checksummed), then the data region checksum.
    /// Any mismatch or out-of-range region is fatal for this table.
    pub fn open(id: usize, block_cache: Option<Arc<BlockCache>>, file: FileObject) -> Result<Self> {
        let len = file.size();
        if len < 16 {
            return Err(SiltError::CorruptData(format!(
                "{len} byte file is too small for a sorted table"
            ))
            .into());
        }
        let raw_bloom_offset = file.read(len - 4, 4)?;
        let bloom_offset = (&raw_bloom_offset[..]).get_u32() as u64;
        if bloom_offset < 12 || bloom_offset > len - 4 {
            return Err(SiltError::CorruptData("bloom filter offset out of range".into()).into());
        }
        let raw_bloom = file.read(bloom_offset, len - 4 - bloom_offset)?;
        let bloom = Bloom::decode(&raw_bloom)?;

        let raw_meta_offset = file.read(bloom_offset - 4, 4)?;
        let block_meta_offset = (&raw_meta_offset[..]).get_u32() as u64;
        if block_meta_offset < 4 || block_meta_offset > bloom_offset - 4 {
            return Err(SiltError::CorruptData("block meta offset out of range".into()).into());
        }
        let raw_meta = file.read(block_meta_offset, bloom_offset - 4 - block_meta_offset)?;
        let block_meta = BlockMeta::decode_block_meta(&raw_meta)?;
        if block_meta.is_empty() {
            return Err(SiltError::CorruptData("table holds no blocks".into()).into());
        }

        let raw_data_checksum = file.read(block_meta_offset - 4, 4)?;
        let data_checksum = (&raw_data_checksum[..]).get_u32();
        let data = file.read(0, block_meta_offset - 4)?;
        if crc32fast::hash(&data) != data_checksum {
            return Err(SiltError::CorruptData("data region checksum mismatch".into()).into());
        }

        Ok(Self {
            file,
            first_key: block_meta.first().map(|m| m.first_key.clone()).unwrap_or_default(),
            last_key: block_meta.last().map(|m| m.last_key.clone()).unwrap_or_default(),
            block_meta,
            block_meta_offset: block_meta_offset as usize,
            id,
            block_cache,
            bloom,
        })
    }

    /// Reads and decodes one block from disk, verifying its trailing CRC.
    pub fn read_block(&self, block_idx: usize) -> Result<Arc<Block>> {
        let offset = self.block_meta[block_idx].offset;
        let end = self
            .block_meta
            .get(block_idx + 1)
            .map(|meta| meta.offset)
            .unwrap_or(self.block_meta_offset - 4);
        let raw = self.file.read(offset as u64, (end - offset) as u64)?;
        if raw.len() < 4 {
            return Err(SiltError::CorruptData(format!("block {block_idx} too short")).into());
        }
        let (block_raw, raw_checksum) = raw.split_at(raw.len() - 4);
        let checksum = (&raw_checksum[..]).get_u32();
        if crc32fast::hash(block_raw) != checksum {
            return Err(
                SiltError::CorruptData(format!("block {block_idx} checksum mismatch")).into(),
            );
        }
        let block = Block::decode(block_raw)?;
        if block.first_key()? != self.block_meta[block_idx].first_key {
            return Err(SiltError::CorruptData(format!(
                "block {block_idx} disagrees with its meta about the first key"
            ))
            .into());
        }
        Ok(Arc::new(block))
    }

    /// Cached block fetch; `None` past the last index.
    pub fn block(&self, block_idx: usize) -> Result<Option<Arc<Block>>> {
        if block_idx >= self.block_meta.len() {
            return Ok(None);
        }
        Ok(Some(self.read_block_cached(block_idx)?))
    }

    /// Like [`read_block`](Self::read_block), but served through the block
    /// cache when one is attached.
    pub fn read_block_cached(&self, block_idx: usize) -> Result<Arc<Block>> {
        if let Some(cache) = &self.block_cache {
            cache.get_or_compute((self.id, block_idx), || self.read_block(block_idx))
        } else {
            self.read_block(block_idx)
        }
    }

    /// Index of the block that may hold `key`: the last block whose first key
    /// is not greater than `key`, or the first block.
    pub fn find_block_idx(&self, key: &[u8]) -> usize {
        self.block_meta
            .partition_point(|meta| meta.first_key.as_ref() <= key)
            .saturating_sub(1)
    }

    /// Fast membership test. False positives are possible, false negatives
    /// are not.
    pub fn contains(&self, key: &[u8]) -> bool {
        if key < self.first_key.as_ref() || key > self.last_key.as_ref() {
            return false;
        }
        if key == self.first_key.as_ref() || key == self.last_key.as_ref() {
            return true;
        }
        self.bloom.may_contain(farmhash::fingerprint32(key))
    }

    pub fn first_key(&self) -> &Bytes {
        &self.first_key
    }

    pub fn last_key(&self) -> &Bytes {
        &self.last_key
    }

    pub fn num_of_blocks(&self) -> usize {
        self.block_meta.len()
    }

    pub fn table_size(&self) -> u64 {
        self.file.size()
    }

    pub fn sst_id(&self) -> usize {
        self.id
    }

    pub fn close(&self) {
        self.file.close();
    }
}
