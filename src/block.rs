pub mod builder;
pub mod iterator;

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes};

use crate::error::{SiltError, MAX_ENTRY_COMPONENT};

pub(crate) const SIZEOF_U16: usize = std::mem::size_of::<u16>();

/// A bounded byte page of key-sorted entries plus the offset of each entry's
/// first byte. Serialized as `entries | offsets | u16 count`, everything
/// big-endian.
#[derive(Debug)]
pub struct Block {
    pub(crate) data: Vec<u8>,
    pub(crate) offsets: Vec<u16>,
}

impl Block {
    pub fn encode(&self) -> Bytes {
        let mut buf = self.data.clone();
        for offset in &self.offsets {
            buf.put_u16(*offset);
        }
        buf.put_u16(self.offsets.len() as u16);
        buf.into()
    }

    /// Inverse of [`encode`](Self::encode). Validates the whole structure:
    /// the offset array must be strictly increasing, every offset must
    /// address a well-formed entry, and the entries must cover the data
    /// region exactly.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let size = raw.len();
        if size < SIZEOF_U16 {
            return Err(SiltError::CorruptData("block shorter than its entry count".into()).into());
        }
        let count = (&raw[size - SIZEOF_U16..]).get_u16() as usize;
        let offsets_len = count * SIZEOF_U16;
        if size < SIZEOF_U16 + offsets_len {
            return Err(SiltError::CorruptData(format!(
                "block of {size} bytes cannot hold {count} offsets"
            ))
            .into());
        }
        let data_end = size - SIZEOF_U16 - offsets_len;
        let offsets: Vec<u16> = raw[data_end..size - SIZEOF_U16]
            .chunks(SIZEOF_U16)
            .map(|mut chunk| chunk.get_u16())
            .collect();

        let data = raw[..data_end].to_vec();
        let mut cursor = 0usize;
        for &offset in &offsets {
            if offset as usize != cursor {
                return Err(
                    SiltError::CorruptData(format!("entry offset {offset} out of place")).into(),
                );
            }
            cursor += entry_len_at(&data, cursor)?;
        }
        if cursor != data_end {
            return Err(SiltError::CorruptData(format!(
                "{} trailing bytes after the last entry",
                data_end - cursor
            ))
            .into());
        }

        Ok(Self { data, offsets })
    }

    pub fn num_entries(&self) -> usize {
        self.offsets.len()
    }

    /// Serialized size of this block, before the table-level checksum.
    pub fn encoded_size(&self) -> usize {
        SIZEOF_U16 + self.offsets.len() * SIZEOF_U16 + self.data.len()
    }

    pub(crate) fn first_key(&self) -> Result<Bytes> {
        if self.offsets.is_empty() {
            return Err(SiltError::BlockEmpty.into());
        }
        let mut buf = &self.data[..];
        let key_len = buf.get_u16() as usize;
        Ok(Bytes::copy_from_slice(&buf[..key_len]))
    }
}

/// Appends `u16 key_len | key | u16 value_len | value` to the buffer.
/// Oversized components are a contract violation by the caller.
pub(crate) fn put_entry(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    assert!(
        key.len() <= MAX_ENTRY_COMPONENT,
        "key of {} bytes does not fit the entry encoding",
        key.len()
    );
    assert!(
        value.len() <= MAX_ENTRY_COMPONENT,
        "value of {} bytes does not fit the entry encoding",
        value.len()
    );
    buf.put_u16(key.len() as u16);
    buf.put(key);
    buf.put_u16(value.len() as u16);
    buf.put(value);
}

pub(crate) fn entry_size(key: &[u8], value: &[u8]) -> usize {
    SIZEOF_U16 + key.len() + SIZEOF_U16 + value.len()
}

/// Length of the entry starting at `offset`, after bounds-checking both
/// length prefixes.
fn entry_len_at(data: &[u8], offset: usize) -> Result<usize> {
    let short = || SiltError::CorruptData(format!("truncated entry at offset {offset}"));
    if data.len() < offset + SIZEOF_U16 {
        return Err(short().into());
    }
    let key_len = (&data[offset..]).get_u16() as usize;
    let value_len_at = offset + SIZEOF_U16 + key_len;
    if data.len() < value_len_at + SIZEOF_U16 {
        return Err(short().into());
    }
    let value_len = (&data[value_len_at..]).get_u16() as usize;
    let end = value_len_at + SIZEOF_U16 + value_len;
    if data.len() < end {
        return Err(short().into());
    }
    Ok(end - offset)
}
