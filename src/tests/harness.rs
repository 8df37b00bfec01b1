use bytes::Bytes;

use crate::iterators::StorageIterator;

/// Drains the iterator and asserts it yields exactly `expected`, in order.
pub fn check_iter_result_by_key<I>(iter: &mut I, expected: Vec<(Bytes, Bytes)>)
where
    I: for<'a> StorageIterator<KeyType<'a> = &'a [u8]>,
{
    for (key, value) in expected {
        assert!(iter.is_valid(), "expected {:?}, iterator ended early", key);
        assert_eq!(
            iter.key(),
            key.as_ref(),
            "expected key {:?}, got {:?}",
            key,
            Bytes::copy_from_slice(iter.key())
        );
        assert_eq!(
            iter.value(),
            value.as_ref(),
            "unexpected value under key {:?}",
            key
        );
        iter.next().unwrap();
    }
    assert!(!iter.is_valid(), "iterator yielded more than expected");
}

pub fn key_of(idx: usize) -> Vec<u8> {
    format!("key_{:05}", idx).into_bytes()
}

pub fn value_of(idx: usize) -> Vec<u8> {
    format!("value_{:05}", idx).into_bytes()
}

pub fn as_bytes(pairs: &[(&str, &str)]) -> Vec<(Bytes, Bytes)> {
    pairs
        .iter()
        .map(|(k, v)| (Bytes::copy_from_slice(k.as_bytes()), Bytes::copy_from_slice(v.as_bytes())))
        .collect()
}
