pub mod concat_iterator;
pub mod merge_iterator;
pub mod two_merge_iterator;

/// Common behavior of every iterator in the stack, from block iterators up to
/// the engine-level scan. Calling `key` or `value` on an invalid iterator is
/// a programmer error.
pub trait StorageIterator {
    // The key may borrow from the iterator itself.
    type KeyType<'a>: PartialEq + Eq + PartialOrd + Ord
    where
        Self: 'a;

    /// Value at the current position.
    fn value(&self) -> &[u8];
    /// Key at the current position.
    fn key(&self) -> Self::KeyType<'_>;
    /// Whether the iterator currently points at an entry.
    fn is_valid(&self) -> bool;
    /// Moves to the next position.
    fn next(&mut self) -> anyhow::Result<()>;
    /// Number of live leaf iterators underneath this one.
    fn number_of_iterators(&self) -> usize {
        1
    }
}
