use anyhow::Result;

use super::StorageIterator;

/// Merges two already-merged streams. At every step the stream with the
/// smaller key is chosen; ties go to A. With `skip_on_duplicate`, B is
/// advanced past any key equal to A's before the choice, so A's version wins
/// and each key surfaces once — the engine always puts the newer stream in
/// the A seat.
pub struct TwoMergeIterator<A: StorageIterator, B: StorageIterator> {
    a: A,
    b: B,
    choose_a: bool,
    skip_on_duplicate: bool,
}

impl<
        A: 'static + for<'a> StorageIterator<KeyType<'a> = &'a [u8]>,
        B: 'static + for<'a> StorageIterator<KeyType<'a> = &'a [u8]>,
    > TwoMergeIterator<A, B>
{
    pub fn create(a: A, b: B) -> Result<Self> {
        Self::create_with_options(a, b, true)
    }

    pub fn create_with_options(a: A, b: B, skip_on_duplicate: bool) -> Result<Self> {
        let mut iter = Self {
            a,
            b,
            choose_a: false,
            skip_on_duplicate,
        };
        if iter.skip_on_duplicate {
            iter.skip_b()?;
        }
        iter.choose_a = iter.should_choose_a();
        Ok(iter)
    }

    fn should_choose_a(&self) -> bool {
        if !self.a.is_valid() {
            return false;
        }
        if !self.b.is_valid() {
            return true;
        }
        self.a.key() <= self.b.key()
    }

    fn skip_b(&mut self) -> Result<()> {
        if self.a.is_valid() && self.b.is_valid() && self.a.key() == self.b.key() {
            self.b.next()?;
        }
        Ok(())
    }
}

impl<
        A: 'static + for<'a> StorageIterator<KeyType<'a> = &'a [u8]>,
        B: 'static + for<'a> StorageIterator<KeyType<'a> = &'a [u8]>,
    > StorageIterator for TwoMergeIterator<A, B>
{
    type KeyType<'a> = &'a [u8];

    fn key(&self) -> &[u8] {
        if self.choose_a {
            self.a.key()
        } else {
            self.b.key()
        }
    }

    fn value(&self) -> &[u8] {
        if self.choose_a {
            self.a.value()
        } else {
            self.b.value()
        }
    }

    fn is_valid(&self) -> bool {
        if self.choose_a {
            self.a.is_valid()
        } else {
            self.b.is_valid()
        }
    }

    fn next(&mut self) -> Result<()> {
        if self.choose_a {
            self.a.next()?;
        } else {
            self.b.next()?;
        }
        if self.skip_on_duplicate {
            self.skip_b()?;
        }
        self.choose_a = self.should_choose_a();
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.a.number_of_iterators() + self.b.number_of_iterators()
    }
}
