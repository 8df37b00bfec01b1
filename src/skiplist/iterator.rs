use std::ops::Bound;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use ouroboros::self_referencing;
use parking_lot::RwLockReadGuard;

use crate::error::SiltError;

use super::{Arena, BytesComparator, KeyComparator, SkipList};

/// The iterator owns the list handle and the shared-lock guard that borrows
/// it, so the lock is pinned for exactly as long as the scan lives.
#[self_referencing]
struct SkipListIterInner<C: KeyComparator + 'static> {
    list: Arc<SkipList<C>>,
    #[borrows(list)]
    #[not_covariant]
    guard: RwLockReadGuard<'this, Arena>,
    cur: usize,
    upper: Bound<Bytes>,
    /// Current entry; an empty key marks exhaustion (real keys are never
    /// empty).
    item: (Bytes, Bytes),
}

/// Range-bounded scan over a [`SkipList`].
///
/// Holds the list's shared lock until [`close`](Self::close) or drop, which
/// means writers to the same list wait for open scans. `close` is
/// idempotent.
pub struct SkipListIterator<C: KeyComparator = BytesComparator> {
    inner: Option<SkipListIterInner<C>>,
}

impl<C: KeyComparator> SkipListIterator<C> {
    pub(crate) fn new(list: Arc<SkipList<C>>, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Self {
        let upper = match upper {
            Bound::Included(key) => Bound::Included(Bytes::copy_from_slice(key)),
            Bound::Excluded(key) => Bound::Excluded(Bytes::copy_from_slice(key)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let mut inner = SkipListIterInnerBuilder {
            list,
            guard_builder: |list| list.lock_shared(),
            cur: super::HEAD,
            upper,
            item: (Bytes::new(), Bytes::new()),
        }
        .build();
        inner.with_mut(|fields| {
            let start = fields.list.find_first_in(&*fields.guard, lower);
            *fields.cur = start;
            *fields.item = entry_at(fields.list, &*fields.guard, start, fields.upper);
        });
        Self { inner: Some(inner) }
    }

    pub fn has_next(&self) -> bool {
        self.inner
            .as_ref()
            .map(|inner| !inner.borrow_item().0.is_empty())
            .unwrap_or(false)
    }

    /// Panics when the iterator has ended or was closed.
    pub fn key(&self) -> &[u8] {
        let item = self.inner.as_ref().expect("iterator closed").borrow_item();
        assert!(!item.0.is_empty(), "iterator ended");
        &item.0
    }

    /// Panics when the iterator has ended or was closed.
    pub fn value(&self) -> &[u8] {
        let item = self.inner.as_ref().expect("iterator closed").borrow_item();
        assert!(!item.0.is_empty(), "iterator ended");
        &item.1
    }

    /// Advances to the next in-range entry. Once the walk has run past the
    /// upper bound (or the tail), further calls report
    /// [`SiltError::IteratorEnded`].
    pub fn next(&mut self) -> Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(SiltError::IteratorEnded.into());
        };
        if inner.borrow_item().0.is_empty() {
            return Err(SiltError::IteratorEnded.into());
        }
        inner.with_mut(|fields| {
            let next = fields.guard.next_at_level_zero(*fields.cur);
            *fields.cur = next;
            *fields.item = entry_at(fields.list, &*fields.guard, next, fields.upper);
        });
        Ok(())
    }

    /// Releases the shared lock. Safe to call more than once; after closing,
    /// `has_next` is false and `next` reports the end sentinel.
    pub fn close(&mut self) {
        self.inner = None;
    }
}

fn entry_at<C: KeyComparator>(
    list: &Arc<SkipList<C>>,
    arena: &Arena,
    idx: usize,
    upper: &Bound<Bytes>,
) -> (Bytes, Bytes) {
    if list.within_upper(arena, idx, upper) {
        let node = &arena.nodes[idx];
        (node.key.clone(), node.value.clone())
    } else {
        (Bytes::new(), Bytes::new())
    }
}
