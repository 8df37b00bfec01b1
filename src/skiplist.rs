pub mod iterator;

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;

pub use iterator::SkipListIterator;

/// Default number of express levels above level 0.
pub const DEFAULT_MAX_LEVEL: usize = 20;

/// Total order over raw keys. The list never interprets key bytes itself.
pub trait KeyComparator: Send + Sync + 'static {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Unsigned lexicographic order, the order every on-disk structure assumes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesComparator;

impl KeyComparator for BytesComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

// Sentinel slots in the arena. The head sorts before every key, the tail
// after every key; neither carries data.
pub(crate) const HEAD: usize = 0;
pub(crate) const TAIL: usize = 1;

#[derive(Clone, Copy)]
pub(crate) struct Link {
    pub(crate) prev: usize,
    pub(crate) next: usize,
}

pub(crate) struct Node {
    pub(crate) key: Bytes,
    pub(crate) value: Bytes,
    /// One link per level this node participates in; index 0 is the full
    /// sorted chain.
    pub(crate) links: Vec<Link>,
}

impl Node {
    fn height(&self) -> usize {
        self.links.len()
    }
}

/// Backing store for all nodes. Links are arena indices, so node lifetime is
/// the list's and the level chains can be doubly linked without ownership
/// cycles. Deleted nodes are unlinked but stay allocated until the list drops.
pub(crate) struct Arena {
    pub(crate) nodes: Vec<Node>,
    len: usize,
}

impl Arena {
    pub(crate) fn next_at_level_zero(&self, idx: usize) -> usize {
        self.nodes[idx].links[0].next
    }
}

/// A concurrent sorted map over byte keys and values.
///
/// Writers take the exclusive lock, readers the shared one. A range scan
/// holds the shared lock for its whole lifetime (see [`SkipListIterator`]),
/// so writes issued while a scan is open wait until it is closed.
pub struct SkipList<C: KeyComparator = BytesComparator> {
    arena: RwLock<Arena>,
    max_level: usize,
    cmp: C,
}

impl SkipList<BytesComparator> {
    pub fn new(max_level: usize) -> Self {
        Self::with_comparator(max_level, BytesComparator)
    }
}

impl<C: KeyComparator> SkipList<C> {
    pub fn with_comparator(max_level: usize, cmp: C) -> Self {
        assert!(max_level >= 1, "max level must be greater than 0");
        let sentinel_links = vec![
            Link {
                prev: HEAD,
                next: TAIL,
            };
            max_level + 1
        ];
        let head = Node {
            key: Bytes::new(),
            value: Bytes::new(),
            links: sentinel_links.clone(),
        };
        let tail = Node {
            key: Bytes::new(),
            value: Bytes::new(),
            links: sentinel_links,
        };
        Self {
            arena: RwLock::new(Arena {
                nodes: vec![head, tail],
                len: 0,
            }),
            max_level,
            cmp,
        }
    }

    pub fn size(&self) -> usize {
        self.arena.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let arena = self.arena.read();
        let mut preds = vec![HEAD; self.max_level + 1];
        let at = self.find_predecessors(&arena, key, &mut preds);
        if at != TAIL && self.cmp.compare(&arena.nodes[at].key, key) == Ordering::Equal {
            Some(arena.nodes[at].value.clone())
        } else {
            None
        }
    }

    /// Inserts or overwrites. Overwriting an existing key replaces the value
    /// in place without touching the level structure.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        let mut arena = self.arena.write();
        let mut preds = vec![HEAD; self.max_level + 1];
        let at = self.find_predecessors(&arena, key, &mut preds);
        if at != TAIL && self.cmp.compare(&arena.nodes[at].key, key) == Ordering::Equal {
            arena.nodes[at].value = Bytes::copy_from_slice(value);
            return;
        }

        let height = self.random_height();
        let idx = arena.nodes.len();
        let mut links = Vec::with_capacity(height);
        for lvl in 0..height {
            let pred = preds[lvl];
            let succ = arena.nodes[pred].links[lvl].next;
            links.push(Link {
                prev: pred,
                next: succ,
            });
        }
        arena.nodes.push(Node {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
            links,
        });
        for lvl in 0..height {
            let Link { prev, next } = arena.nodes[idx].links[lvl];
            arena.nodes[prev].links[lvl].next = idx;
            arena.nodes[next].links[lvl].prev = idx;
        }
        arena.len += 1;
    }

    /// Unlinks the key from every level it participates in. Returns false
    /// when the key is absent.
    pub fn delete(&self, key: &[u8]) -> bool {
        let mut arena = self.arena.write();
        let mut preds = vec![HEAD; self.max_level + 1];
        let at = self.find_predecessors(&arena, key, &mut preds);
        if at == TAIL || self.cmp.compare(&arena.nodes[at].key, key) != Ordering::Equal {
            return false;
        }
        for lvl in 0..arena.nodes[at].height() {
            let Link { prev, next } = arena.nodes[at].links[lvl];
            arena.nodes[prev].links[lvl].next = next;
            arena.nodes[next].links[lvl].prev = prev;
        }
        arena.len -= 1;
        true
    }

    /// Range scan over `[lower, upper]` with per-end inclusivity. The
    /// returned iterator pins this list's shared lock until closed or
    /// dropped.
    pub fn scan(
        self: &Arc<Self>,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> SkipListIterator<C> {
        SkipListIterator::new(self.clone(), lower, upper)
    }

    /// Unbounded scan over the whole list.
    pub fn iter(self: &Arc<Self>) -> SkipListIterator<C> {
        self.scan(Bound::Unbounded, Bound::Unbounded)
    }

    /// Descends from the top level. On return `preds[lvl]` is the last node
    /// strictly before `key` at that level; the returned index is the first
    /// level-0 node not before `key` (possibly the tail).
    fn find_predecessors(&self, arena: &Arena, key: &[u8], preds: &mut [usize]) -> usize {
        let mut node = HEAD;
        for lvl in (0..=self.max_level).rev() {
            loop {
                let next = arena.nodes[node].links[lvl].next;
                if next == TAIL {
                    break;
                }
                if self.cmp.compare(&arena.nodes[next].key, key) == Ordering::Less {
                    node = next;
                } else {
                    break;
                }
            }
            preds[lvl] = node;
        }
        arena.nodes[node].links[0].next
    }

    /// First level-0 node at or after the lower bound.
    pub(crate) fn find_first_in(&self, arena: &Arena, lower: Bound<&[u8]>) -> usize {
        let mut node = HEAD;
        for lvl in (0..=self.max_level).rev() {
            loop {
                let next = arena.nodes[node].links[lvl].next;
                if next == TAIL {
                    break;
                }
                let before_bound = match lower {
                    Bound::Unbounded => false,
                    Bound::Included(key) => {
                        self.cmp.compare(&arena.nodes[next].key, key) == Ordering::Less
                    }
                    Bound::Excluded(key) => {
                        self.cmp.compare(&arena.nodes[next].key, key) != Ordering::Greater
                    }
                };
                if before_bound {
                    node = next;
                } else {
                    break;
                }
            }
        }
        arena.nodes[node].links[0].next
    }

    pub(crate) fn within_upper(&self, arena: &Arena, idx: usize, upper: &Bound<Bytes>) -> bool {
        if idx == TAIL {
            return false;
        }
        match upper {
            Bound::Unbounded => true,
            Bound::Included(key) => {
                self.cmp.compare(&arena.nodes[idx].key, key) != Ordering::Greater
            }
            Bound::Excluded(key) => self.cmp.compare(&arena.nodes[idx].key, key) == Ordering::Less,
        }
    }

    pub(crate) fn lock_shared(&self) -> parking_lot::RwLockReadGuard<'_, Arena> {
        self.arena.read()
    }

    /// Each level above 0 is joined with probability 1/2.
    fn random_height(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 1;
        while height <= self.max_level && rng.gen_bool(0.5) {
            height += 1;
        }
        height
    }
}
