//! The sub-range queue: intervals of the curve still waiting to be read.
//!
//! The scan splits its query interval recursively, always working on the
//! interval with the lowest keys first, so the queue is a LIFO stack:
//! splitting pushes the left half on top, finishing a sub-range pops it.
//! Nodes live in an arena indexed by `u32`; a second stack of free
//! indices recycles finished nodes before the arena grows, so a scan
//! allocates a bounded handful of nodes no matter how many times it
//! splits.

use crate::key::{BitKey, BoxAttrs, RawKey};

const NONE: u32 = u32::MAX;

/// One curve interval, closed on both ends, plus its cached attributes.
#[derive(Clone, Copy, Debug)]
pub struct SubQuery {
    pub low: BitKey,
    pub high: BitKey,
    pub attrs: BoxAttrs,
    /// `high` in raw form, compared against the on-page attribute on the
    /// solid emit path
    pub raw_high: RawKey,
    /// Next node down the stack
    prev: u32,
}

impl SubQuery {
    pub fn solid(&self) -> bool {
        self.attrs.contains(BoxAttrs::SOLID)
    }

    pub fn has_content(&self) -> bool {
        self.attrs.contains(BoxAttrs::HAS_CONTENT)
    }

    pub fn read_ready(&self) -> bool {
        self.attrs.contains(BoxAttrs::READ_READY)
    }
}

/// Arena-backed LIFO queue with a free list.
pub struct SubQueryPool {
    arena: Vec<SubQuery>,
    head: u32,
    free: u32,
}

impl SubQueryPool {
    pub fn new() -> Self {
        SubQueryPool {
            arena: Vec::new(),
            head: NONE,
            free: NONE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == NONE
    }

    /// Number of live sub-ranges on the queue.
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut at = self.head;
        while at != NONE {
            n += 1;
            at = self.arena[at as usize].prev;
        }
        n
    }

    /// Push a new sub-range; it becomes the top.  A node from the free
    /// list is reused before the arena grows.
    pub fn push(&mut self, low: BitKey, high: BitKey, attrs: BoxAttrs) {
        let node = SubQuery {
            low,
            high,
            attrs,
            raw_high: high.raw(),
            prev: self.head,
        };
        if self.free != NONE {
            let idx = self.free;
            self.free = self.arena[idx as usize].prev;
            self.arena[idx as usize] = node;
            self.head = idx;
        } else {
            self.arena.push(node);
            self.head = self.arena.len() as u32 - 1;
        }
    }

    pub fn top(&self) -> Option<&SubQuery> {
        (self.head != NONE).then(|| &self.arena[self.head as usize])
    }

    /// Copy of the top sub-range, for callers that mutate state while
    /// holding it.
    pub fn top_copy(&self) -> Option<SubQuery> {
        self.top().copied()
    }

    /// Rewrite the bounds of the top sub-range in place.
    pub fn update_top(&mut self, low: BitKey, high: BitKey, attrs: BoxAttrs) {
        debug_assert!(self.head != NONE);
        let node = &mut self.arena[self.head as usize];
        node.low = low;
        node.high = high;
        node.attrs = attrs;
        node.raw_high = high.raw();
    }

    /// Pop the top sub-range onto the free list.
    pub fn release_top(&mut self) {
        debug_assert!(self.head != NONE);
        let idx = self.head;
        self.head = self.arena[idx as usize].prev;
        self.arena[idx as usize].prev = self.free;
        self.free = idx;
    }

    /// Drop every live node and the free list.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.head = NONE;
        self.free = NONE;
    }

    /// Arena capacity in nodes, for tests asserting reuse.
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }
}

impl Default for SubQueryPool {
    fn default() -> Self {
        SubQueryPool::new()
    }
}
