//! Low-level cursor over the key B-tree.
//!
//! The cursor descends from the root for a start key, then walks leaf
//! slots strictly forward.  While descending it records the chosen slot of
//! every internal page on a parent stack, so reaching the end of a leaf
//! never re-runs the search: the walk climbs to the first ancestor with a
//! following slot and rides first slots back down to leaf depth.
//!
//! At most one page is pinned at any time.  Every transition releases the
//! held pin before acquiring the next one.  The descent tolerates
//! concurrent splits the Lehman-Yao way: whenever a page's high key is
//! below the search key, the cursor moves through the right link before
//! trusting the page.

use std::cmp::Ordering;
use std::sync::Arc;

use log::trace;

use crate::errors::{ZcurveErr, ZcurveResult};
use crate::key::{raw_cmp, BitKey, KeyKind, RawKey, KEY_WORDS};
use crate::pager::{BlockId, PagePin, PageStore, RowLocator};

/// Page and key traffic counters, for plans and tests that need to prove
/// how much I/O a scan performed.
#[derive(Clone, Copy, Default, Debug)]
pub struct ScanStats {
    pub pages_read: u64,
    pub keys_inspected: u64,
}

/// Saved cursor position for the peek-ahead walk.
struct SavedPos {
    blkno: BlockId,
    offset: usize,
    max_offset: usize,
    cur_val: BitKey,
    last_page_val: BitKey,
    raw_val: RawKey,
    iptr: RowLocator,
    pstack: Vec<(BlockId, usize)>,
}

pub struct LeafCursor<S: PageStore> {
    store: Arc<S>,
    kind: KeyKind,
    /// The single page held by this cursor
    pinned: Option<PagePin>,
    blkno: BlockId,
    /// Slot under the cursor; may sit one past `max_offset` transiently
    offset: usize,
    /// Last valid slot on the pinned page
    max_offset: usize,
    cur_val: BitKey,
    /// First key of the next leaf, set by a successful peek
    next_val: BitKey,
    last_page_val: BitKey,
    raw_val: RawKey,
    iptr: RowLocator,
    /// Root-to-leaf path of (block, slot) pairs
    pstack: Vec<(BlockId, usize)>,
    stats: ScanStats,
    open: bool,
}

impl<S: PageStore> LeafCursor<S> {
    pub fn open(store: Arc<S>, kind: KeyKind) -> ZcurveResult<Self> {
        if store.kind() != kind {
            return Err(ZcurveErr::InvalidArgument(
                "index stores a different key kind",
            ));
        }
        Ok(LeafCursor {
            store,
            kind,
            pinned: None,
            blkno: 0,
            offset: 0,
            max_offset: 0,
            cur_val: BitKey::new(kind),
            next_val: BitKey::new(kind),
            last_page_val: BitKey::new(kind),
            raw_val: [0; KEY_WORDS],
            iptr: RowLocator::default(),
            pstack: Vec::with_capacity(8),
            stats: ScanStats::default(),
            open: true,
        })
    }

    pub fn is_opened(&self) -> bool {
        self.open
    }

    /// Release the pinned page and the parent stack.  Idempotent.
    pub fn close(&mut self) {
        self.pinned = None;
        self.pstack.clear();
        self.open = false;
    }

    pub fn cur_val(&self) -> &BitKey {
        &self.cur_val
    }

    pub fn next_val(&self) -> &BitKey {
        &self.next_val
    }

    pub fn last_page_val(&self) -> &BitKey {
        &self.last_page_val
    }

    pub fn raw_val(&self) -> &RawKey {
        &self.raw_val
    }

    pub fn iptr(&self) -> RowLocator {
        self.iptr
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn max_offset(&self) -> usize {
        self.max_offset
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    fn read(&mut self, blk: BlockId) -> ZcurveResult<PagePin> {
        self.stats.pages_read += 1;
        self.store.read_page(blk)
    }

    /// Swap the held pin for another page, never holding two at once.
    fn release_and_read(&mut self, old: PagePin, blk: BlockId) -> ZcurveResult<PagePin> {
        drop(old);
        self.read(blk)
    }

    fn key_from_raw(&self, raw: RawKey) -> ZcurveResult<BitKey> {
        BitKey::from_raw(self.kind, raw)
            .map_err(|_| ZcurveErr::StructureCorrupt("stored key wider than the index kind"))
    }

    /// Refresh the per-slot state from the pinned page.
    fn load_slot(&mut self) -> ZcurveResult<()> {
        let pin = self
            .pinned
            .as_ref()
            .ok_or(ZcurveErr::StructureCorrupt("cursor holds no page"))?;
        let e = *pin.leaf_entry(self.offset)?;
        self.raw_val = e.key;
        self.cur_val = self.key_from_raw(e.key)?;
        self.iptr = e.iptr;
        self.stats.keys_inspected += 1;
        Ok(())
    }

    /// Refresh the per-page state from the pinned page.
    fn load_page_last(&mut self) -> ZcurveResult<()> {
        let pin = self
            .pinned
            .as_ref()
            .ok_or(ZcurveErr::StructureCorrupt("cursor holds no page"))?;
        let last = *pin.leaf_entry(self.max_offset)?;
        self.last_page_val = self.key_from_raw(last.key)?;
        Ok(())
    }

    /// Find the downlink slot for `key`: the last separator below it, with
    /// slot 0 acting as minus infinity.
    fn binsrch_inner(page: &PagePin, key: &RawKey) -> ZcurveResult<usize> {
        let n = page.nslots();
        if n == 0 {
            return Err(ZcurveErr::StructureCorrupt("empty internal page"));
        }
        let mut low = 1usize;
        let mut high = n;
        while low < high {
            let mid = low + (high - low) / 2;
            let sep = page.slot_key(mid)?;
            if raw_cmp(key, sep) == Ordering::Greater {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low - 1)
    }

    /// Find the first leaf slot whose key is not below `key`.  The result
    /// may be one past the last slot.
    fn binsrch_leaf(page: &PagePin, key: &RawKey) -> ZcurveResult<usize> {
        let mut low = 0usize;
        let mut high = page.nslots();
        while low < high {
            let mid = low + (high - low) / 2;
            let k = page.slot_key(mid)?;
            if raw_cmp(k, key) == Ordering::Less {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }

    /// Position the cursor at the first entry with key >= `start`.
    /// Returns false when the tree is empty or `start` exceeds every key.
    /// The cursor may be restarted with a new value without reopening.
    pub fn move_first(&mut self, start: &BitKey) -> ZcurveResult<bool> {
        debug_assert_eq!(start.kind(), self.kind);
        self.pinned = None;
        self.pstack.clear();
        let Some(mut blk) = self.store.root() else {
            return Ok(false);
        };
        let start_raw = start.raw();
        let mut pin = self.read(blk)?;
        loop {
            // The page may have split since its downlink was read; follow
            // right links while the high key is below the search key.
            loop {
                match pin.high_key().copied() {
                    Some(hk) if raw_cmp(&start_raw, &hk) == Ordering::Greater => {
                        let next = pin
                            .right_link()
                            .ok_or(ZcurveErr::StructureCorrupt("high key without right link"))?;
                        trace!("move_first: right-walk {blk} -> {next}");
                        blk = next;
                        pin = self.release_and_read(pin, next)?;
                    }
                    _ => break,
                }
            }
            if pin.is_leaf() {
                break;
            }
            let slot = Self::binsrch_inner(&pin, &start_raw)?;
            let child = pin.inner_entry(slot)?.child;
            self.pstack.push((blk, slot));
            blk = child;
            pin = self.release_and_read(pin, child)?;
        }

        self.blkno = blk;
        let n = pin.nslots();
        if n == 0 {
            self.pinned = Some(pin);
            self.offset = 0;
            self.max_offset = 0;
            return self.step_forward();
        }
        self.max_offset = n - 1;
        self.offset = Self::binsrch_leaf(&pin, &start_raw)?;
        self.pinned = Some(pin);
        if self.offset <= self.max_offset {
            self.load_slot()?;
            self.load_page_last()?;
            Ok(true)
        } else {
            // the start key sorts past this leaf
            self.step_forward()
        }
    }

    /// Advance one entry, crossing to the next leaf when the page is
    /// exhausted.
    pub fn move_next(&mut self) -> ZcurveResult<bool> {
        if self.offset < self.max_offset {
            self.offset += 1;
            self.load_slot()?;
            Ok(true)
        } else {
            self.step_forward()
        }
    }

    /// Step to the first entry of the next leaf.  Climbs the parent stack
    /// to the first ancestor with a following slot, then descends along
    /// first slots back to leaf depth, updating the stack to the new path.
    /// Returns false at the end of the tree.
    pub fn step_forward(&mut self) -> ZcurveResult<bool> {
        self.pinned = None;
        while let Some((pblk, pslot)) = self.pstack.pop() {
            let pin = self.read(pblk)?;
            if pslot + 1 >= pin.nslots() {
                continue;
            }
            let mut slot = pslot + 1;
            let mut blk = pblk;
            let mut pin = pin;
            loop {
                let child = pin.inner_entry(slot)?.child;
                self.pstack.push((blk, slot));
                blk = child;
                pin = self.release_and_read(pin, child)?;
                if pin.is_leaf() {
                    let n = pin.nslots();
                    if n == 0 {
                        return Err(ZcurveErr::StructureCorrupt("empty leaf page"));
                    }
                    trace!("step_forward: leaf {blk}");
                    self.blkno = blk;
                    self.offset = 0;
                    self.max_offset = n - 1;
                    self.pinned = Some(pin);
                    self.load_slot()?;
                    self.load_page_last()?;
                    self.next_val = self.cur_val;
                    return Ok(true);
                }
                slot = 0;
            }
        }
        Ok(false)
    }

    /// Peek at the first key of the next leaf without moving.  Only
    /// `next_val` changes; position, pinned page, and parent stack are
    /// restored before returning.  True when a next leaf exists and its
    /// first key does not exceed `check`.
    pub fn try_move_next(&mut self, check: &BitKey) -> ZcurveResult<bool> {
        if self.offset < self.max_offset {
            return Ok(true);
        }
        let saved = SavedPos {
            blkno: self.blkno,
            offset: self.offset,
            max_offset: self.max_offset,
            cur_val: self.cur_val,
            last_page_val: self.last_page_val,
            raw_val: self.raw_val,
            iptr: self.iptr,
            pstack: self.pstack.clone(),
        };
        match self.step_forward() {
            Ok(true) => {
                let peeked = self.cur_val;
                self.restore(saved)?;
                self.next_val = peeked;
                Ok(peeked.key_cmp(check) != Ordering::Greater)
            }
            Ok(false) => {
                self.restore(saved)?;
                Ok(false)
            }
            Err(e) => {
                // put the cursor back before surfacing the walk error
                let _ = self.restore(saved);
                Err(e)
            }
        }
    }

    fn restore(&mut self, saved: SavedPos) -> ZcurveResult<()> {
        self.pinned = None;
        self.pinned = Some(self.read(saved.blkno)?);
        self.blkno = saved.blkno;
        self.offset = saved.offset;
        self.max_offset = saved.max_offset;
        self.cur_val = saved.cur_val;
        self.last_page_val = saved.last_page_val;
        self.raw_val = saved.raw_val;
        self.iptr = saved.iptr;
        self.pstack = saved.pstack;
        Ok(())
    }
}
