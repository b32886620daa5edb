//! Page-level access to the ordinal B-tree that stores the curve keys.
//!
//! The scan machinery consumes a deliberately small contract: find the
//! root, read a page under a shared pin, look at its slots, follow a
//! downlink or a right-sibling link.  `MemIndex` is the reference store
//! behind that contract, an immutable tree bulk-built bottom-up from
//! presorted `(raw key, row locator)` pairs.  Pages carry right links and
//! high keys, so the cursor's right-walk logic is real even though this
//! store never splits.
//!
//! A pin is a shared read reference to one page.  The store counts
//! outstanding pins; the cursor is expected to hold at most one at any
//! moment and the tests assert it.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::errors::{ZcurveErr, ZcurveResult};
use crate::key::{raw_cmp, BitKey, KeyKind, RawKey};

pub type BlockId = u32;

/// Default number of slots per page.  Small enough that modest test
/// fixtures still produce multi-level trees.
pub const DEFAULT_FANOUT: usize = 64;

/// Locator of a heap row: the block that stores it and the slot within.
/// Ordering is `(block, slot)`, which is the sequential heap order the
/// result stager sorts into.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct RowLocator {
    pub block: u32,
    pub slot: u16,
}

impl RowLocator {
    pub fn new(block: u32, slot: u16) -> Self {
        RowLocator { block, slot }
    }
}

/// One slot of a leaf page: the indexed attribute plus the row it points
/// at.
#[derive(Clone, Copy, Debug)]
pub struct LeafEntry {
    pub key: RawKey,
    pub iptr: RowLocator,
}

/// One slot of an internal page.  The separator is the smallest key
/// reachable through the child; slot 0's separator is never compared,
/// search treats it as minus infinity.
#[derive(Clone, Copy, Debug)]
pub struct InnerEntry {
    pub key: RawKey,
    pub child: BlockId,
}

enum PageBody {
    Leaf(Vec<LeafEntry>),
    Inner(Vec<InnerEntry>),
}

pub struct IndexPage {
    body: PageBody,
    /// Upper bound for every key on the page; the rightmost page of a
    /// level has none
    high_key: Option<RawKey>,
    /// Right sibling on the same level
    right: Option<BlockId>,
}

impl IndexPage {
    pub(crate) fn new_leaf(
        entries: Vec<LeafEntry>,
        high_key: Option<RawKey>,
        right: Option<BlockId>,
    ) -> Self {
        IndexPage {
            body: PageBody::Leaf(entries),
            high_key,
            right,
        }
    }

    pub(crate) fn new_inner(
        entries: Vec<InnerEntry>,
        high_key: Option<RawKey>,
        right: Option<BlockId>,
    ) -> Self {
        IndexPage {
            body: PageBody::Inner(entries),
            high_key,
            right,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, PageBody::Leaf(_))
    }

    pub fn nslots(&self) -> usize {
        match &self.body {
            PageBody::Leaf(v) => v.len(),
            PageBody::Inner(v) => v.len(),
        }
    }

    pub fn high_key(&self) -> Option<&RawKey> {
        self.high_key.as_ref()
    }

    pub fn right_link(&self) -> Option<BlockId> {
        self.right
    }

    pub fn leaf_entry(&self, slot: usize) -> ZcurveResult<&LeafEntry> {
        match &self.body {
            PageBody::Leaf(v) => v
                .get(slot)
                .ok_or(ZcurveErr::StructureCorrupt("leaf slot out of bounds")),
            PageBody::Inner(_) => Err(ZcurveErr::StructureCorrupt(
                "leaf access on an internal page",
            )),
        }
    }

    pub fn inner_entry(&self, slot: usize) -> ZcurveResult<&InnerEntry> {
        match &self.body {
            PageBody::Inner(v) => v
                .get(slot)
                .ok_or(ZcurveErr::StructureCorrupt("internal slot out of bounds")),
            PageBody::Leaf(_) => Err(ZcurveErr::StructureCorrupt(
                "downlink access on a leaf page",
            )),
        }
    }

    /// Key stored in the given slot, leaf or internal.
    pub fn slot_key(&self, slot: usize) -> ZcurveResult<&RawKey> {
        match &self.body {
            PageBody::Leaf(v) => v.get(slot).map(|e| &e.key),
            PageBody::Inner(v) => v.get(slot).map(|e| &e.key),
        }
        .ok_or(ZcurveErr::StructureCorrupt("slot out of bounds"))
    }
}

/// Shared pin on one page.  Dropping the pin releases it.
pub struct PagePin {
    page: Arc<IndexPage>,
    pins: Arc<AtomicUsize>,
}

impl Deref for PagePin {
    type Target = IndexPage;

    fn deref(&self) -> &IndexPage {
        &self.page
    }
}

impl Drop for PagePin {
    fn drop(&mut self) {
        let _ = self.pins.fetch_sub(1, AtomicOrdering::Relaxed);
    }
}

/// The block-store contract the cursor drives.
pub trait PageStore {
    /// Key kind of the indexed attribute.
    fn kind(&self) -> KeyKind;

    /// Root block, or None when the index is empty.
    fn root(&self) -> Option<BlockId>;

    /// Pin and return a page.
    fn read_page(&self, blk: BlockId) -> ZcurveResult<PagePin>;
}

/// Immutable in-memory B-tree over raw curve keys.
pub struct MemIndex {
    kind: KeyKind,
    pages: Vec<Arc<IndexPage>>,
    root: Option<BlockId>,
    pins: Arc<AtomicUsize>,
}

impl MemIndex {
    /// Bulk-build a tree from `(raw key, row locator)` pairs.  The pairs
    /// are stable-sorted by key, so duplicate keys keep their input
    /// order.
    pub fn build(
        kind: KeyKind,
        mut entries: Vec<(RawKey, RowLocator)>,
        fanout: usize,
    ) -> ZcurveResult<MemIndex> {
        if fanout < 2 {
            return Err(ZcurveErr::InvalidArgument("page fanout must be at least 2"));
        }
        for (key, _) in &entries {
            BitKey::from_raw(kind, *key)?;
        }
        entries.sort_by(|a, b| raw_cmp(&a.0, &b.0));

        let mut pages: Vec<IndexPage> = Vec::new();
        let mut root = None;
        if !entries.is_empty() {
            // leaf level
            let mut level: Vec<(RawKey, BlockId)> = Vec::new();
            let first = pages.len();
            for chunk in entries.chunks(fanout) {
                let blk = pages.len() as BlockId;
                pages.push(IndexPage {
                    body: PageBody::Leaf(
                        chunk
                            .iter()
                            .map(|&(key, iptr)| LeafEntry { key, iptr })
                            .collect(),
                    ),
                    high_key: None,
                    right: None,
                });
                level.push((chunk[0].0, blk));
            }
            Self::link_level(&mut pages, first);

            // internal levels up to the root
            while level.len() > 1 {
                let first = pages.len();
                let mut next: Vec<(RawKey, BlockId)> = Vec::new();
                for chunk in level.chunks(fanout) {
                    let blk = pages.len() as BlockId;
                    pages.push(IndexPage {
                        body: PageBody::Inner(
                            chunk
                                .iter()
                                .map(|&(key, child)| InnerEntry { key, child })
                                .collect(),
                        ),
                        high_key: None,
                        right: None,
                    });
                    next.push((chunk[0].0, blk));
                }
                Self::link_level(&mut pages, first);
                level = next;
            }
            root = Some(level[0].1);
        }

        Ok(MemIndex {
            kind,
            pages: pages.into_iter().map(Arc::new).collect(),
            root,
            pins: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Chain right links and high keys across the pages of one level.
    fn link_level(pages: &mut [IndexPage], first: usize) {
        for i in first..pages.len().saturating_sub(1) {
            let next_first = match &pages[i + 1].body {
                PageBody::Leaf(v) => v[0].key,
                PageBody::Inner(v) => v[0].key,
            };
            pages[i].right = Some((i + 1) as BlockId);
            pages[i].high_key = Some(next_first);
        }
    }

    /// Assemble an index from hand-built pages.  Lets tests model trees
    /// in states the bulk build never produces, such as a split that has
    /// not reached the parent yet.
    pub(crate) fn from_pages(kind: KeyKind, pages: Vec<IndexPage>, root: Option<BlockId>) -> Self {
        MemIndex {
            kind,
            pages: pages.into_iter().map(Arc::new).collect(),
            root,
            pins: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Outstanding pins across all pages.
    pub fn pinned_pages(&self) -> usize {
        self.pins.load(AtomicOrdering::Relaxed)
    }
}

impl PageStore for MemIndex {
    fn kind(&self) -> KeyKind {
        self.kind
    }

    fn root(&self) -> Option<BlockId> {
        self.root
    }

    fn read_page(&self, blk: BlockId) -> ZcurveResult<PagePin> {
        let page = self
            .pages
            .get(blk as usize)
            .ok_or(ZcurveErr::StructureCorrupt("downlink to a missing block"))?;
        let _ = self.pins.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(PagePin {
            page: Arc::clone(page),
            pins: Arc::clone(&self.pins),
        })
    }
}

/// Name registry backing open-by-name lookups.
#[derive(Default)]
pub struct Catalog {
    indexes: HashMap<String, Arc<MemIndex>>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn register(&mut self, name: &str, index: MemIndex) -> Arc<MemIndex> {
        let index = Arc::new(index);
        self.indexes.insert(name.to_string(), Arc::clone(&index));
        index
    }

    pub fn open(&self, name: &str) -> ZcurveResult<Arc<MemIndex>> {
        self.indexes
            .get(name)
            .cloned()
            .ok_or_else(|| ZcurveErr::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KEY_WORDS;

    fn raw(v: u64) -> RawKey {
        let mut r = [0u64; KEY_WORDS];
        r[0] = v;
        r
    }

    fn sample_entries(n: u64) -> Vec<(RawKey, RowLocator)> {
        (0..n)
            .map(|i| (raw(i), RowLocator::new((i / 8) as u32, (i % 8) as u16)))
            .collect()
    }

    #[test]
    fn test_build_empty() {
        let idx = MemIndex::build(KeyKind::Z2d, Vec::new(), 4).unwrap();
        assert_eq!(idx.root(), None);
        assert_eq!(idx.page_count(), 0);
    }

    #[test]
    fn test_build_single_leaf() {
        let idx = MemIndex::build(KeyKind::Z2d, sample_entries(3), 4).unwrap();
        let root = idx.read_page(idx.root().unwrap()).unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.nslots(), 3);
        assert_eq!(root.high_key(), None);
        assert_eq!(root.right_link(), None);
    }

    #[test]
    fn test_build_multi_level() {
        // 64 entries at fanout 4: 16 leaves, 4 internals, 1 root
        let idx = MemIndex::build(KeyKind::Z2d, sample_entries(64), 4).unwrap();
        assert_eq!(idx.page_count(), 21);
        let root = idx.read_page(idx.root().unwrap()).unwrap();
        assert!(!root.is_leaf());
        assert_eq!(root.nslots(), 4);

        // walking the leaf chain yields every key in order
        let mut blk = 0;
        let mut seen = Vec::new();
        loop {
            let page = idx.read_page(blk).unwrap();
            assert!(page.is_leaf());
            for s in 0..page.nslots() {
                seen.push(page.leaf_entry(s).unwrap().key[0]);
            }
            match page.right_link() {
                Some(next) => {
                    if let Some(hk) = page.high_key() {
                        assert_eq!(hk[0], seen.last().unwrap() + 1);
                    }
                    blk = next;
                }
                None => break,
            }
        }
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_duplicates_keep_input_order() {
        let entries = vec![
            (raw(7), RowLocator::new(9, 1)),
            (raw(7), RowLocator::new(2, 5)),
            (raw(3), RowLocator::new(1, 1)),
        ];
        let idx = MemIndex::build(KeyKind::Z2d, entries, 8).unwrap();
        let page = idx.read_page(idx.root().unwrap()).unwrap();
        assert_eq!(page.leaf_entry(0).unwrap().iptr, RowLocator::new(1, 1));
        assert_eq!(page.leaf_entry(1).unwrap().iptr, RowLocator::new(9, 1));
        assert_eq!(page.leaf_entry(2).unwrap().iptr, RowLocator::new(2, 5));
    }

    #[test]
    fn test_build_rejects_wide_keys() {
        let mut r = [0u64; KEY_WORDS];
        r[1] = 1; // 65 bits, too wide for a 2D key
        let err = MemIndex::build(KeyKind::Z2d, vec![(r, RowLocator::default())], 4);
        assert!(matches!(err, Err(ZcurveErr::InvalidArgument(_))));
    }

    #[test]
    fn test_pin_accounting() {
        let idx = MemIndex::build(KeyKind::Z2d, sample_entries(10), 4).unwrap();
        assert_eq!(idx.pinned_pages(), 0);
        let a = idx.read_page(0).unwrap();
        assert_eq!(idx.pinned_pages(), 1);
        let b = idx.read_page(1).unwrap();
        assert_eq!(idx.pinned_pages(), 2);
        drop(a);
        assert_eq!(idx.pinned_pages(), 1);
        drop(b);
        assert_eq!(idx.pinned_pages(), 0);
    }

    #[test]
    fn test_missing_block_is_corrupt() {
        let idx = MemIndex::build(KeyKind::Z2d, sample_entries(4), 4).unwrap();
        assert!(matches!(
            idx.read_page(99),
            Err(ZcurveErr::StructureCorrupt(_))
        ));
    }

    #[test]
    fn test_catalog_open() {
        let mut cat = Catalog::new();
        let idx = MemIndex::build(KeyKind::Z2d, sample_entries(4), 4).unwrap();
        cat.register("pt_idx", idx);
        assert!(cat.open("pt_idx").is_ok());
        assert!(matches!(cat.open("nope"), Err(ZcurveErr::NotFound(_))));
    }
}
