//! The range-search driver.
//!
//! A `SpatialScan` turns an axis-aligned box query into a sequence of
//! B-tree cursor movements.  It keeps a stack of curve sub-ranges that
//! jointly cover the part of the query interval not yet read.  The pump
//! takes the top sub-range, positions the cursor at its lower bound, and
//! splits the range at its longest common key prefix for as long as the
//! current leaf cannot cover it; halves whose extent misses the box are
//! dropped without touching a page.  Once a sub-range is tight enough,
//! rows stream out: wholesale on a solid range, where a raw key compare
//! against the cached upper bound replaces the row filter, or through the
//! per-row box test otherwise.
//!
//! The scan yields `(key, row locator)` pairs in non-decreasing key
//! order.  It owns one cursor and releases the pinned page when the
//! stream ends, errors, or is closed early.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use log::debug;

use crate::cursor::{LeafCursor, ScanStats};
use crate::errors::{ZcurveErr, ZcurveResult};
use crate::key::{raw_cmp, BitKey, BoxAttrs, KeyKind, MAX_COORDS};
use crate::pager::{PageStore, RowLocator};
use crate::subquery::{SubQuery, SubQueryPool};

/// Counters for the decomposition work a scan performed.
#[derive(Clone, Copy, Default, Debug)]
pub struct SplitStats {
    /// Sub-range bisections
    pub splits: u64,
    /// Sub-ranges dropped because their extent missed the box
    pub pruned: u64,
    /// Per-row box tests (zero while consuming solid ranges)
    pub box_tests: u64,
}

pub struct SpatialScan<S: PageStore> {
    cursor: LeafCursor<S>,
    pool: SubQueryPool,
    kind: KeyKind,
    ncoords: usize,
    min_point: [u32; MAX_COORDS],
    max_point: [u32; MAX_COORDS],
    /// The box misses the curve domain entirely
    degenerate: bool,
    cur_key: BitKey,
    last_key: BitKey,
    iptr: RowLocator,
    sub_query_finished: bool,
    interrupt: Option<Arc<AtomicBool>>,
    stats: SplitStats,
}

impl<S: PageStore> SpatialScan<S> {
    /// Set up a scan of the closed box `[lo, hi]`.  The box is clamped to
    /// the curve's coordinate domain; an inverted box is refused.
    pub fn new(store: Arc<S>, kind: KeyKind, lo: &[u32], hi: &[u32]) -> ZcurveResult<Self> {
        let d = kind.ncoords();
        if lo.len() != d || hi.len() != d {
            return Err(ZcurveErr::InvalidArgument(
                "coordinate count does not match the key kind",
            ));
        }
        if lo.iter().zip(hi).any(|(l, h)| l > h) {
            return Err(ZcurveErr::InvalidArgument("query box is inverted"));
        }
        let max = kind.coord_max();
        let mut min_point = [0u32; MAX_COORDS];
        let mut max_point = [0u32; MAX_COORDS];
        let mut degenerate = false;
        for i in 0..d {
            if lo[i] > max {
                degenerate = true;
            }
            min_point[i] = lo[i].min(max);
            max_point[i] = hi[i].min(max);
        }
        let cursor = LeafCursor::open(store, kind)?;
        Ok(SpatialScan {
            cursor,
            pool: SubQueryPool::new(),
            kind,
            ncoords: d,
            min_point,
            max_point,
            degenerate,
            cur_key: BitKey::new(kind),
            last_key: BitKey::new(kind),
            iptr: RowLocator::default(),
            sub_query_finished: false,
            interrupt: None,
            stats: SplitStats::default(),
        })
    }

    /// Install a cancellation flag.  A set flag observed between yields
    /// ends the stream with `Interrupted`.
    pub fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn is_open(&self) -> bool {
        self.cursor.is_opened()
    }

    pub fn cursor_stats(&self) -> ScanStats {
        self.cursor.stats()
    }

    pub fn split_stats(&self) -> SplitStats {
        self.stats
    }

    /// Release the pinned page, the parent stack, and every queued
    /// sub-range.  Idempotent; further calls yield end-of-stream.
    pub fn close(&mut self) {
        self.pool.clear();
        self.cursor.close();
    }

    /// Start the scan and return the first match.
    pub fn move_first(&mut self) -> ZcurveResult<Option<(BitKey, RowLocator)>> {
        if self.degenerate {
            self.close();
            return Ok(None);
        }
        let d = self.ncoords;
        let (low, high) =
            BitKey::limits_from_box(self.kind, &self.min_point[..d], &self.max_point[..d])?;
        let attrs =
            BitKey::box_attributes(&self.min_point[..d], &self.max_point[..d], &low, &high);
        self.pool.push(low, high, attrs);
        self.find_next_match()
    }

    /// Return the next match, resuming where the previous yield stopped.
    pub fn move_next(&mut self) -> ZcurveResult<Option<(BitKey, RowLocator)>> {
        if let Some(flag) = &self.interrupt {
            if flag.load(AtomicOrdering::Relaxed) {
                self.close();
                return Err(ZcurveErr::Interrupted);
            }
        }
        if !self.cursor.is_opened() {
            return Ok(None);
        }
        if self.sub_query_finished {
            return self.find_next_match();
        }
        loop {
            let Some(q) = self.pool.top_copy() else {
                break;
            };
            if q.solid() {
                if !self.query_next_key()? {
                    self.close();
                    return Ok(None);
                }
                if !self.test_raw_key(&q) {
                    break;
                }
                return Ok(Some((self.cur_key, self.iptr)));
            } else {
                // the sub-range may continue on the next leaf only when
                // that leaf starts within its bounds
                if !self.check_next_page(&q)? {
                    break;
                }
                if !self.query_next_key()? {
                    self.close();
                    return Ok(None);
                }
                if self.cur_key.key_cmp(&q.high) == Ordering::Greater {
                    break;
                }
                if self.check_key(&q) {
                    return Ok(Some((self.cur_key, self.iptr)));
                }
            }
        }
        self.release_sub_query();
        self.find_next_match()
    }

    /// Main pump: take sub-ranges off the queue, refine them against the
    /// pages they land on, and emit the first match found.
    fn find_next_match(&mut self) -> ZcurveResult<Option<(BitKey, RowLocator)>> {
        let d = self.ncoords;
        'queue: while let Some(top) = self.pool.top_copy() {
            if !top.has_content() {
                self.stats.pruned += 1;
                debug!("prune sub-range, extent misses the box");
                self.pool.release_top();
                continue;
            }
            self.sub_query_finished = false;

            // Position the cursor and refine the interval.  Splitting may
            // prune left halves, which advances the lower bound past the
            // cursor; when that happens the cursor is repositioned and
            // refinement continues on the new page.
            let mut q = top;
            loop {
                if !self.query_find(&q.low)? {
                    self.close();
                    return Ok(None);
                }
                let sought = q.low;
                while !q.read_ready() && self.last_key.key_cmp(&q.high) == Ordering::Less {
                    let (left_high, right_low) = BitKey::split(&q.low, &q.high);
                    if left_high == q.high && right_low == q.low {
                        // the interval cannot be refined further
                        break;
                    }
                    self.stats.splits += 1;
                    let left_attrs = BitKey::box_attributes(
                        &self.min_point[..d],
                        &self.max_point[..d],
                        &q.low,
                        &left_high,
                    );
                    let right_attrs = BitKey::box_attributes(
                        &self.min_point[..d],
                        &self.max_point[..d],
                        &right_low,
                        &q.high,
                    );
                    let left_low = q.low;
                    self.pool.update_top(right_low, q.high, right_attrs);
                    if left_attrs.contains(BoxAttrs::HAS_CONTENT) {
                        self.pool.push(left_low, left_high, left_attrs);
                    } else {
                        self.stats.pruned += 1;
                        debug!("prune split-off half, extent misses the box");
                    }
                    let Some(next_top) = self.pool.top_copy() else {
                        break;
                    };
                    q = next_top;
                }
                if !q.has_content() {
                    self.stats.pruned += 1;
                    self.pool.release_top();
                    continue 'queue;
                }
                if q.low == sought {
                    break;
                }
            }

            // emit from the positioned cursor
            loop {
                let Some(q) = self.pool.top_copy() else {
                    break;
                };
                if q.solid() {
                    if !self.test_raw_key(&q) {
                        break;
                    }
                    return Ok(Some((self.cur_key, self.iptr)));
                } else {
                    if self.cur_key.key_cmp(&q.high) == Ordering::Greater {
                        break;
                    }
                    if self.check_key(&q) {
                        return Ok(Some((self.cur_key, self.iptr)));
                    }
                    if !self.check_next_page(&q)? {
                        break;
                    }
                    if !self.query_next_key()? {
                        self.close();
                        return Ok(None);
                    }
                }
            }
            self.release_sub_query();
        }
        self.close();
        Ok(None)
    }

    /// Reposition the cursor at the first key of the sub-range.
    fn query_find(&mut self, start: &BitKey) -> ZcurveResult<bool> {
        let found = self.cursor.move_first(start)?;
        self.sync_cursor();
        Ok(found)
    }

    /// Move the cursor one entry forward.
    fn query_next_key(&mut self) -> ZcurveResult<bool> {
        let found = self.cursor.move_next()?;
        self.sync_cursor();
        Ok(found)
    }

    fn sync_cursor(&mut self) {
        self.cur_key = *self.cursor.cur_val();
        self.last_key = *self.cursor.last_page_val();
        self.iptr = self.cursor.iptr();
    }

    /// At the end of a page, decide whether the sub-range continues on
    /// the next leaf.  The cursor position is preserved either way.
    fn check_next_page(&mut self, q: &SubQuery) -> ZcurveResult<bool> {
        if self.cursor.offset() == self.cursor.max_offset() {
            self.cursor.try_move_next(&q.high)
        } else {
            Ok(true)
        }
    }

    /// Solid fast path: the stored attribute against the cached upper
    /// bound, no decode.
    fn test_raw_key(&self, q: &SubQuery) -> bool {
        raw_cmp(self.cursor.raw_val(), &q.raw_high) != Ordering::Greater
    }

    /// Row filter: does the key under the cursor decode into the box?
    /// Z sub-range bounds are box corners, so the masked compare against
    /// them answers directly; Hilbert bounds are not corners, so the key
    /// is tested against the query box itself.
    fn check_key(&mut self, q: &SubQuery) -> bool {
        self.stats.box_tests += 1;
        if self.kind.is_hilbert() {
            let c = self.cur_key.decode();
            (0..self.ncoords).all(|i| self.min_point[i] <= c[i] && c[i] <= self.max_point[i])
        } else {
            self.cur_key.between(&q.low, &q.high)
        }
    }

    /// Retire the top sub-range onto the free list.
    fn release_sub_query(&mut self) {
        if !self.pool.is_empty() {
            self.pool.release_top();
        }
        self.sub_query_finished = true;
    }
}

impl<S: PageStore> Drop for SpatialScan<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::bignum::to_bignum;
    use crate::pager::MemIndex;

    /// Index every point of a `side`^d grid under the given kind.
    fn grid_index(kind: KeyKind, side: u32, fanout: usize) -> Arc<MemIndex> {
        let d = kind.ncoords();
        let mut entries = Vec::new();
        let mut coords = vec![0u32; d];
        let mut row = 0u64;
        loop {
            let key = BitKey::encode(kind, &coords).unwrap();
            entries.push((
                key.raw(),
                RowLocator::new((row / 8) as u32, (row % 8) as u16),
            ));
            row += 1;
            let mut i = 0;
            loop {
                coords[i] += 1;
                if coords[i] < side {
                    break;
                }
                coords[i] = 0;
                i += 1;
                if i == d {
                    return Arc::new(MemIndex::build(kind, entries, fanout).unwrap());
                }
            }
        }
    }

    fn collect(scan: &mut SpatialScan<MemIndex>) -> Vec<(BitKey, RowLocator)> {
        let mut out = Vec::new();
        let mut item = scan.move_first().unwrap();
        while let Some(hit) = item {
            out.push(hit);
            item = scan.move_next().unwrap();
        }
        out
    }

    fn in_box(c: &[u32], lo: &[u32], hi: &[u32]) -> bool {
        lo.iter().zip(hi).zip(c).all(|((l, h), v)| l <= v && v <= h)
    }

    /// Brute-force oracle over the same grid.
    fn expect_count(side: u32, lo: &[u32], hi: &[u32]) -> usize {
        lo.iter()
            .zip(hi)
            .map(|(l, h)| (h.min(&(side - 1)) + 1).saturating_sub(*l) as usize)
            .product()
    }

    #[test]
    fn test_z2d_exhaustive_boxes() {
        let idx = grid_index(KeyKind::Z2d, 8, 4);
        for (lo, hi) in [
            ([0u32, 0], [7u32, 7]),
            ([0, 0], [0, 0]),
            ([3, 0], [3, 7]),
            ([1, 2], [6, 5]),
            ([1, 1], [2, 2]),
            ([5, 5], [7, 7]),
            ([2, 2], [2, 2]),
        ] {
            let mut scan = SpatialScan::new(Arc::clone(&idx), KeyKind::Z2d, &lo, &hi).unwrap();
            let hits = collect(&mut scan);
            assert_eq!(hits.len(), expect_count(8, &lo, &hi), "box {lo:?}..{hi:?}");
            for (key, _) in &hits {
                let c = key.decode();
                assert!(in_box(&c[..2], &lo, &hi));
            }
            // keys come out in curve order
            for w in hits.windows(2) {
                assert!(w[0].0.key_cmp(&w[1].0) != Ordering::Greater);
            }
            assert_eq!(idx.pinned_pages(), 0);
        }
    }

    #[test]
    fn test_z3d_solid_cube_bypasses_box_test() {
        let idx = grid_index(KeyKind::Z3d, 16, 64);
        let mut scan =
            SpatialScan::new(idx, KeyKind::Z3d, &[0, 0, 0], &[7, 7, 7]).unwrap();
        let hits = collect(&mut scan);
        assert_eq!(hits.len(), 512);
        // an aligned cube is consumed wholesale, no per-row filter
        assert_eq!(scan.split_stats().box_tests, 0);
        assert_eq!(scan.split_stats().splits, 0);
    }

    #[test]
    fn test_z3d_skewed_box_splits() {
        let idx = grid_index(KeyKind::Z3d, 16, 64);
        let mut scan =
            SpatialScan::new(idx, KeyKind::Z3d, &[1, 1, 1], &[6, 6, 6]).unwrap();
        let hits = collect(&mut scan);
        assert_eq!(hits.len(), 216);
        assert!(scan.split_stats().splits >= 3, "{:?}", scan.split_stats());
        for (key, _) in &hits {
            let c = key.decode();
            assert!(in_box(&c[..3], &[1, 1, 1], &[6, 6, 6]));
        }
    }

    #[test]
    fn test_z2d_strip_reads_few_keys() {
        let idx = grid_index(KeyKind::Z2d, 16, 8);
        let mut scan = SpatialScan::new(idx, KeyKind::Z2d, &[3, 0], &[3, 15]).unwrap();
        let hits = collect(&mut scan);
        assert_eq!(hits.len(), 16);
        for (key, _) in &hits {
            assert_eq!(key.decode()[0], 3);
        }
        // far fewer than the 256 stored keys get inspected
        assert!(
            scan.cursor_stats().keys_inspected < 64,
            "inspected {}",
            scan.cursor_stats().keys_inspected
        );
    }

    #[test]
    fn test_z8d_box() {
        let idx = grid_index(KeyKind::Z8d, 2, 16);
        let lo = [0u32; 8];
        let hi = [1, 1, 0, 1, 0, 1, 1, 0];
        let mut scan = SpatialScan::new(idx, KeyKind::Z8d, &lo, &hi).unwrap();
        let hits = collect(&mut scan);
        assert_eq!(hits.len(), 1 << 5);
        for (key, _) in &hits {
            let c = key.decode();
            assert!(in_box(&c[..8], &lo, &hi));
        }
    }

    #[test]
    fn test_hilbert2d_box_matches_oracle() {
        let idx = grid_index(KeyKind::Hilbert2d, 16, 8);
        for (lo, hi) in [
            ([0u32, 0], [15u32, 15]),
            ([3, 0], [3, 15]),
            ([1, 2], [6, 5]),
            ([10, 10], [12, 14]),
            ([5, 5], [5, 5]),
        ] {
            let mut scan =
                SpatialScan::new(Arc::clone(&idx), KeyKind::Hilbert2d, &lo, &hi).unwrap();
            let hits = collect(&mut scan);
            assert_eq!(hits.len(), expect_count(16, &lo, &hi), "box {lo:?}..{hi:?}");
            for (key, _) in &hits {
                let c = key.decode();
                assert!(in_box(&c[..2], &lo, &hi));
            }
            assert_eq!(idx.pinned_pages(), 0);
        }
    }

    #[test]
    fn test_hilbert3d_disjoint_extent_prunes() {
        let entries = [[0u32, 0, 0], [15, 15, 15]]
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let key = BitKey::encode(KeyKind::Hilbert3d, c).unwrap();
                (key.raw(), RowLocator::new(i as u32, 0))
            })
            .collect();
        let idx = Arc::new(MemIndex::build(KeyKind::Hilbert3d, entries, 8).unwrap());
        let mut scan =
            SpatialScan::new(idx, KeyKind::Hilbert3d, &[10, 0, 0], &[15, 5, 5]).unwrap();
        let hits = collect(&mut scan);
        assert!(hits.is_empty());
        assert!(scan.split_stats().pruned >= 1, "{:?}", scan.split_stats());
    }

    #[test]
    fn test_hilbert3d_box_matches_oracle() {
        let idx = grid_index(KeyKind::Hilbert3d, 8, 16);
        for (lo, hi) in [
            ([0u32, 0, 0], [7u32, 7, 7]),
            ([1, 1, 1], [6, 6, 6]),
            ([0, 3, 2], [0, 5, 7]),
            ([4, 4, 4], [4, 4, 4]),
        ] {
            let mut scan =
                SpatialScan::new(Arc::clone(&idx), KeyKind::Hilbert3d, &lo, &hi).unwrap();
            let hits = collect(&mut scan);
            assert_eq!(hits.len(), expect_count(8, &lo, &hi), "box {lo:?}..{hi:?}");
            for (key, _) in &hits {
                let c = key.decode();
                assert!(in_box(&c[..3], &lo, &hi));
            }
        }
    }

    #[test]
    fn test_random_points_random_boxes_match_oracle() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xbeef);
        for kind in [KeyKind::Z2d, KeyKind::Z3d, KeyKind::Hilbert2d] {
            let d = kind.ncoords();
            // sparse cloud with a few duplicate points
            let mut points: Vec<Vec<u32>> = (0..300)
                .map(|_| (0..d).map(|_| rng.gen_range(0u32..1024)).collect())
                .collect();
            for i in 0..20 {
                let dup = points[i].clone();
                points.push(dup);
            }
            let entries = points
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let key = BitKey::encode(kind, p).unwrap();
                    (key.raw(), RowLocator::new(i as u32, 0))
                })
                .collect();
            let idx = Arc::new(MemIndex::build(kind, entries, 8).unwrap());

            for _ in 0..30 {
                let mut lo = vec![0u32; d];
                let mut hi = vec![0u32; d];
                for i in 0..d {
                    let a = rng.gen_range(0u32..1024);
                    let b = rng.gen_range(0u32..1024);
                    lo[i] = a.min(b);
                    hi[i] = a.max(b);
                }
                let mut scan = SpatialScan::new(Arc::clone(&idx), kind, &lo, &hi).unwrap();
                let mut got: Vec<u32> = Vec::new();
                let mut item = scan.move_first().unwrap();
                while let Some((key, iptr)) = item {
                    let c = key.decode();
                    assert!(in_box(&c[..d], &lo, &hi), "{kind:?} emitted outside point");
                    got.push(iptr.block);
                    item = scan.move_next().unwrap();
                }
                let mut want: Vec<u32> = points
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| in_box(p, &lo, &hi))
                    .map(|(i, _)| i as u32)
                    .collect();
                got.sort_unstable();
                want.sort_unstable();
                assert_eq!(got, want, "{kind:?} box {lo:?}..{hi:?}");
            }
        }
    }

    #[test]
    fn test_solid_raw_bound_matches_bignum_order() {
        // the cached raw bound and the bignum form order identically
        let idx = grid_index(KeyKind::Z3d, 4, 8);
        let mut scan = SpatialScan::new(idx, KeyKind::Z3d, &[0, 0, 0], &[3, 3, 3]).unwrap();
        let hits = collect(&mut scan);
        assert_eq!(hits.len(), 64);
        for w in hits.windows(2) {
            assert!(to_bignum(&w[0].0) <= to_bignum(&w[1].0));
        }
    }

    #[test]
    fn test_inverted_box_rejected() {
        let idx = grid_index(KeyKind::Z2d, 2, 4);
        assert!(matches!(
            SpatialScan::new(idx, KeyKind::Z2d, &[3, 0], &[1, 5]),
            Err(ZcurveErr::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_box_outside_hilbert_domain_is_empty() {
        let idx = grid_index(KeyKind::Hilbert2d, 4, 4);
        let lo = [1 << 30, 0];
        let hi = [(1 << 30) + 5, 5];
        let mut scan = SpatialScan::new(idx, KeyKind::Hilbert2d, &lo, &hi).unwrap();
        assert!(collect(&mut scan).is_empty());
    }

    #[test]
    fn test_empty_index() {
        let idx = Arc::new(MemIndex::build(KeyKind::Z2d, Vec::new(), 4).unwrap());
        let mut scan = SpatialScan::new(idx, KeyKind::Z2d, &[0, 0], &[10, 10]).unwrap();
        assert!(collect(&mut scan).is_empty());
        assert!(!scan.is_open());
    }

    #[test]
    fn test_interrupt_ends_stream() {
        let idx = grid_index(KeyKind::Z2d, 16, 8);
        let mut scan = SpatialScan::new(Arc::clone(&idx), KeyKind::Z2d, &[0, 0], &[15, 15]).unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        scan.set_interrupt(Arc::clone(&flag));
        assert!(scan.move_first().unwrap().is_some());
        assert!(scan.move_next().unwrap().is_some());
        flag.store(true, AtomicOrdering::Relaxed);
        assert!(matches!(scan.move_next(), Err(ZcurveErr::Interrupted)));
        assert_eq!(idx.pinned_pages(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let idx = grid_index(KeyKind::Z2d, 4, 4);
        let mut scan = SpatialScan::new(Arc::clone(&idx), KeyKind::Z2d, &[0, 0], &[3, 3]).unwrap();
        assert!(scan.move_first().unwrap().is_some());
        scan.close();
        scan.close();
        assert_eq!(idx.pinned_pages(), 0);
        assert!(scan.move_next().unwrap().is_none());
    }
}
