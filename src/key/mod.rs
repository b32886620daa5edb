//! Spatial key operations.
//!
//! A `BitKey` is the linearised ordinal of a coordinate tuple under a
//! space-filling curve, held as up to four 64-bit words, little-endian
//! (word 0 carries the low 64 bits).  The curve is selected by `KeyKind`
//! and fixed for the lifetime of a key; all keys that meet in a comparison
//! must share a kind.
//!
//! Z-order kinds interleave coordinate bits directly, so key bit
//! `i*d + dim` carries bit `i` of coordinate `dim`.  Hilbert kinds run the
//! Butz transform over 30-bit coordinates, so the key is a plain scalar
//! with no per-axis bit structure.  The operations that differ between the
//! two families (interval split, box limits, extent attributes, the in-box
//! test) dispatch on the kind; everything else works on the word array.

pub mod bignum;
mod hilbert;
mod zorder;

use std::cmp::Ordering;

use bitflags::bitflags;

use crate::errors::{ZcurveErr, ZcurveResult};

/// Highest dimensionality any curve kind supports.
pub const MAX_COORDS: usize = 8;

/// Number of 64-bit words in the widest key (8 coordinates of 32 bits).
pub const KEY_WORDS: usize = 4;

/// The raw on-page materialisation of a curve key: four 64-bit words,
/// little-endian.  This is what leaf slots store and what the solid-range
/// fast path compares.
pub type RawKey = [u64; KEY_WORDS];

/// Compare two raw keys by integer magnitude.
pub fn raw_cmp(a: &RawKey, b: &RawKey) -> Ordering {
    for w in (0..KEY_WORDS).rev() {
        match a[w].cmp(&b[w]) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    Ordering::Equal
}

/// The curve and dimensionality a key was produced by.
///
/// The kind determines the codec and is fixed for the lifetime of a query.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum KeyKind {
    /// Z-order (Morton), 2 coordinates of 32 bits, 64-bit keys
    Z2d,
    /// Z-order, 3 coordinates of 32 bits, 96-bit keys
    Z3d,
    /// Z-order, 8 coordinates of 32 bits, 256-bit keys
    Z8d,
    /// Hilbert, 2 coordinates of 30 bits, 60-bit keys
    Hilbert2d,
    /// Hilbert, 3 coordinates of 30 bits, 90-bit keys
    Hilbert3d,
}

impl KeyKind {
    /// Number of coordinates the kind interleaves.
    pub fn ncoords(self) -> usize {
        match self {
            KeyKind::Z2d | KeyKind::Hilbert2d => 2,
            KeyKind::Z3d | KeyKind::Hilbert3d => 3,
            KeyKind::Z8d => 8,
        }
    }

    /// Bits each coordinate contributes to the key.
    pub fn coord_bits(self) -> u32 {
        if self.is_hilbert() {
            hilbert::COORD_BITS
        } else {
            32
        }
    }

    /// Largest coordinate value the kind can encode.
    pub fn coord_max(self) -> u32 {
        if self.is_hilbert() {
            (1u32 << hilbert::COORD_BITS) - 1
        } else {
            u32::MAX
        }
    }

    /// Total key width in bits.
    pub fn key_bits(self) -> u32 {
        self.ncoords() as u32 * self.coord_bits()
    }

    /// Number of 64-bit words the key occupies.
    pub fn key_words(self) -> usize {
        (self.key_bits() as usize + 63) / 64
    }

    pub fn is_hilbert(self) -> bool {
        matches!(self, KeyKind::Hilbert2d | KeyKind::Hilbert3d)
    }

    /// Distance between consecutive bits of one axis stripe.  Z keys
    /// assign every d-th bit to an axis; Hilbert keys have no axis
    /// structure, so their stripe operations act on the plain scalar.
    fn stripe_stride(self) -> u32 {
        if self.is_hilbert() {
            1
        } else {
            self.ncoords() as u32
        }
    }
}

bitflags! {
    /// Cached attributes of a sub-range, derived from the geometry of the
    /// curve interval against the query box.
    ///
    /// `SOLID`: every curve point between the bounds lies inside the box,
    /// so pages can be consumed wholesale with a raw key compare only.
    /// `HAS_CONTENT`: the interval's coordinate extent intersects the box
    /// at all; a cleared flag prunes the sub-range without any page read.
    /// `READ_READY`: further splitting cannot prune anything, so the scan
    /// may stop splitting and start emitting through the row filter.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct BoxAttrs: u8 {
        const SOLID = 0x01;
        const HAS_CONTENT = 0x02;
        const READ_READY = 0x04;
    }
}

/// A curve key: the ordinal of one coordinate tuple.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BitKey {
    kind: KeyKind,
    vals: RawKey,
}

impl BitKey {
    /// The zero key of the given kind.
    pub fn new(kind: KeyKind) -> Self {
        BitKey {
            kind,
            vals: [0; KEY_WORDS],
        }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn raw(&self) -> RawKey {
        self.vals
    }

    /// Reconstitute a key from its raw word array.  Fails if the value is
    /// wider than the kind's key width.
    pub fn from_raw(kind: KeyKind, raw: RawKey) -> ZcurveResult<Self> {
        let bits = kind.key_bits();
        for w in 0..KEY_WORDS {
            let lo = w as u32 * 64;
            let bad = if lo >= bits {
                raw[w] != 0
            } else if lo + 64 > bits {
                raw[w] >> (bits - lo) != 0
            } else {
                false
            };
            if bad {
                return Err(ZcurveErr::InvalidArgument("value wider than the key kind"));
            }
        }
        Ok(BitKey { kind, vals: raw })
    }

    /// Interleave a coordinate tuple into its curve key.
    pub fn encode(kind: KeyKind, coords: &[u32]) -> ZcurveResult<Self> {
        if coords.len() != kind.ncoords() {
            return Err(ZcurveErr::InvalidArgument(
                "coordinate count does not match the key kind",
            ));
        }
        let max = kind.coord_max();
        if coords.iter().any(|&c| c > max) {
            return Err(ZcurveErr::InvalidArgument("coordinate exceeds the curve domain"));
        }
        let vals = match kind {
            KeyKind::Z2d => [zorder::interleave2(coords[0], coords[1]), 0, 0, 0],
            KeyKind::Z3d => {
                let k = zorder::interleave3(coords);
                [k as u64, (k >> 64) as u64, 0, 0]
            }
            KeyKind::Z8d => zorder::interleave8(coords),
            KeyKind::Hilbert2d | KeyKind::Hilbert3d => {
                let k = hilbert::encode(kind, coords);
                [k as u64, (k >> 64) as u64, 0, 0]
            }
        };
        Ok(BitKey { kind, vals })
    }

    /// Split the key back into coordinates.  Unused trailing slots of the
    /// returned array stay zero.
    pub fn decode(&self) -> [u32; MAX_COORDS] {
        let mut out = [0u32; MAX_COORDS];
        match self.kind {
            KeyKind::Z2d => {
                let (x, y) = zorder::deinterleave2(self.vals[0]);
                out[0] = x;
                out[1] = y;
            }
            KeyKind::Z3d => zorder::deinterleave3(self.to_u128(), &mut out),
            KeyKind::Z8d => zorder::deinterleave8(&self.vals, &mut out),
            KeyKind::Hilbert2d | KeyKind::Hilbert3d => {
                out = hilbert::decode(self.kind, self.to_u128());
            }
        }
        out
    }

    /// Total order over keys of one kind, consistent with the integer
    /// magnitude of the word array.
    pub fn key_cmp(&self, other: &BitKey) -> Ordering {
        debug_assert_eq!(self.kind, other.kind);
        raw_cmp(&self.vals, &other.vals)
    }

    pub fn clear(&mut self) {
        self.vals = [0; KEY_WORDS];
    }

    /// Bit `idx` of the key, 0 or 1.
    pub fn get_bit(&self, idx: u32) -> u64 {
        self.vals[(idx >> 6) as usize] >> (idx & 63) & 1
    }

    /// Stripe mask with bits at `idx, idx - stride, idx - 2*stride, ...`.
    fn stripe_below(idx: u32, stride: u32) -> RawKey {
        let mut m = [0u64; KEY_WORDS];
        let mut b = idx as i64;
        while b >= 0 {
            m[(b >> 6) as usize] |= 1u64 << (b & 63);
            b -= stride as i64;
        }
        m
    }

    /// Raise the key to the componentwise maximum of the sub-cube below
    /// bit `idx`: the axis stripe of `idx` is saturated below `idx` and
    /// bit `idx` itself is cleared.  Other axes keep their bits.
    pub fn set_low_bits(&mut self, idx: u32) {
        let m = Self::stripe_below(idx, self.kind.stripe_stride());
        for w in 0..KEY_WORDS {
            self.vals[w] |= m[w];
        }
        self.vals[(idx >> 6) as usize] &= !(1u64 << (idx & 63));
    }

    /// Lower the key to the componentwise minimum of the sub-cube at and
    /// above bit `idx`: the axis stripe of `idx` is cleared below `idx`
    /// and bit `idx` itself is set.
    pub fn clear_low_bits(&mut self, idx: u32) {
        let m = Self::stripe_below(idx, self.kind.stripe_stride());
        for w in 0..KEY_WORDS {
            self.vals[w] &= !m[w];
        }
        self.vals[(idx >> 6) as usize] |= 1u64 << (idx & 63);
    }

    /// Position of the highest bit at which the two keys differ.
    fn highest_diff_bit(a: &BitKey, b: &BitKey) -> Option<u32> {
        for w in (0..KEY_WORDS).rev() {
            let x = a.vals[w] ^ b.vals[w];
            if x != 0 {
                return Some(w as u32 * 64 + 63 - x.leading_zeros());
            }
        }
        None
    }

    /// Halve the interval `[low, high]` at its longest common prefix.
    ///
    /// Returns `(left_high, right_low)`: the left half keeps `low` and
    /// ends at `left_high`, the right half starts at `right_low` and keeps
    /// `high`.  When no refining split exists the input pair `(high, low)`
    /// comes back unchanged; callers must treat that as "emit unsplit"
    /// rather than loop.
    pub fn split(low: &BitKey, high: &BitKey) -> (BitKey, BitKey) {
        debug_assert_eq!(low.kind, high.kind);
        match Self::highest_diff_bit(low, high) {
            None => (*high, *low),
            Some(b) => {
                let mut left_high = *high;
                left_high.set_low_bits(b);
                let mut right_low = *low;
                right_low.clear_low_bits(b);
                (left_high, right_low)
            }
        }
    }

    /// The curve interval a scan of the box starts from.  Z kinds encode
    /// the two corners directly; Hilbert kinds round the corner keys
    /// outward to an aligned cube in key terms, because a coordinate
    /// rectangle is not a key interval on that curve and interior keys
    /// are not bounded by corner keys.
    pub fn limits_from_box(
        kind: KeyKind,
        lo: &[u32],
        hi: &[u32],
    ) -> ZcurveResult<(BitKey, BitKey)> {
        if lo.len() != kind.ncoords() || hi.len() != kind.ncoords() {
            return Err(ZcurveErr::InvalidArgument(
                "coordinate count does not match the key kind",
            ));
        }
        if lo.iter().zip(hi).any(|(l, h)| l > h) {
            return Err(ZcurveErr::InvalidArgument("query box is inverted"));
        }
        if kind.is_hilbert() {
            let max = kind.coord_max();
            if hi.iter().any(|&c| c > max) {
                return Err(ZcurveErr::InvalidArgument("coordinate exceeds the curve domain"));
            }
            let (a, b) = hilbert::limits_from_box(kind, hi);
            Ok((Self::from_u128(kind, a), Self::from_u128(kind, b)))
        } else {
            Ok((Self::encode(kind, lo)?, Self::encode(kind, hi)?))
        }
    }

    /// Derive the sub-range attributes of the interval `[min_key,
    /// max_key]` against the query box.
    ///
    /// Z kinds maintain interval bounds as box corners, so the extent is
    /// the box the corners span: solidity falls out of the corner
    /// coordinates alone (a grid-aligned cube with all side lengths the
    /// same power of two) and content is the corner box intersected with
    /// the query.  Z-8D is the exception with no cheap extent test, so
    /// its content is never ruled out.  Hilbert kinds reconstruct the
    /// extent from the curve geometry.
    pub fn box_attributes(
        box_lo: &[u32],
        box_hi: &[u32],
        min_key: &BitKey,
        max_key: &BitKey,
    ) -> BoxAttrs {
        debug_assert_eq!(min_key.kind, max_key.kind);
        if min_key.kind.is_hilbert() {
            hilbert::attributes(box_lo, box_hi, min_key, max_key)
        } else {
            zorder::attributes(box_lo, box_hi, min_key, max_key)
        }
    }

    /// Test whether the key's coordinates lie inside the box spanned by
    /// `low` and `high`.  Z kinds compare the masked axis stripes in
    /// place; Hilbert kinds decode first.
    pub fn between(&self, low: &BitKey, high: &BitKey) -> bool {
        debug_assert_eq!(self.kind, low.kind);
        debug_assert_eq!(self.kind, high.kind);
        let d = self.kind.ncoords();
        if self.kind.is_hilbert() {
            let c = self.decode();
            let lc = low.decode();
            let hc = high.decode();
            (0..d).all(|i| lc[i] <= c[i] && c[i] <= hc[i])
        } else {
            let masks = zorder::axis_masks(self.kind);
            (0..d).all(|i| {
                masked_cmp(&self.vals, &low.vals, &masks[i]) != Ordering::Less
                    && masked_cmp(&self.vals, &high.vals, &masks[i]) != Ordering::Greater
            })
        }
    }

    /// Z-order keys over the full 32-bit domain never fail to encode;
    /// these shortcuts skip the fallible validation for the fixed-arity
    /// entry points.
    pub(crate) fn z2d(x: u32, y: u32) -> Self {
        BitKey {
            kind: KeyKind::Z2d,
            vals: [zorder::interleave2(x, y), 0, 0, 0],
        }
    }

    pub(crate) fn z3d(x: u32, y: u32, z: u32) -> Self {
        let k = zorder::interleave3(&[x, y, z]);
        BitKey {
            kind: KeyKind::Z3d,
            vals: [k as u64, (k >> 64) as u64, 0, 0],
        }
    }

    pub(crate) fn to_u128(&self) -> u128 {
        debug_assert!(self.kind.key_words() <= 2);
        (self.vals[1] as u128) << 64 | self.vals[0] as u128
    }

    pub(crate) fn from_u128(kind: KeyKind, v: u128) -> Self {
        BitKey {
            kind,
            vals: [v as u64, (v >> 64) as u64, 0, 0],
        }
    }
}

/// Compare two word arrays restricted to one axis stripe.  The stripe
/// preserves the relative order of the axis bits, so the masked compare
/// equals the coordinate compare without de-interleaving.
fn masked_cmp(a: &RawKey, b: &RawKey, m: &RawKey) -> Ordering {
    for w in (0..KEY_WORDS).rev() {
        match (a[w] & m[w]).cmp(&(b[w] & m[w])) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const ALL_KINDS: [KeyKind; 5] = [
        KeyKind::Z2d,
        KeyKind::Z3d,
        KeyKind::Z8d,
        KeyKind::Hilbert2d,
        KeyKind::Hilbert3d,
    ];

    fn random_coords(rng: &mut StdRng, kind: KeyKind) -> Vec<u32> {
        (0..kind.ncoords())
            .map(|_| rng.gen::<u32>() & kind.coord_max())
            .collect()
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for kind in ALL_KINDS {
            for _ in 0..500 {
                let coords = random_coords(&mut rng, kind);
                let key = BitKey::encode(kind, &coords).unwrap();
                let back = key.decode();
                assert_eq!(&back[..kind.ncoords()], &coords[..], "{kind:?}");
            }
        }
    }

    #[test]
    fn test_encode_validates_arity_and_domain() {
        assert!(matches!(
            BitKey::encode(KeyKind::Z2d, &[1, 2, 3]),
            Err(ZcurveErr::InvalidArgument(_))
        ));
        assert!(matches!(
            BitKey::encode(KeyKind::Hilbert2d, &[1 << 30, 0]),
            Err(ZcurveErr::InvalidArgument(_))
        ));
        assert!(BitKey::encode(KeyKind::Hilbert2d, &[(1 << 30) - 1, 0]).is_ok());
    }

    #[test]
    fn test_from_raw_width_check() {
        assert!(BitKey::from_raw(KeyKind::Z2d, [u64::MAX, 0, 0, 0]).is_ok());
        assert!(BitKey::from_raw(KeyKind::Z2d, [0, 1, 0, 0]).is_err());
        assert!(BitKey::from_raw(KeyKind::Hilbert2d, [1u64 << 60, 0, 0, 0]).is_err());
        assert!(BitKey::from_raw(KeyKind::Z3d, [0, 1u64 << 31, 0, 0]).is_ok());
        assert!(BitKey::from_raw(KeyKind::Z3d, [0, 1u64 << 32, 0, 0]).is_err());
        assert!(BitKey::from_raw(KeyKind::Z8d, [0, 0, 0, u64::MAX]).is_ok());
    }

    #[test]
    fn test_cmp_matches_magnitude() {
        let mut rng = StdRng::seed_from_u64(7);
        for kind in ALL_KINDS {
            for _ in 0..200 {
                let a = BitKey::encode(kind, &random_coords(&mut rng, kind)).unwrap();
                let b = BitKey::encode(kind, &random_coords(&mut rng, kind)).unwrap();
                let by_words = a.key_cmp(&b);
                let by_bignum = bignum::to_bignum(&a).cmp(&bignum::to_bignum(&b));
                assert_eq!(by_words, by_bignum);
            }
        }
    }

    #[test]
    fn test_stripe_set_clear_are_componentwise_extrema() {
        // Saturating the axis stripe below a bit must move the decoded
        // point to the corner of the enclosing sub-cube on that axis only.
        let key = BitKey::encode(KeyKind::Z2d, &[0b1010, 0b0110]).unwrap();
        let mut hi = key;
        hi.set_low_bits(5); // key bit 5 is y bit 2
        let c = hi.decode();
        assert_eq!(c[0], 0b1010);
        assert_eq!(c[1], 0b0011);

        let mut lo = key;
        lo.clear_low_bits(5);
        let c = lo.decode();
        assert_eq!(c[0], 0b1010);
        assert_eq!(c[1], 0b0100);
    }

    #[test]
    fn test_split_z_prunes_only_outside_points() {
        // Splitting a corner interval keeps both halves inside the
        // original box and leaves out only curve points whose coordinates
        // escape it.
        let lo = BitKey::encode(KeyKind::Z2d, &[3, 2]).unwrap();
        let hi = BitKey::encode(KeyKind::Z2d, &[9, 11]).unwrap();
        let (lh, rl) = BitKey::split(&lo, &hi);
        assert_eq!(lh.key_cmp(&rl), Ordering::Less);
        assert_eq!(lo.key_cmp(&lh), Ordering::Less);
        assert_eq!(rl.key_cmp(&hi), Ordering::Less);
        let lhc = lh.decode();
        let rlc = rl.decode();
        for i in 0..2 {
            let (l, h) = (lo.decode()[i], hi.decode()[i]);
            assert!(lhc[i] >= l && lhc[i] <= h);
            assert!(rlc[i] >= l && rlc[i] <= h);
        }
        // the gap between the halves holds no in-box point
        let mut k = lh.raw()[0] + 1;
        while k < rl.raw()[0] {
            let p = BitKey::from_raw(KeyKind::Z2d, [k, 0, 0, 0]).unwrap();
            assert!(!p.between(&lo, &hi), "key {k:#x} should be outside");
            k += 1;
        }
    }

    #[test]
    fn test_split_guard_on_degenerate_interval() {
        let k = BitKey::encode(KeyKind::Hilbert2d, &[5, 9]).unwrap();
        let (lh, rl) = BitKey::split(&k, &k);
        assert_eq!(lh, k);
        assert_eq!(rl, k);
    }

    #[test]
    fn test_hilbert_split_halves_are_adjacent() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let a = rng.gen::<u64>() & ((1 << 60) - 1);
            let b = rng.gen::<u64>() & ((1 << 60) - 1);
            if a == b {
                continue;
            }
            let (lo, hi) = (a.min(b), a.max(b));
            let lo_key = BitKey::from_raw(KeyKind::Hilbert2d, [lo, 0, 0, 0]).unwrap();
            let hi_key = BitKey::from_raw(KeyKind::Hilbert2d, [hi, 0, 0, 0]).unwrap();
            let (lh, rl) = BitKey::split(&lo_key, &hi_key);
            // scalar bisection: left high + 1 == right low, both in range
            assert_eq!(lh.raw()[0] + 1, rl.raw()[0]);
            assert!(lh.raw()[0] >= lo && lh.raw()[0] < hi);
            assert!(rl.raw()[0] > lo && rl.raw()[0] <= hi);
        }
    }

    #[test]
    fn test_between_masked_matches_decoded() {
        let mut rng = StdRng::seed_from_u64(1234);
        for kind in [KeyKind::Z2d, KeyKind::Z3d, KeyKind::Z8d] {
            let d = kind.ncoords();
            for _ in 0..200 {
                let mut lo = random_coords(&mut rng, kind);
                let mut hi = random_coords(&mut rng, kind);
                for i in 0..d {
                    if lo[i] > hi[i] {
                        std::mem::swap(&mut lo[i], &mut hi[i]);
                    }
                }
                let c = random_coords(&mut rng, kind);
                let key = BitKey::encode(kind, &c).unwrap();
                let lo_key = BitKey::encode(kind, &lo).unwrap();
                let hi_key = BitKey::encode(kind, &hi).unwrap();
                let expect = (0..d).all(|i| lo[i] <= c[i] && c[i] <= hi[i]);
                assert_eq!(key.between(&lo_key, &hi_key), expect, "{kind:?}");
            }
        }
    }

    #[test]
    fn test_limits_reject_inverted_box() {
        assert!(matches!(
            BitKey::limits_from_box(KeyKind::Z2d, &[5, 0], &[4, 10]),
            Err(ZcurveErr::InvalidArgument(_))
        ));
    }
}
