//! Z-order (Morton) bit interleaving.
//!
//! The layouts are fixed by the on-disk format:
//!
//! * 2D: byte `k` of the 64-bit key holds, LSB first,
//!   `x[4k], y[4k], x[4k+1], y[4k+1], ..., x[4k+3], y[4k+3]`.
//! * 3D: the same interleave with stride 3; the 96-bit key crosses the
//!   word boundary in the middle of a 12-bit coordinate group.
//! * 8D: each 64-bit word is the 8x8 bit transpose of one byte from every
//!   coordinate, so key bit `i*8 + dim` is bit `i` of coordinate `dim`.
//!
//! 2D and 3D spread and compact through the usual shift-and-mask ladders;
//! 8D goes through a bit-matrix transpose, which is its own inverse.

use super::{BitKey, BoxAttrs, KeyKind, RawKey, KEY_WORDS};

/// Spread the bits of `v` so bit `i` lands at bit `2*i`.
fn spread2(v: u32) -> u64 {
    let mut x = v as u64;
    x = (x | x << 16) & 0x0000_ffff_0000_ffff;
    x = (x | x << 8) & 0x00ff_00ff_00ff_00ff;
    x = (x | x << 4) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | x << 2) & 0x3333_3333_3333_3333;
    x = (x | x << 1) & 0x5555_5555_5555_5555;
    x
}

fn compact2(v: u64) -> u32 {
    let mut x = v & 0x5555_5555_5555_5555;
    x = (x | x >> 1) & 0x3333_3333_3333_3333;
    x = (x | x >> 2) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | x >> 4) & 0x00ff_00ff_00ff_00ff;
    x = (x | x >> 8) & 0x0000_ffff_0000_ffff;
    x = (x | x >> 16) & 0x0000_0000_ffff_ffff;
    x as u32
}

/// Spread the bits of `v` so bit `i` lands at bit `3*i`.
fn spread3(v: u32) -> u128 {
    let mut x = v as u128;
    x = (x | x << 32) & 0x0000_0000_0000_0000_ffff_0000_0000_ffff;
    x = (x | x << 16) & 0x0000_0000_0000_ff00_00ff_0000_ff00_00ff;
    x = (x | x << 8) & 0x0000_0000_00f0_0f00_f00f_00f0_0f00_f00f;
    x = (x | x << 4) & 0x0000_0000_0c30_c30c_30c3_0c30_c30c_30c3;
    x = (x | x << 2) & 0x0000_0000_2492_4924_9249_2492_4924_9249;
    x
}

fn compact3(v: u128) -> u32 {
    let mut x = v & 0x0000_0000_2492_4924_9249_2492_4924_9249;
    x = (x | x >> 2) & 0x0000_0000_0c30_c30c_30c3_0c30_c30c_30c3;
    x = (x | x >> 4) & 0x0000_0000_00f0_0f00_f00f_00f0_0f00_f00f;
    x = (x | x >> 8) & 0x0000_0000_0000_ff00_00ff_0000_ff00_00ff;
    x = (x | x >> 16) & 0x0000_0000_0000_0000_ffff_0000_0000_ffff;
    x = (x | x >> 32) & 0x0000_0000_0000_0000_0000_0000_ffff_ffff;
    x as u32
}

/// Transpose the 8x8 bit matrix held in `x` (byte `r`, bit `c` swaps with
/// byte `c`, bit `r`).  The transform is an involution.
fn transpose8(mut x: u64) -> u64 {
    let mut t = (x ^ (x >> 7)) & 0x00aa_00aa_00aa_00aa;
    x ^= t ^ (t << 7);
    t = (x ^ (x >> 14)) & 0x0000_cccc_0000_cccc;
    x ^= t ^ (t << 14);
    t = (x ^ (x >> 28)) & 0x0000_0000_f0f0_f0f0;
    x ^= t ^ (t << 28);
    x
}

pub(super) fn interleave2(x: u32, y: u32) -> u64 {
    spread2(x) | spread2(y) << 1
}

pub(super) fn deinterleave2(key: u64) -> (u32, u32) {
    (compact2(key), compact2(key >> 1))
}

pub(super) fn interleave3(c: &[u32]) -> u128 {
    spread3(c[0]) | spread3(c[1]) << 1 | spread3(c[2]) << 2
}

pub(super) fn deinterleave3(key: u128, out: &mut [u32]) {
    out[0] = compact3(key);
    out[1] = compact3(key >> 1);
    out[2] = compact3(key >> 2);
}

pub(super) fn interleave8(c: &[u32]) -> RawKey {
    let mut w = [0u64; KEY_WORDS];
    for (wi, word) in w.iter_mut().enumerate() {
        let mut x = 0u64;
        for (dim, &cv) in c.iter().enumerate() {
            x |= ((cv >> (8 * wi) & 0xff) as u64) << (8 * dim);
        }
        *word = transpose8(x);
    }
    w
}

pub(super) fn deinterleave8(w: &RawKey, out: &mut [u32]) {
    for (wi, &word) in w.iter().enumerate() {
        let x = transpose8(word);
        for (dim, c) in out.iter_mut().enumerate().take(8) {
            *c |= ((x >> (8 * dim) & 0xff) as u32) << (8 * wi);
        }
    }
}

/// Per-axis stripe masks, used by the masked in-box compare.
const fn axis_mask(d: u32, dim: u32, key_bits: u32) -> RawKey {
    let mut m = [0u64; KEY_WORDS];
    let mut b = dim;
    while b < key_bits {
        m[(b >> 6) as usize] |= 1u64 << (b & 63);
        b += d;
    }
    m
}

static Z2_AXIS: [RawKey; 2] = [axis_mask(2, 0, 64), axis_mask(2, 1, 64)];
static Z3_AXIS: [RawKey; 3] = [axis_mask(3, 0, 96), axis_mask(3, 1, 96), axis_mask(3, 2, 96)];
static Z8_AXIS: [RawKey; 8] = [
    axis_mask(8, 0, 256),
    axis_mask(8, 1, 256),
    axis_mask(8, 2, 256),
    axis_mask(8, 3, 256),
    axis_mask(8, 4, 256),
    axis_mask(8, 5, 256),
    axis_mask(8, 6, 256),
    axis_mask(8, 7, 256),
];

pub(super) fn axis_masks(kind: KeyKind) -> &'static [RawKey] {
    match kind {
        KeyKind::Z2d => &Z2_AXIS,
        KeyKind::Z3d => &Z3_AXIS,
        KeyKind::Z8d => &Z8_AXIS,
        KeyKind::Hilbert2d | KeyKind::Hilbert3d => &[],
    }
}

/// Attributes of a Z interval whose bounds are box corners.
///
/// The split keeps the bounds componentwise extrema, so the interval's
/// extent is exactly the box the two corners span and the content test is
/// a plain box intersection against the query.  The 8-way interleave is
/// the exception: no cheap extent test is known for it, so content is
/// never ruled out there and all pruning falls to the per-row filter.
///
/// The interval is solid when its corners span a grid-aligned cube: every
/// side length is the same power of two, every low corner coordinate is a
/// multiple of that side, and no side collapses to a single cell.  Under
/// those conditions the interval is exactly the cube's run of keys, so a
/// page can be consumed wholesale.  Alignment is essential: an unaligned
/// power-of-two box spans a wider key interval that also visits points
/// outside the box.  Emission may start exactly when the interval is
/// solid.
pub(super) fn attributes(
    box_lo: &[u32],
    box_hi: &[u32],
    low: &BitKey,
    high: &BitKey,
) -> BoxAttrs {
    let lc = low.decode();
    let hc = high.decode();
    let kind = low.kind();
    let d = kind.ncoords();

    let mut attrs = BoxAttrs::empty();
    if kind == KeyKind::Z8d {
        attrs |= BoxAttrs::HAS_CONTENT;
    } else {
        let intersects =
            (0..d).all(|i| lc[i] <= hc[i] && lc[i] <= box_hi[i] && hc[i] >= box_lo[i]);
        if intersects {
            attrs |= BoxAttrs::HAS_CONTENT;
        }
    }
    if !attrs.contains(BoxAttrs::HAS_CONTENT) {
        return attrs;
    }

    let mut side = 0u32;
    for i in 0..d {
        if hc[i] <= lc[i] {
            return attrs;
        }
        let diff = hc[i] - lc[i];
        if diff & diff.wrapping_add(1) != 0 {
            // side length is not a power of two
            return attrs;
        }
        if lc[i] & diff != 0 {
            // cube is not anchored on its own grid
            return attrs;
        }
        if side != 0 && side != diff {
            return attrs;
        }
        side = diff;
    }
    attrs | BoxAttrs::SOLID | BoxAttrs::READ_READY
}
