//! Hilbert curve keys for 2 or 3 coordinates of 30 bits each.
//!
//! The coordinate transform follows A. R. Butz, "Alternative Algorithm
//! for Hilbert's Space-Filling Curve", IEEE Trans. Comp., April 1971.
//! Unlike the Z kinds, a Hilbert key has no per-axis bit stripes: the key
//! is a plain scalar, interval splitting is scalar bisection, and a
//! coordinate rectangle does not map to one key interval.  What the curve
//! does guarantee is that every axis-aligned cube of side 2^s whose
//! corners are multiples of 2^s is a contiguous run of 2^(s*d) keys.  The
//! box limits and the extent derivation below lean on exactly that.

use std::sync::OnceLock;

use super::{BitKey, BoxAttrs, KeyKind, MAX_COORDS};
use crate::util::ints::bit_width;

/// Bits per coordinate for every Hilbert kind.
pub(super) const COORD_BITS: u32 = 30;

/// Largest dimensionality a Hilbert kind uses.
const MAX_N: usize = 3;

/// Bit-twiddle tables for one dimensionality `n`.  Notation: `p#i` is bit
/// `i` of the byte `p`, high-order bit first.
///
/// * `p_to_s`: output `s` such that `s#i = p#i xor p#(i-1)`.
/// * `s_to_p`: the inverse of `p_to_s`.
/// * `p_to_j`: the "principal position" of `p`, the last bit where `p`
///   differs from its low bit (or `n-1` when all bits are equal).
/// * `bit[b] = 1 << (n - b - 1)`.
/// * `circshift[v][i]`: right circular shift of `v` by `i` within `n`
///   bits.
/// * `parity[v]`: 1 when `v` has odd population count.
struct ButzTables {
    n: usize,
    bit: [u8; MAX_N],
    p_to_s: [u8; 1 << MAX_N],
    s_to_p: [u8; 1 << MAX_N],
    p_to_j: [u8; 1 << MAX_N],
    circshift: [[u8; MAX_N]; 1 << MAX_N],
    parity: [u8; 1 << MAX_N],
}

impl ButzTables {
    fn build(n: usize) -> Self {
        let two_n = 1usize << n;
        let mut t = ButzTables {
            n,
            bit: [0; MAX_N],
            p_to_s: [0; 1 << MAX_N],
            s_to_p: [0; 1 << MAX_N],
            p_to_j: [0; 1 << MAX_N],
            circshift: [[0; MAX_N]; 1 << MAX_N],
            parity: [0; 1 << MAX_N],
        };
        for b in 0..n {
            t.bit[b] = 1 << (n - b - 1);
        }
        for i in 0..two_n {
            for b in 0..n {
                t.circshift[i][b] = (((i >> b) | (i << (n - b))) & (two_n - 1)) as u8;
            }
            t.parity[i] = (i.count_ones() & 1) as u8;
        }
        let bitof = |v: usize, b: usize| v >> (n - b - 1) & 1;
        for i in 0..two_n {
            let mut s = i & t.bit[0] as usize;
            for b in 1..n {
                if bitof(i, b) ^ bitof(i, b - 1) != 0 {
                    s |= t.bit[b] as usize;
                }
            }
            t.p_to_s[i] = s as u8;
            t.s_to_p[s] = i as u8;
            t.p_to_j[i] = (n - 1) as u8;
            for b in 0..n {
                if bitof(i, b) != bitof(i, n - 1) {
                    t.p_to_j[i] = b as u8;
                }
            }
        }
        t
    }

    fn get(n: usize) -> &'static ButzTables {
        static TABLES_2: OnceLock<ButzTables> = OnceLock::new();
        static TABLES_3: OnceLock<ButzTables> = OnceLock::new();
        match n {
            2 => TABLES_2.get_or_init(|| ButzTables::build(2)),
            3 => TABLES_3.get_or_init(|| ButzTables::build(3)),
            _ => unreachable!("no Hilbert kind with {n} coordinates"),
        }
    }
}

/// Convert coordinates to the curve index.  `coords[b]` supplies the axis
/// tied to table bit `b`; the result packs the byte sequence rho
/// most-significant group first.
fn coords_to_index(t: &ButzTables, coords: &[u32]) -> u128 {
    let n = t.n;
    let m = COORD_BITS as usize;

    // Unpack the coordinates into alpha: alpha[i-1] collects bit (m-i) of
    // every axis.
    let mut alpha = [0u8; COORD_BITS as usize];
    for b in 0..n {
        let bt = t.bit[b];
        for i in 1..=m {
            if coords[b] >> (m - i) & 1 != 0 {
                alpha[i - 1] |= bt;
            }
        }
    }

    let mut jsum = 0usize;
    let mut omega1 = 0u8;
    let mut taut1 = 0u8;
    let mut key = 0u128;
    for (i, &al) in alpha.iter().enumerate() {
        // omega[i] = omega[i-1] xor tauT[i-1]
        let omega = if i == 0 { 0 } else { omega1 ^ taut1 };
        let sigmat = al ^ omega;
        // sigma is the left circular shift of sigmaT by sum of J[0..i-1]
        let sigma = if jsum != 0 {
            t.circshift[sigmat as usize][n - jsum]
        } else {
            sigmat
        };
        let rho = t.s_to_p[sigma as usize];
        let j = t.p_to_j[rho as usize] as usize;
        // tau complements the low bit of sigma, and the bit at J if needed
        // to make even parity
        let mut tau = sigma ^ 1;
        if t.parity[tau as usize] != 0 {
            tau ^= t.bit[j];
        }
        let taut = if jsum != 0 {
            t.circshift[tau as usize][jsum]
        } else {
            tau
        };
        jsum += j;
        if jsum >= n {
            jsum -= n;
        }
        omega1 = omega;
        taut1 = taut;
        key = key << n | rho as u128;
    }
    key
}

/// Convert a curve index back to coordinates.  Inverts `coords_to_index`.
fn index_to_coords(t: &ButzTables, key: u128) -> [u32; MAX_COORDS] {
    let n = t.n;
    let m = COORD_BITS as usize;
    let mask = (1u128 << n) - 1;

    let mut alpha = [0u8; COORD_BITS as usize];
    let mut jsum = 0usize;
    let mut omega1 = 0u8;
    let mut taut1 = 0u8;
    for (i, al) in alpha.iter_mut().enumerate() {
        let rho = (key >> ((m - 1 - i) * n) & mask) as usize;
        let j = t.p_to_j[rho] as usize;
        let sigma = t.p_to_s[rho];
        let mut tau = sigma ^ 1;
        if t.parity[tau as usize] != 0 {
            tau ^= t.bit[j];
        }
        let (sigmat, taut) = if jsum != 0 {
            (
                t.circshift[sigma as usize][jsum],
                t.circshift[tau as usize][jsum],
            )
        } else {
            (sigma, tau)
        };
        jsum += j;
        if jsum >= n {
            jsum -= n;
        }
        let omega = if i == 0 { 0 } else { omega1 ^ taut1 };
        omega1 = omega;
        taut1 = taut;
        *al = omega ^ sigmat;
    }

    let mut out = [0u32; MAX_COORDS];
    for b in 0..n {
        let bt = t.bit[b];
        let mut v = 0u32;
        for (i, &al) in alpha.iter().enumerate() {
            if al & bt != 0 {
                v |= 1 << (m - 1 - i);
            }
        }
        out[b] = v;
    }
    out
}

pub(super) fn encode(kind: KeyKind, coords: &[u32]) -> u128 {
    coords_to_index(ButzTables::get(kind.ncoords()), coords)
}

pub(super) fn decode(kind: KeyKind, key: u128) -> [u32; MAX_COORDS] {
    index_to_coords(ButzTables::get(kind.ncoords()), key)
}

/// The curve interval the scan starts from: the corner keys rounded
/// outward to an aligned cube in key terms.
///
/// A coordinate rectangle is not one key interval on this curve, and the
/// keys of interior points are not bounded by the corner keys.  What does
/// bound them is the origin-anchored cube of side `2^t`, `t` the bit
/// width of the widest corner coordinate: every point of the box lies in
/// that cube, and the cube is exactly the first `2^(t*d)` keys of the
/// curve.  The interval is deliberately coarse; the split loop carves it
/// down and the extent attributes prune the carved-off parts that miss
/// the box.
pub(super) fn limits_from_box(kind: KeyKind, hi: &[u32]) -> (u128, u128) {
    let d = kind.ncoords();
    let mut t = 0u32;
    for i in 0..d {
        t = t.max(bit_width(hi[i]));
    }
    if t == 0 {
        return (0, 0);
    }
    (0, (1u128 << (t * d as u32)) - 1)
}

/// Derive the sub-range attributes of `[min_key, max_key]` against the
/// query box.
///
/// Let `b` be the highest differing key bit.  All keys of the interval
/// share the prefix above bit `b`, so the interval's points lie in a short
/// run of consecutive curve cells of side `2^((b+1)/d)` inside one parent
/// cube.  The extent bounding box comes from decoding the two bounds and
/// their key-space midpoint and widening each to the cell alignment; the
/// three samples always hit cells whose union bounds the whole run.
///
/// `has_content` is the box intersection test on that extent.  `solid`
/// additionally needs the interval to be one full aligned cube lying
/// inside the box, which is the only shape whose every key is known to
/// decode into the box.  `read_ready` is coarser: once the extent is
/// inside the box, splitting further cannot prune anything, so filtering
/// may start even though wholesale emission may not.
pub(super) fn attributes(
    box_lo: &[u32],
    box_hi: &[u32],
    min_key: &BitKey,
    max_key: &BitKey,
) -> BoxAttrs {
    let kind = min_key.kind();
    let d = kind.ncoords();
    let kmin = min_key.to_u128();
    let kmax = max_key.to_u128();

    let (cell_shift, full_cube) = if kmin == kmax {
        (0u32, false)
    } else {
        let b = 127 - (kmin ^ kmax).leading_zeros();
        let span = b + 1;
        let low_mask = (1u128 << span) - 1;
        let full = span % d as u32 == 0
            && kmin & low_mask == 0
            && kmax & low_mask == low_mask;
        (span / d as u32, full)
    };
    let cell_mask = (1u32 << cell_shift) - 1;

    let mut elo = [u32::MAX; MAX_COORDS];
    let mut ehi = [0u32; MAX_COORDS];
    for key in [kmin, kmax, kmin + (kmax - kmin) / 2] {
        let c = decode(kind, key);
        for i in 0..d {
            elo[i] = elo[i].min(c[i] & !cell_mask);
            ehi[i] = ehi[i].max(c[i] | cell_mask);
        }
    }

    let mut intersects = true;
    let mut inside = true;
    for i in 0..d {
        if elo[i] > box_hi[i] || ehi[i] < box_lo[i] {
            intersects = false;
        }
        if elo[i] < box_lo[i] || ehi[i] > box_hi[i] {
            inside = false;
        }
    }

    let mut attrs = BoxAttrs::empty();
    if intersects {
        attrs |= BoxAttrs::HAS_CONTENT;
    }
    if full_cube && inside {
        attrs |= BoxAttrs::SOLID;
    }
    if inside || kmin == kmax {
        attrs |= BoxAttrs::READ_READY;
    }
    attrs
}
