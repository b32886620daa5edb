//! Conversions between curve keys and the host-facing arbitrary-precision
//! integer type.  The 4-word little-endian layout materialises as
//! `w0 + 2^64*w1 + 2^128*w2 + 2^192*w3`.

use num_bigint::BigUint;

use super::{BitKey, KeyKind, KEY_WORDS};
use crate::errors::{ZcurveErr, ZcurveResult};

pub fn to_bignum(key: &BitKey) -> BigUint {
    let raw = key.raw();
    let mut digits = [0u32; KEY_WORDS * 2];
    for (i, w) in raw.iter().enumerate() {
        digits[2 * i] = *w as u32;
        digits[2 * i + 1] = (*w >> 32) as u32;
    }
    BigUint::from_slice(&digits)
}

/// Rebuild a key of the given kind from its integer form.  Fails when the
/// value is wider than 256 bits or than the kind's key width.
pub fn from_bignum(kind: KeyKind, v: &BigUint) -> ZcurveResult<BitKey> {
    let bytes = v.to_bytes_le();
    if bytes.len() > KEY_WORDS * 8 {
        return Err(ZcurveErr::InvalidArgument("integer wider than 256 bits"));
    }
    let mut raw = [0u64; KEY_WORDS];
    for (i, b) in bytes.iter().enumerate() {
        raw[i / 8] |= (*b as u64) << (8 * (i % 8));
    }
    BitKey::from_raw(kind, raw)
}
