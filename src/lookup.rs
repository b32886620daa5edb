//! Call-level surface of the engine: coordinate-to-key helpers and the
//! box lookups.
//!
//! The plain lookups run the scan to completion, stage the matches, and
//! hand back a stream sorted by row locator, so the caller's heap fetches
//! walk blocks sequentially.  The `tidonly` variants skip the stager and
//! stream locators lazily in curve-key order.

use num_bigint::BigUint;

use crate::errors::ZcurveResult;
use crate::key::{bignum, BitKey, KeyKind};
use crate::pager::{Catalog, MemIndex, PageStore, RowLocator};
use crate::rowset::RowSet;
use crate::scan::SpatialScan;

/// Z-order key of a 2D point, as the plain 64-bit ordinal.
pub fn encode_2d(x: u32, y: u32) -> u64 {
    BitKey::z2d(x, y).raw()[0]
}

/// Z-order key of a 2D point in the on-disk integer form.
pub fn encode_as_bignum_2d(x: u32, y: u32) -> BigUint {
    bignum::to_bignum(&BitKey::z2d(x, y))
}

/// Z-order key of a 3D point in the on-disk integer form.
pub fn encode_as_bignum_3d(x: u32, y: u32, z: u32) -> BigUint {
    bignum::to_bignum(&BitKey::z3d(x, y, z))
}

/// Hilbert key of a 2D point.  Coordinates are limited to 30 bits.
pub fn hilbert_encode_2d(x: u32, y: u32) -> ZcurveResult<BigUint> {
    Ok(bignum::to_bignum(&BitKey::encode(
        KeyKind::Hilbert2d,
        &[x, y],
    )?))
}

/// Hilbert key of a 3D point.  Coordinates are limited to 30 bits.
pub fn hilbert_encode_3d(x: u32, y: u32, z: u32) -> ZcurveResult<BigUint> {
    Ok(bignum::to_bignum(&BitKey::encode(
        KeyKind::Hilbert3d,
        &[x, y, z],
    )?))
}

/// Drive a scan to completion and stage every match.
fn run_staged<S: PageStore>(mut scan: SpatialScan<S>) -> ZcurveResult<RowSet> {
    let mut staged = RowSet::new();
    let mut item = scan.move_first()?;
    while let Some((key, iptr)) = item {
        staged.push(iptr, key.decode());
        item = scan.move_next()?;
    }
    staged.sort_by_locator();
    Ok(staged)
}

/// Box lookup over a Z-2D index: every stored point inside the closed
/// box, sorted by row locator.
pub fn lookup_2d(
    catalog: &Catalog,
    name: &str,
    x_lo: u32,
    y_lo: u32,
    x_hi: u32,
    y_hi: u32,
) -> ZcurveResult<impl Iterator<Item = (RowLocator, u32, u32)>> {
    let index = catalog.open(name)?;
    let scan = SpatialScan::new(index, KeyKind::Z2d, &[x_lo, y_lo], &[x_hi, y_hi])?;
    let staged = run_staged(scan)?;
    Ok(staged
        .into_sorted_iter()
        .map(|it| (it.iptr, it.coords[0], it.coords[1])))
}

/// Box lookup over a Z-3D index, sorted by row locator.
#[allow(clippy::too_many_arguments)]
pub fn lookup_3d(
    catalog: &Catalog,
    name: &str,
    x_lo: u32,
    y_lo: u32,
    z_lo: u32,
    x_hi: u32,
    y_hi: u32,
    z_hi: u32,
) -> ZcurveResult<impl Iterator<Item = (RowLocator, u32, u32, u32)>> {
    let index = catalog.open(name)?;
    let scan = SpatialScan::new(
        index,
        KeyKind::Z3d,
        &[x_lo, y_lo, z_lo],
        &[x_hi, y_hi, z_hi],
    )?;
    let staged = run_staged(scan)?;
    Ok(staged
        .into_sorted_iter()
        .map(|it| (it.iptr, it.coords[0], it.coords[1], it.coords[2])))
}

/// Lazy stream of row locators in curve-key order.  Errors are terminal:
/// after yielding one the stream is exhausted.
pub struct TidStream<S: PageStore> {
    scan: SpatialScan<S>,
    started: bool,
    done: bool,
}

impl<S: PageStore> TidStream<S> {
    fn new(scan: SpatialScan<S>) -> Self {
        TidStream {
            scan,
            started: false,
            done: false,
        }
    }

    pub fn scan(&self) -> &SpatialScan<S> {
        &self.scan
    }

    pub fn scan_mut(&mut self) -> &mut SpatialScan<S> {
        &mut self.scan
    }
}

impl<S: PageStore> Iterator for TidStream<S> {
    type Item = ZcurveResult<RowLocator>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = if self.started {
            self.scan.move_next()
        } else {
            self.started = true;
            self.scan.move_first()
        };
        match step {
            Ok(Some((_, iptr))) => Some(Ok(iptr)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Locator-only variant of `lookup_2d`: streams in key order, no staging
/// sort.
pub fn lookup_2d_tidonly(
    catalog: &Catalog,
    name: &str,
    x_lo: u32,
    y_lo: u32,
    x_hi: u32,
    y_hi: u32,
) -> ZcurveResult<TidStream<MemIndex>> {
    let index = catalog.open(name)?;
    let scan = SpatialScan::new(index, KeyKind::Z2d, &[x_lo, y_lo], &[x_hi, y_hi])?;
    Ok(TidStream::new(scan))
}

/// Locator-only variant of `lookup_3d`.
#[allow(clippy::too_many_arguments)]
pub fn lookup_3d_tidonly(
    catalog: &Catalog,
    name: &str,
    x_lo: u32,
    y_lo: u32,
    z_lo: u32,
    x_hi: u32,
    y_hi: u32,
    z_hi: u32,
) -> ZcurveResult<TidStream<MemIndex>> {
    let index = catalog.open(name)?;
    let scan = SpatialScan::new(
        index,
        KeyKind::Z3d,
        &[x_lo, y_lo, z_lo],
        &[x_hi, y_hi, z_hi],
    )?;
    Ok(TidStream::new(scan))
}

/// Locator-only box lookup over a Hilbert-3D index.
#[allow(clippy::too_many_arguments)]
pub fn hilbert_3d_lookup_tidonly(
    catalog: &Catalog,
    name: &str,
    x_lo: u32,
    y_lo: u32,
    z_lo: u32,
    x_hi: u32,
    y_hi: u32,
    z_hi: u32,
) -> ZcurveResult<TidStream<MemIndex>> {
    let index = catalog.open(name)?;
    let scan = SpatialScan::new(
        index,
        KeyKind::Hilbert3d,
        &[x_lo, y_lo, z_lo],
        &[x_hi, y_hi, z_hi],
    )?;
    Ok(TidStream::new(scan))
}
