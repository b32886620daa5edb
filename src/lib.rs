//! Space-filling-curve point index over an ordinal B-tree.
//!
//! A d-dimensional point (2, 3, or 8 unsigned 32-bit coordinates) is
//! linearised into a single large key along a Z-order or Hilbert curve
//! and stored in a plain key-ordered B-tree.  Axis-aligned box queries
//! then run as a recursive decomposition of the box into curve intervals:
//! the scan walks leaf pages once, splits intervals that span more than
//! the current page, skips intervals whose extent misses the box without
//! reading anything, and consumes aligned in-box cubes wholesale without
//! a per-row filter.
//!
//! The two halves of the crate:
//!
//! * the key machinery (`BitKey`, `KeyKind`) with curve-specific encode,
//!   decode, interval split, and extent attribute derivation;
//! * the scan machinery (`LeafCursor`, `SpatialScan`, `RowSet`) driving
//!   a `PageStore` B-tree, with `MemIndex` as the bundled store and
//!   `Catalog` resolving index names.
//!
//! `lookup` holds the call-level entry points: `lookup_2d`,
//! `lookup_3d`, their `tidonly` streaming variants, the Hilbert lookup,
//! and the coordinate-to-key helpers.

mod cursor;
mod errors;
mod key;
mod lookup;
mod pager;
mod rowset;
mod scan;
mod subquery;
mod util;

pub use cursor::{LeafCursor, ScanStats};
pub use errors::{ZcurveErr, ZcurveResult};
pub use key::bignum::{from_bignum, to_bignum};
pub use key::{BitKey, BoxAttrs, KeyKind, RawKey, KEY_WORDS, MAX_COORDS};
pub use lookup::{
    encode_2d, encode_as_bignum_2d, encode_as_bignum_3d, hilbert_3d_lookup_tidonly,
    hilbert_encode_2d, hilbert_encode_3d, lookup_2d, lookup_2d_tidonly, lookup_3d,
    lookup_3d_tidonly, TidStream,
};
pub use pager::{
    BlockId, Catalog, IndexPage, InnerEntry, LeafEntry, MemIndex, PagePin, PageStore, RowLocator,
    DEFAULT_FANOUT,
};
pub use rowset::{RowItem, RowSet};
pub use scan::{SpatialScan, SplitStats};
pub use subquery::{SubQuery, SubQueryPool};
