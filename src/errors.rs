use thiserror::Error;

pub type ZcurveResult<T> = Result<T, ZcurveErr>;

/// Error conditions surfaced by the index engine.
///
/// Every error is terminal for the stream that produced it: the scan
/// releases its pinned page and further calls report end-of-stream. The
/// engine never retries on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZcurveErr {
    /// Dimension mismatch, coordinate out of the curve's domain, or an
    /// inverted query box
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The index name does not resolve in the catalog
    #[error("index \"{0}\" does not exist")]
    NotFound(String),
    /// The tree violated a structural invariant while being walked
    #[error("index structure corrupt: {0}")]
    StructureCorrupt(&'static str),
    /// The caller raised the interrupt flag between iterations
    #[error("query interrupted")]
    Interrupted,
}
