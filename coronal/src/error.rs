//! Error types shared across the crate.

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A file or table source could not be opened or read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Malformed column data or a missing required keyword.
    #[error("parse error: {0}")]
    Parse(String),
    /// A requested line, ion, level, table or group does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A target fell outside the tabulated grid.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// A caller-supplied value violates the documented preconditions.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    /// A hash-table probe exceeded its safety bound, or an interpolation
    /// corner could not be resolved from the tabulated grid.
    #[error("database corruption: {0}")]
    Corruption(String),
    /// The cooperative user-interrupt flag was observed.
    #[error("interrupted")]
    Cancelled,
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Short-hand for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;
