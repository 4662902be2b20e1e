//! Store Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// The busy-retry budget was exhausted while another connection held the
    /// write lock.
    #[display("database busy: retries exhausted")]
    Busy,
    #[display("folder not found: {_0}")]
    FolderNotFound(#[error(not(source))] i64),
    #[display("scan not found: {_0}")]
    ScanNotFound(#[error(not(source))] i64),
    /// A column held a value the models cannot represent.
    #[display("invalid row data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// The batch upsert returned a different number of ids than rows sent.
    #[display("batch upsert returned {_0} ids, want {_1}")]
    BatchMismatch(#[error(not(source))] usize, usize),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }
}
