//! Engine Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("store operation failed")]
    Store,
    #[display("scan root is not a directory: {}", _0.display())]
    NotADirectory(#[error(not(source))] PathBuf),
    #[display("walk failed at {}", _0.display())]
    Walk(#[error(not(source))] PathBuf),
    #[display("failed to hash {}", _0.display())]
    HashFile(#[error(not(source))] PathBuf),
    #[display("ignore file unreadable: {}", _0.display())]
    IgnoreFile(#[error(not(source))] PathBuf),
    /// A writer task panicked; the pipeline drained and shut down.
    #[display("scan writer panicked")]
    WriterPanic,
    #[display("scan queue is full, try again later")]
    QueueFull,
    #[display("operation cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull)
    }
}
