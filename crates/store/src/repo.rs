//! Store operations over the connection pool.
//!
//! [`Store`] is the only handle the scan pipeline, hash workers, and UI
//! collaborator use; it is cheap to clone and every method is a short
//! transaction (no method spans filesystem I/O). Operations are grouped by
//! table into the submodules below, each an `impl Store` block.

mod duplicates;
mod file_hash;
mod files;
mod folders;
mod hash_queue;
mod scans;

use crate::Database;
use sqlx::SqlitePool;

/// Handle for running store operations.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl From<&Database> for Store {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}

impl Store {
    /// Create a store over an existing connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
