//! SQLite store for the duplicate-file scan engine.
//!
//! This crate owns the relational schema and every primitive the scan
//! pipeline, hash workers, and UI collaborator rely on. All state the engine
//! needs to recover after a restart lives here - there is no in-memory
//! catalog anywhere.
//!
//! # Architecture
//! Four entities:
//! - **Folders**: configured scan roots, stored by absolute path.
//! - **Scans**: one row per traversal of a folder, carrying phase timestamps
//!   and counts. Mutated only by its own run.
//! - **Files**: one row per `(folder, relative path)`, upserted on every
//!   scan, carrying size/mtime/inode metadata and the optional content
//!   digest. The digest is file-level: every scan that observes the file
//!   sees the same digest, and it is only recomputed when size or inode
//!   change.
//! - **file_scan**: the ledger. A file was observed by a scan iff a ledger
//!   row exists.

mod db;
pub mod error;
mod models;
mod repo;
mod retry;

pub use crate::db::Database;
pub use crate::models::{
    DuplicateGroupByHash, DuplicateGroupByInode, File, Folder, HashStatus, NewFile, Scan,
};
pub use crate::repo::Store;
pub use crate::retry::BusyRetries;
