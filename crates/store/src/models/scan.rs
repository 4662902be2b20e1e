use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use time::UtcDateTime;

/// A single scan run: metadata and stats only.
///
/// Which files the scan observed lives in the `file_scan` ledger, not here.
/// The count fields are `None` until the corresponding phase completes (the
/// walk phase also writes `file_count` periodically for live progress).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub id: i64,
    pub folder_id: i64,
    /// Folder path, joined in for convenience.
    pub root_path: String,
    pub started_at: UtcDateTime,
    pub completed_at: Option<UtcDateTime>,
    pub hash_started_at: Option<UtcDateTime>,
    pub hash_completed_at: Option<UtcDateTime>,
    pub file_count: Option<i64>,
    pub scan_skipped_count: Option<i64>,
    pub hashed_file_count: Option<i64>,
    pub hashed_byte_count: Option<i64>,
    pub hash_reused_count: Option<i64>,
    pub hash_error_count: Option<i64>,
}

impl Scan {
    /// Both the walk phase and the hash phase have finished.
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some() && self.hash_completed_at.is_some()
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ScanRow {
    pub(crate) id: i64,
    pub(crate) folder_id: i64,
    pub(crate) root_path: String,
    pub(crate) started_at: i64,
    pub(crate) completed_at: Option<i64>,
    pub(crate) hash_started_at: Option<i64>,
    pub(crate) hash_completed_at: Option<i64>,
    pub(crate) file_count: Option<i64>,
    pub(crate) scan_skipped_count: Option<i64>,
    pub(crate) hashed_file_count: Option<i64>,
    pub(crate) hashed_byte_count: Option<i64>,
    pub(crate) hash_reused_count: Option<i64>,
    pub(crate) hash_error_count: Option<i64>,
}

fn datetime(seconds: i64, what: &'static str) -> Result<UtcDateTime, Error> {
    UtcDateTime::from_unix_timestamp(seconds).or_raise(|| ErrorKind::InvalidData(what))
}

impl TryFrom<ScanRow> for Scan {
    type Error = Error;
    fn try_from(row: ScanRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            folder_id: row.folder_id,
            root_path: row.root_path,
            started_at: datetime(row.started_at, "scan start date")?,
            completed_at: row.completed_at.map(|s| datetime(s, "scan completion date")).transpose()?,
            hash_started_at: row.hash_started_at.map(|s| datetime(s, "hash start date")).transpose()?,
            hash_completed_at: row
                .hash_completed_at
                .map(|s| datetime(s, "hash completion date"))
                .transpose()?,
            file_count: row.file_count,
            scan_skipped_count: row.scan_skipped_count,
            hashed_file_count: row.hashed_file_count,
            hashed_byte_count: row.hashed_byte_count,
            hash_reused_count: row.hash_reused_count,
            hash_error_count: row.hash_error_count,
        })
    }
}
