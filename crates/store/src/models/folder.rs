use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use time::UtcDateTime;

/// A root directory configured for scanning.
///
/// Folders are created on first scan (or explicitly) and never rewritten;
/// they own their [`File`](crate::File) rows via foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: i64,
    /// Absolute, cleaned path on the host filesystem.
    pub path: String,
    pub created_at: UtcDateTime,
}

#[derive(sqlx::FromRow)]
pub(crate) struct FolderRow {
    pub(crate) id: i64,
    pub(crate) path: String,
    pub(crate) created_at: i64,
}

impl TryFrom<FolderRow> for Folder {
    type Error = Error;
    fn try_from(row: FolderRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            path: row.path,
            created_at: UtcDateTime::from_unix_timestamp(row.created_at)
                .or_raise(|| ErrorKind::InvalidData("folder creation date"))?,
        })
    }
}
