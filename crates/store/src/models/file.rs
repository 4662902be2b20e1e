use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use std::fmt;
use std::str::FromStr;
use time::UtcDateTime;

/// Where a file is in the hash lifecycle.
///
/// `Failed` is reserved: hashing errors currently reset the file to
/// `Pending` so the next phase retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStatus {
    Pending,
    Hashing,
    Done,
    Failed,
}

impl HashStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Hashing => "hashing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for HashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "hashing" => Ok(Self::Hashing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => exn::bail!(ErrorKind::InvalidData("hash status")),
        }
    }
}

/// A single file record: metadata and optional content hash.
///
/// `path` is relative to the owning folder as stored; queries that join the
/// folder for display return it as a full path instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub id: i64,
    /// Set when the file was selected through the ledger for a scan.
    pub scan_id: i64,
    pub folder_id: i64,
    pub path: String,
    pub size: i64,
    /// Modification time as unix seconds.
    pub mtime: i64,
    pub inode: i64,
    /// `None` when the OS does not provide a device id.
    pub device_id: Option<i64>,
    pub hash: Option<String>,
    pub hash_status: HashStatus,
    pub hashed_at: Option<UtcDateTime>,
}

/// Metadata for one file in a batch upsert. `path` must be relative to the
/// folder root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub path: String,
    pub size: i64,
    pub mtime: i64,
    pub inode: i64,
    pub device_id: Option<i64>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    pub(crate) id: i64,
    #[sqlx(default)]
    pub(crate) scan_id: i64,
    pub(crate) folder_id: i64,
    pub(crate) path: String,
    pub(crate) size: i64,
    pub(crate) mtime: i64,
    pub(crate) inode: i64,
    pub(crate) device_id: Option<i64>,
    pub(crate) hash: Option<String>,
    pub(crate) hash_status: String,
    pub(crate) hashed_at: Option<i64>,
}

impl TryFrom<FileRow> for File {
    type Error = Error;
    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            scan_id: row.scan_id,
            folder_id: row.folder_id,
            path: row.path,
            size: row.size,
            mtime: row.mtime,
            inode: row.inode,
            device_id: row.device_id,
            hash: row.hash,
            hash_status: row.hash_status.parse()?,
            hashed_at: row
                .hashed_at
                .map(|s| {
                    UtcDateTime::from_unix_timestamp(s).or_raise(|| ErrorKind::InvalidData("hashed date"))
                })
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("pending", HashStatus::Pending)]
    #[case("hashing", HashStatus::Hashing)]
    #[case("done", HashStatus::Done)]
    #[case("failed", HashStatus::Failed)]
    fn test_hash_status_round_trip(#[case] text: &str, #[case] status: HashStatus) {
        assert_eq!(text.parse::<HashStatus>().unwrap(), status);
        assert_eq!(status.as_str(), text);
    }

    #[test]
    fn test_hash_status_rejects_unknown() {
        assert!("unknown".parse::<HashStatus>().is_err());
    }

    #[test]
    fn test_row_to_model() {
        let row = FileRow {
            id: 7,
            scan_id: 3,
            folder_id: 1,
            path: "photos/2024/img_0001.jpg".to_string(),
            size: 4_194_304,
            mtime: 1_700_000_000,
            inode: 123_456,
            device_id: Some(2049),
            hash: Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824".to_string()),
            hash_status: "done".to_string(),
            hashed_at: Some(1_700_000_100),
        };
        let file = File::try_from(row).unwrap();
        assert_eq!(file.hash_status, HashStatus::Done);
        assert_eq!(file.hashed_at.unwrap().unix_timestamp(), 1_700_000_100);
    }
}
