//! Aggregation queries for the duplicate-browsing UI.
//!
//! No "duplicate" flag is stored anywhere; groupings are recomputed from the
//! files and ledger tables on every query, scoped either to one scan or to a
//! caller-supplied scan set (typically latest-per-folder).

use crate::error::{ErrorKind, Result};
use crate::models::{DuplicateGroupByHash, DuplicateGroupByInode, File, FileRow};
use crate::repo::Store;
use exn::ResultExt;

// Sentinel for grouping hardlinks when the OS gave us no device id; SQLite
// GROUP BY treats each NULL as distinct otherwise.
const NO_DEVICE: i64 = -999;

const FILE_DISPLAY_COLUMNS: &str = "f.id, fs.scan_id, f.folder_id, \
     (fo.path || '/' || f.path) AS path, f.size, f.mtime, f.inode, f.device_id, \
     f.hash, f.hash_status, f.hashed_at";

fn push_limit_offset(builder: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>, limit: i64, offset: i64) {
    if limit > 0 {
        builder.push(" LIMIT ").push_bind(limit);
    }
    if offset > 0 {
        builder.push(" OFFSET ").push_bind(offset);
    }
}

impl Store {
    /// Number of duplicate-by-hash groups in the scan.
    pub async fn duplicate_groups_by_hash_count(&self, scan_id: i64) -> Result<i64> {
        self.duplicate_groups_by_hash_count_across_scans(&[scan_id]).await
    }

    /// Duplicate-by-hash groups for the scan, largest total size first.
    /// `limit`/`offset` of 0 mean unpaginated.
    pub async fn duplicate_groups_by_hash(
        &self,
        scan_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DuplicateGroupByHash>> {
        self.duplicate_groups_by_hash_across_scans(&[scan_id], limit, offset).await
    }

    /// Number of duplicate-by-hash groups across the given scans.
    pub async fn duplicate_groups_by_hash_count_across_scans(&self, scan_ids: &[i64]) -> Result<i64> {
        if scan_ids.is_empty() {
            return Ok(0);
        }
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT COUNT(*) FROM (\
             SELECT 1 FROM files f JOIN file_scan fs ON f.id = fs.file_id \
             WHERE f.hash_status = 'done' AND fs.scan_id IN (",
        );
        let mut ids = builder.separated(", ");
        for scan_id in scan_ids {
            ids.push_bind(scan_id);
        }
        builder.push(") GROUP BY f.hash HAVING COUNT(*) > 1) sub");
        let (count,): (i64,) = builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(count)
    }

    /// Duplicate-by-hash groups across the given scans, largest total size
    /// first, optionally paginated.
    pub async fn duplicate_groups_by_hash_across_scans(
        &self,
        scan_ids: &[i64],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DuplicateGroupByHash>> {
        if scan_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT f.hash, COUNT(*) AS count, COALESCE(SUM(f.size), 0) AS size \
             FROM files f JOIN file_scan fs ON f.id = fs.file_id \
             WHERE f.hash_status = 'done' AND fs.scan_id IN (",
        );
        let mut ids = builder.separated(", ");
        for scan_id in scan_ids {
            ids.push_bind(scan_id);
        }
        builder.push(") GROUP BY f.hash HAVING COUNT(*) > 1 ORDER BY SUM(f.size) DESC");
        push_limit_offset(&mut builder, limit, offset);
        let groups = builder
            .build_query_as::<DuplicateGroupByHash>()
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(groups)
    }

    /// Files in the scan with the given digest (full display paths). A limit
    /// of 0 means all.
    pub async fn files_in_hash_group(&self, scan_id: i64, hash: &str, limit: i64) -> Result<Vec<File>> {
        self.files_in_hash_group_across_scans(&[scan_id], hash, limit).await
    }

    /// Files with the given digest in any of the given scans, ordered by
    /// scan then path.
    pub async fn files_in_hash_group_across_scans(
        &self,
        scan_ids: &[i64],
        hash: &str,
        limit: i64,
    ) -> Result<Vec<File>> {
        if scan_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = sqlx::QueryBuilder::new(format!(
            "SELECT {FILE_DISPLAY_COLUMNS} \
             FROM files f \
             JOIN file_scan fs ON f.id = fs.file_id \
             JOIN folders fo ON f.folder_id = fo.id \
             WHERE f.hash_status = 'done' AND fs.scan_id IN ("
        ));
        let mut ids = builder.separated(", ");
        for scan_id in scan_ids {
            ids.push_bind(scan_id);
        }
        builder.push(") AND f.hash = ").push_bind(hash);
        builder.push(" ORDER BY fs.scan_id, f.path");
        push_limit_offset(&mut builder, limit, 0);
        let rows = builder
            .build_query_as::<FileRow>()
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(File::try_from).collect()
    }

    /// Groups of files in the scan sharing an inode (hardlinks), most linked
    /// first.
    pub async fn duplicate_groups_by_inode(&self, scan_id: i64) -> Result<Vec<DuplicateGroupByInode>> {
        let rows: Vec<(i64, Option<i64>, i64, i64)> = sqlx::query_as(
            "SELECT f.inode, f.device_id, COUNT(*), COALESCE(SUM(f.size), 0) \
             FROM files f JOIN file_scan fs ON f.id = fs.file_id \
             WHERE fs.scan_id = ?1 \
             GROUP BY f.inode, COALESCE(f.device_id, ?2) \
             HAVING COUNT(*) > 1 \
             ORDER BY COUNT(*) DESC",
        )
        .bind(scan_id)
        .bind(NO_DEVICE)
        .fetch_all(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(rows
            .into_iter()
            .map(|(inode, device_id, count, size)| DuplicateGroupByInode {
                inode,
                device_id: device_id.filter(|d| *d != NO_DEVICE),
                count,
                size,
            })
            .collect())
    }

    /// Files in the scan sharing the given inode (and device id, if known).
    pub async fn files_in_inode_group(
        &self,
        scan_id: i64,
        inode: i64,
        device_id: Option<i64>,
    ) -> Result<Vec<File>> {
        let rows: Vec<FileRow> = match device_id {
            Some(device_id) => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_DISPLAY_COLUMNS} \
                     FROM files f \
                     JOIN file_scan fs ON f.id = fs.file_id \
                     JOIN folders fo ON f.folder_id = fo.id \
                     WHERE fs.scan_id = ?1 AND f.inode = ?2 AND f.device_id = ?3 \
                     ORDER BY f.path"
                ))
                .bind(scan_id)
                .bind(inode)
                .bind(device_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {FILE_DISPLAY_COLUMNS} \
                     FROM files f \
                     JOIN file_scan fs ON f.id = fs.file_id \
                     JOIN folders fo ON f.folder_id = fo.id \
                     WHERE fs.scan_id = ?1 AND f.inode = ?2 AND f.device_id IS NULL \
                     ORDER BY f.path"
                ))
                .bind(scan_id)
                .bind(inode)
                .fetch_all(&self.pool)
                .await
            }
        }
        .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(File::try_from).collect()
    }
}
