//! File row upserts and the file_scan ledger.

use crate::error::{ErrorKind, Result};
use crate::models::{File, FileRow, NewFile};
use crate::repo::Store;
use exn::ResultExt;

impl Store {
    /// Insert or update a file by `(folder_id, path)` and return the file id.
    ///
    /// On conflict the metadata columns are refreshed but the hash and
    /// hash_status are never touched, so a digest computed by an earlier
    /// scan survives a rescan of unchanged metadata. `path` must be relative
    /// to the folder root.
    pub async fn upsert_file(
        &self,
        folder_id: i64,
        path: &str,
        size: i64,
        mtime: i64,
        inode: i64,
        device_id: Option<i64>,
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO files (folder_id, path, size, mtime, inode, device_id, hash_status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending') \
             ON CONFLICT (folder_id, path) DO UPDATE SET \
             size = excluded.size, mtime = excluded.mtime, inode = excluded.inode, \
             device_id = excluded.device_id \
             RETURNING id",
        )
        .bind(folder_id)
        .bind(path)
        .bind(size)
        .bind(mtime)
        .bind(inode)
        .bind(device_id)
        .fetch_one(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(id)
    }

    /// Insert or update multiple files in one statement and return their ids
    /// in input order. Empty input returns an empty vec without touching the
    /// database.
    pub async fn upsert_files_batch(&self, folder_id: i64, rows: &[NewFile]) -> Result<Vec<i64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO files (folder_id, path, size, mtime, inode, device_id, hash_status) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(folder_id)
                .push_bind(&row.path)
                .push_bind(row.size)
                .push_bind(row.mtime)
                .push_bind(row.inode)
                .push_bind(row.device_id)
                .push_bind("pending");
        });
        builder.push(
            " ON CONFLICT (folder_id, path) DO UPDATE SET \
             size = excluded.size, mtime = excluded.mtime, inode = excluded.inode, \
             device_id = excluded.device_id \
             RETURNING id",
        );
        let ids: Vec<i64> = builder
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if ids.len() != rows.len() {
            exn::bail!(ErrorKind::BatchMismatch(ids.len(), rows.len()));
        }
        Ok(ids)
    }

    /// Link a file to a scan in the ledger. Idempotent: duplicate
    /// `(file, scan)` pairs are silently ignored.
    pub async fn insert_file_scan(&self, file_id: i64, scan_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_scan (file_id, scan_id) VALUES (?1, ?2) \
             ON CONFLICT (file_id, scan_id) DO NOTHING",
        )
        .bind(file_id)
        .bind(scan_id)
        .execute(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Link multiple files to a scan in one statement. Idempotent.
    pub async fn insert_file_scan_batch(&self, file_ids: &[i64], scan_id: i64) -> Result<()> {
        if file_ids.is_empty() {
            return Ok(());
        }
        let mut builder = sqlx::QueryBuilder::new("INSERT INTO file_scan (file_id, scan_id) ");
        builder.push_values(file_ids, |mut b, file_id| {
            b.push_bind(file_id).push_bind(scan_id);
        });
        builder.push(" ON CONFLICT (file_id, scan_id) DO NOTHING");
        builder
            .build()
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Return all files observed by the given scan, with full display paths
    /// (`folder path || '/' || file path`), ordered by file id.
    pub async fn files_by_scan(&self, scan_id: i64) -> Result<Vec<File>> {
        let rows: Vec<FileRow> = sqlx::query_as(
            "SELECT f.id, fs.scan_id, f.folder_id, (fo.path || '/' || f.path) AS path, \
                    f.size, f.mtime, f.inode, f.device_id, f.hash, f.hash_status, f.hashed_at \
             FROM files f \
             JOIN file_scan fs ON f.id = fs.file_id \
             JOIN folders fo ON f.folder_id = fo.id \
             WHERE fs.scan_id = ?1 \
             ORDER BY f.id",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(File::try_from).collect()
    }
}
