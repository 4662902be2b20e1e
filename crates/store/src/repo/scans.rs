//! Scan row lifecycle and progress updates.

use crate::error::{ErrorKind, Result};
use crate::models::{Scan, ScanRow};
use crate::repo::Store;
use exn::ResultExt;
use time::UtcDateTime;

const SELECT_SCAN: &str = "SELECT s.id, s.folder_id, fo.path AS root_path, s.started_at, \
     s.completed_at, s.hash_started_at, s.hash_completed_at, s.file_count, \
     s.scan_skipped_count, s.hashed_file_count, s.hashed_byte_count, \
     s.hash_reused_count, s.hash_error_count \
     FROM scans s JOIN folders fo ON s.folder_id = fo.id";

impl Store {
    /// Insert a new scan for the given folder and return it.
    pub async fn create_scan(&self, folder_id: i64) -> Result<Scan> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO scans (folder_id, started_at) VALUES (?1, ?2) RETURNING id",
        )
        .bind(folder_id)
        .bind(UtcDateTime::now().unix_timestamp())
        .fetch_one(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        self.get_scan(id).await
    }

    /// Return the scan with the given id (root path joined in from folders).
    pub async fn get_scan(&self, id: i64) -> Result<Scan> {
        let row: Option<ScanRow> = sqlx::query_as(&format!("{SELECT_SCAN} WHERE s.id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match row {
            Some(row) => Scan::try_from(row),
            None => exn::bail!(ErrorKind::ScanNotFound(id)),
        }
    }

    /// Return all scans, newest first.
    pub async fn list_scans(&self) -> Result<Vec<Scan>> {
        self.list_scans_inner(0).await
    }

    /// Return the most recent `limit` scans.
    pub async fn list_scans_recent(&self, limit: i64) -> Result<Vec<Scan>> {
        self.list_scans_inner(limit).await
    }

    async fn list_scans_inner(&self, limit: i64) -> Result<Vec<Scan>> {
        let mut query = format!("{SELECT_SCAN} ORDER BY s.started_at DESC, s.id DESC");
        if limit > 0 {
            query.push_str(" LIMIT ?1");
        }
        let mut q = sqlx::query_as::<_, ScanRow>(&query);
        if limit > 0 {
            q = q.bind(limit);
        }
        let rows = q.fetch_all(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Scan::try_from).collect()
    }

    /// Set `completed_at` plus the final file and skipped counts.
    pub async fn update_scan_completed_at(
        &self,
        scan_id: i64,
        file_count: i64,
        scan_skipped_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scans SET completed_at = ?1, file_count = ?2, scan_skipped_count = ?3 WHERE id = ?4",
        )
        .bind(UtcDateTime::now().unix_timestamp())
        .bind(file_count)
        .bind(scan_skipped_count)
        .bind(scan_id)
        .execute(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Write the live file count so the UI sees progress mid-walk.
    pub async fn update_scan_file_count_progress(&self, scan_id: i64, file_count: i64) -> Result<()> {
        sqlx::query("UPDATE scans SET file_count = ?1 WHERE id = ?2")
            .bind(file_count)
            .bind(scan_id)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Set `hash_started_at` and clear the hash completion fields. Called at
    /// the start of every hash phase, including reruns.
    pub async fn update_scan_hash_started_at(&self, scan_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE scans SET hash_started_at = ?1, hash_completed_at = NULL, \
             hashed_file_count = NULL, hashed_byte_count = NULL, \
             hash_reused_count = NULL, hash_error_count = NULL \
             WHERE id = ?2",
        )
        .bind(UtcDateTime::now().unix_timestamp())
        .bind(scan_id)
        .execute(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Set `hash_completed_at` and the hash-phase counts.
    pub async fn update_scan_hash_completed_at(
        &self,
        scan_id: i64,
        hashed_file_count: i64,
        hashed_byte_count: i64,
        hash_reused_count: i64,
        hash_error_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scans SET hash_completed_at = ?1, hashed_file_count = ?2, \
             hashed_byte_count = ?3, hash_reused_count = ?4, hash_error_count = ?5 \
             WHERE id = ?6",
        )
        .bind(UtcDateTime::now().unix_timestamp())
        .bind(hashed_file_count)
        .bind(hashed_byte_count)
        .bind(hash_reused_count)
        .bind(hash_error_count)
        .bind(scan_id)
        .execute(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Count and total size of the scan's files that reached `done`.
    pub async fn hashed_file_count_and_bytes(&self, scan_id: i64) -> Result<(i64, i64)> {
        let (count, bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(f.size), 0) FROM files f \
             JOIN file_scan fs ON f.id = fs.file_id \
             WHERE fs.scan_id = ?1 AND f.hash_status = 'done'",
        )
        .bind(scan_id)
        .fetch_one(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok((count, bytes))
    }

    /// The most recent scan for the folder that is not fully complete, if any.
    pub async fn latest_incomplete_scan_for_folder(&self, folder_id: i64) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM scans \
             WHERE folder_id = ?1 AND (completed_at IS NULL OR hash_completed_at IS NULL) \
             ORDER BY started_at DESC, id DESC LIMIT 1",
        )
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(|(id,)| id))
    }

    /// The most recent scan id for every folder that has one. This is the
    /// scan set the UI passes to the across-scans duplicate queries for its
    /// "latest" view; no latest flag is stored.
    pub async fn latest_scan_per_folder(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM scans s WHERE s.id = (\
                 SELECT s2.id FROM scans s2 WHERE s2.folder_id = s.folder_id \
                 ORDER BY s2.started_at DESC, s2.id DESC LIMIT 1\
             ) ORDER BY s.folder_id",
        )
        .fetch_all(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
