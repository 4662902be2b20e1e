//! Digest writes, inode-based reuse lookups, and recovery resets.

use crate::error::{ErrorKind, Result};
use crate::repo::Store;
use exn::ResultExt;
use time::UtcDateTime;

impl Store {
    /// Digest of any file in the same scan sharing `(inode, device_id)`, if
    /// one exists. Hardlinks point at the same content, so the digest can be
    /// copied without opening the file.
    pub async fn hash_for_inode(
        &self,
        scan_id: i64,
        inode: i64,
        device_id: Option<i64>,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = match device_id {
            Some(device_id) => {
                sqlx::query_as(
                    "SELECT f.hash FROM files f JOIN file_scan fs ON f.id = fs.file_id \
                     WHERE fs.scan_id = ?1 AND f.inode = ?2 AND f.device_id = ?3 \
                     AND f.hash IS NOT NULL LIMIT 1",
                )
                .bind(scan_id)
                .bind(inode)
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT f.hash FROM files f JOIN file_scan fs ON f.id = fs.file_id \
                     WHERE fs.scan_id = ?1 AND f.inode = ?2 AND f.device_id IS NULL \
                     AND f.hash IS NOT NULL LIMIT 1",
                )
                .bind(scan_id)
                .bind(inode)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(|(hash,)| hash))
    }

    /// Digest of any file anywhere matching `(inode, device_id)` and size,
    /// regardless of scan membership. An unchanged file rescanned later
    /// reuses the digest computed the first time.
    pub async fn hash_for_inode_any_scan(
        &self,
        inode: i64,
        device_id: Option<i64>,
        size: i64,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = match device_id {
            Some(device_id) => {
                sqlx::query_as(
                    "SELECT hash FROM files \
                     WHERE inode = ?1 AND device_id = ?2 AND size = ?3 AND hash IS NOT NULL LIMIT 1",
                )
                .bind(inode)
                .bind(device_id)
                .bind(size)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT hash FROM files \
                     WHERE inode = ?1 AND device_id IS NULL AND size = ?2 AND hash IS NOT NULL LIMIT 1",
                )
                .bind(inode)
                .bind(size)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(|(hash,)| hash))
    }

    /// Set the digest, mark the file `done`, and record when.
    pub async fn update_file_hash(&self, file_id: i64, hash: &str, hashed_at: UtcDateTime) -> Result<()> {
        sqlx::query("UPDATE files SET hash = ?1, hash_status = 'done', hashed_at = ?2 WHERE id = ?3")
            .bind(hash)
            .bind(hashed_at.unix_timestamp())
            .bind(file_id)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Return the file to `pending` if it is currently `hashing`. Called when
    /// hashing one file fails so the next phase retries it.
    pub async fn reset_file_hash_status_to_pending(&self, file_id: i64) -> Result<()> {
        sqlx::query("UPDATE files SET hash_status = 'pending' WHERE id = ?1 AND hash_status = 'hashing'")
            .bind(file_id)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Return every `hashing` file in the scan to `pending`. Run at the start
    /// of each hash phase to recover rows orphaned by a crash or cancel.
    pub async fn reset_hash_status_hashing_to_pending(&self, scan_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE files SET hash_status = 'pending' \
             WHERE id IN (SELECT file_id FROM file_scan WHERE scan_id = ?1) \
             AND hash_status = 'hashing'",
        )
        .bind(scan_id)
        .execute(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }
}
