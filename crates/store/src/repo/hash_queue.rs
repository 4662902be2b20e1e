//! Candidate selection and atomic claiming for the hash phase.
//!
//! A file observed by scan S is a hash candidate when it is still `pending`
//! and its size is shared: with another file in S (intra-folder duplicate),
//! with any already-digested file anywhere (digest reuse instead of a fresh
//! read), or with a file in a different scan's ledger (cross-folder
//! duplicate). Priority is size descending so the biggest payoffs hash first.

use crate::error::{ErrorKind, Result};
use crate::models::{File, FileRow};
use crate::repo::Store;
use crate::retry::{self, BusyRetries, CLAIM_RETRY_ATTEMPTS, CLAIM_RETRY_BACKOFF};
use exn::ResultExt;
use futures::stream::BoxStream;
use futures::StreamExt;

// WHERE fragment selecting scan ?1's candidates; `f` must alias `files`.
const CANDIDATE_PREDICATE: &str = "f.hash_status = 'pending' \
     AND EXISTS (SELECT 1 FROM file_scan fs WHERE fs.file_id = f.id AND fs.scan_id = ?1) \
     AND (\
         f.size IN (\
             SELECT f2.size FROM files f2 \
             JOIN file_scan fs2 ON fs2.file_id = f2.id \
             WHERE fs2.scan_id = ?1 \
             GROUP BY f2.size HAVING COUNT(*) > 1\
         ) \
         OR EXISTS (\
             SELECT 1 FROM files fd \
             WHERE fd.size = f.size AND fd.hash_status = 'done' AND fd.id <> f.id\
         ) \
         OR EXISTS (\
             SELECT 1 FROM files fo \
             JOIN file_scan fso ON fso.file_id = fo.id \
             WHERE fso.scan_id <> ?1 AND fo.size = f.size AND fo.id <> f.id\
         )\
     )";

impl Store {
    /// Number of hash candidates currently pending for the scan. One cheap
    /// read at phase start for progress logging.
    pub async fn count_hash_candidates(&self, scan_id: i64) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM files f WHERE {CANDIDATE_PREDICATE}");
        let (count,): (i64,) = sqlx::query_as(&query)
            .bind(scan_id)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(count)
    }

    /// Stream all pending hash candidates for the scan, ordered by size
    /// descending. Paths are relative to the scan's folder.
    ///
    /// This is the producer-side dispatch: one query feeds every worker, so
    /// there is no per-row claim contention. Use [`claim_next_hash_job`]
    /// instead when the candidate set may grow while the phase runs.
    ///
    /// [`claim_next_hash_job`]: Store::claim_next_hash_job
    pub fn pending_hash_jobs(&self, scan_id: i64) -> BoxStream<'_, Result<File>> {
        // The returned stream borrows the SQL, so the assembled query text
        // has to outlive this call.
        static QUERY: std::sync::OnceLock<String> = std::sync::OnceLock::new();
        let query = QUERY.get_or_init(|| {
            format!(
                "SELECT f.id, ?1 AS scan_id, f.folder_id, f.path, f.size, f.mtime, f.inode, \
                        f.device_id, f.hash, f.hash_status, f.hashed_at \
                 FROM files f WHERE {CANDIDATE_PREDICATE} \
                 ORDER BY f.size DESC, f.id"
            )
        });
        sqlx::query_as::<_, FileRow>(query)
            .bind(scan_id)
            .fetch(&self.pool)
            .map(|row| row.or_raise(|| ErrorKind::Database).and_then(File::try_from))
            .boxed()
    }

    /// Atomically claim the next pending candidate for the scan, moving it
    /// `pending` → `hashing`, and return it. Returns `None` when no
    /// candidate remains.
    ///
    /// A single UPDATE with a subquery picks and transitions the row, so two
    /// workers can never claim the same file. Busy errors are retried with
    /// backoff up to a fixed budget, recorded on `retries`.
    pub async fn claim_next_hash_job(
        &self,
        scan_id: i64,
        retries: &BusyRetries,
    ) -> Result<Option<File>> {
        let query = format!(
            "UPDATE files SET hash_status = 'hashing' \
             WHERE id = (\
                 SELECT f.id FROM files f WHERE {CANDIDATE_PREDICATE} \
                 ORDER BY f.size DESC, f.id LIMIT 1\
             ) \
             RETURNING id, folder_id, path, size, mtime, inode, device_id, hash, hash_status, hashed_at"
        );
        let claimed = retry::retry_on_busy(CLAIM_RETRY_ATTEMPTS, CLAIM_RETRY_BACKOFF, retries, || {
            sqlx::query_as::<_, FileRow>(&query).bind(scan_id).fetch_optional(&self.pool)
        })
        .await;
        let row = match claimed {
            Ok(row) => row,
            Err(err) if retry::is_busy(&err) => exn::bail!(ErrorKind::Busy),
            Err(err) => return Err(err).or_raise(|| ErrorKind::Database),
        };
        match row {
            Some(row) => {
                let mut file = File::try_from(row)?;
                file.scan_id = scan_id;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HashStatus;
    use crate::Database;
    use std::collections::HashSet;

    async fn seed_scan(store: &Store, path: &str, sizes: &[(&str, i64)]) -> i64 {
        let folder_id = store.get_or_create_folder_by_path(path).await.unwrap();
        let scan = store.create_scan(folder_id).await.unwrap();
        for (index, (name, size)) in sizes.iter().enumerate() {
            let inode = 1000 * folder_id + index as i64;
            let id = store.upsert_file(folder_id, name, *size, 0, inode, None).await.unwrap();
            store.insert_file_scan(id, scan.id).await.unwrap();
        }
        scan.id
    }

    #[tokio::test]
    async fn test_same_scan_size_pair_is_candidate() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let scan = seed_scan(&store, "/roots/a", &[("x", 5), ("y", 5), ("z", 9)]).await;
        assert_eq!(store.count_hash_candidates(scan).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unique_sizes_are_not_candidates() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let scan = seed_scan(&store, "/roots/a", &[("x", 10), ("y", 20)]).await;
        assert_eq!(store.count_hash_candidates(scan).await.unwrap(), 0);
        let retries = BusyRetries::default();
        assert!(store.claim_next_hash_job(scan, &retries).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cross_scan_size_match_is_candidate() {
        // A file unique within its own scan still becomes a candidate when a
        // different scan observed a file of the same size.
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let first = seed_scan(&store, "/roots/a", &[("only", 1000)]).await;
        let second = seed_scan(&store, "/roots/b", &[("twin", 1000)]).await;
        assert_eq!(store.count_hash_candidates(first).await.unwrap(), 1);
        assert_eq!(store.count_hash_candidates(second).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_done_file_of_same_size_is_candidate_trigger() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let first = seed_scan(&store, "/roots/a", &[("seen", 64)]).await;
        let done = store.files_by_scan(first).await.unwrap()[0].id;
        store.update_file_hash(done, "cafe", time::UtcDateTime::now()).await.unwrap();

        // New scan of a different folder, single file, but its size matches
        // an already-digested file: candidate via digest-reuse rule.
        let second = seed_scan(&store, "/roots/b", &[("fresh", 64)]).await;
        assert_eq!(store.count_hash_candidates(second).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_orders_by_size_and_excludes_claimed() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let scan = seed_scan(&store, "/roots/a", &[("small", 5), ("big", 50), ("big2", 50), ("small2", 5)]).await;
        let retries = BusyRetries::default();

        let first = store.claim_next_hash_job(scan, &retries).await.unwrap().unwrap();
        assert_eq!(first.size, 50);
        assert_eq!(first.hash_status, HashStatus::Hashing);
        assert_eq!(first.scan_id, scan);

        let mut seen = HashSet::from([first.id]);
        while let Some(job) = store.claim_next_hash_job(scan, &retries).await.unwrap() {
            assert!(seen.insert(job.id), "claimed the same file twice");
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect_path(dir.path().join("claims.db")).await.unwrap();
        let store = Store::from(&db);
        let scan = seed_scan(
            &store,
            "/roots/a",
            &[("a", 7), ("b", 7), ("c", 7), ("d", 7), ("e", 7), ("f", 7), ("g", 7), ("h", 7)],
        )
        .await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let retries = BusyRetries::default();
                let mut ids = Vec::new();
                while let Some(job) = store.claim_next_hash_job(scan, &retries).await.unwrap() {
                    ids.push(job.id);
                }
                ids
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 8);
        assert_eq!(unique.len(), 8);
    }

    #[tokio::test]
    async fn test_pending_jobs_stream_matches_claim_set() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let scan = seed_scan(&store, "/roots/a", &[("x", 5), ("y", 5), ("lone", 3)]).await;
        let jobs: Vec<_> = store
            .pending_hash_jobs(scan)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|j| j.unwrap())
            .collect();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.size == 5 && j.scan_id == scan));
        // Relative paths: the engine joins them onto the scan root.
        assert!(jobs.iter().all(|j| !j.path.starts_with('/')));
    }
}
