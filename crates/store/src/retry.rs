//! Bounded retry for transient SQLITE_BUSY contention.
//!
//! SQLite returns SQLITE_BUSY when a write collides with another connection's
//! lock even with a busy_timeout configured, most often on the hash-claim
//! query where several workers race for the same row. The helpers here retry
//! such operations with doubling backoff up to a fixed budget; anything that
//! is not a busy error is returned immediately.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub(crate) const CLAIM_RETRY_ATTEMPTS: u32 = 8;
pub(crate) const CLAIM_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Per-run counter of busy retries, for end-of-phase logging.
///
/// Create one per hash phase and pass it to the contended operations; there
/// is deliberately no process-wide counter.
#[derive(Debug, Default)]
pub struct BusyRetries(AtomicI64);

impl BusyRetries {
    pub fn count(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reports whether `err` means SQLite returned SQLITE_BUSY (database locked).
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("5") || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Runs `op`, retrying on busy errors with doubling backoff (capped at 5 s)
/// up to `max_attempts` runs in total. Returns the last busy error when the
/// budget is exhausted so logs stay informative.
pub(crate) async fn retry_on_busy<T, F, Fut>(
    max_attempts: u32,
    initial_backoff: Duration,
    retries: &BusyRetries,
    mut op: F,
) -> sqlx::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = sqlx::Result<T>>,
{
    let mut backoff = initial_backoff;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(err);
                }
                retries.record();
                tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64, "database busy, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(err) => return Err(err),
        }
    }
}
