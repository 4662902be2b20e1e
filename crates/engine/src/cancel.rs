//! Cooperative cancellation shared by every pipeline stage.
//!
//! Walkers, writers, hash workers, and the orchestrator all hold a
//! [`CancelToken`] and observe it at their suspension points (channel
//! operations, throttle waits, loop boundaries). Cancellation is a request,
//! not preemption: a stage blocked inside an OS call finishes that call
//! first, which is also why directory listing has no in-process timeout.

use tokio::sync::watch;

/// The cancelling side. Dropping the source without calling
/// [`cancel`](CancelSource::cancel) leaves all tokens uncancelled forever.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Hand out a token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken { rx: self.tx.subscribe() }
    }

    /// Request cancellation. All tokens wake promptly; idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap-to-clone handle checked by workers.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Non-blocking check for use at loop boundaries.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested; never resolves otherwise.
    /// Intended for `tokio::select!` arms next to channel or I/O waits.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Source dropped without cancelling: stay pending so select
            // arms fall through to the real work.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_cancelled() {
        let source = CancelSource::new();
        let token = source.token();
        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_source_is_not_cancellation() {
        let source = CancelSource::new();
        let token = source.token();
        drop(source);
        assert!(!token.is_cancelled());
        let result = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(result.is_err(), "cancelled() must stay pending");
    }
}
