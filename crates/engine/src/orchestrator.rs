//! Serialized scan orchestration.
//!
//! Scans are queued by id and processed one at a time, so only one scan does
//! file I/O at any moment (the hash phase still runs its own worker pool
//! within that scan). Manual starts, continues, and scheduled runs all
//! enqueue onto the same queue.

use crate::cancel::CancelToken;
use crate::error::{ErrorKind, Result};
use crate::hash::{run_hash_phase, DispatchMode, HashOptions};
use crate::scan::{patterns_for_root, run_scan_for_existing, PipelineConfig, ScanOptions};
use ditto_store::Store;
use exn::ResultExt;
use std::path::Path;

/// Enqueue-on-full returns an error rather than blocking the caller.
pub const SCAN_QUEUE_CAPACITY: usize = 64;

const ORCHESTRATED_HASH_WORKERS: usize = 6;

/// Options applied to every scan the orchestrator processes. Exclusion
/// patterns are resolved per root (defaults + the root's ignore file) when
/// the scan runs.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub max_files_per_second: u32,
    pub hash: HashOptions,
    pub pipeline: PipelineConfig,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_files_per_second: 0,
            hash: HashOptions {
                workers: ORCHESTRATED_HASH_WORKERS,
                max_hashes_per_second: 0,
                mode: DispatchMode::Stream,
            },
            pipeline: PipelineConfig::from_env(),
        }
    }
}

/// Bounded queue of scan ids with a single serial consumer.
#[derive(Debug, Clone)]
pub struct ScanQueue {
    tx: async_channel::Sender<i64>,
    rx: async_channel::Receiver<i64>,
}

impl Default for ScanQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanQueue {
    pub fn new() -> Self {
        Self::with_capacity(SCAN_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Queue a scan for processing. Returns [`ErrorKind::QueueFull`] instead
    /// of blocking when the queue is at capacity; callers surface "try again
    /// later".
    pub fn enqueue(&self, scan_id: i64) -> Result<()> {
        match self.tx.try_send(scan_id) {
            Ok(()) => Ok(()),
            Err(_) => exn::bail!(ErrorKind::QueueFull),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Long-running consumer: process queued scans one at a time until
    /// cancelled. Errors and panics are logged per scan; the next queued
    /// scan still runs.
    pub async fn run_worker(&self, cancel: &CancelToken, store: &Store, options: &OrchestratorOptions) {
        loop {
            let scan_id = tokio::select! {
                _ = cancel.cancelled() => return,
                received = self.rx.recv() => match received {
                    Ok(scan_id) => scan_id,
                    Err(_) => return,
                },
            };
            process_one(cancel, store, scan_id, options).await;
        }
    }

    /// One-shot consumer: process whatever is queued right now, then return.
    /// Used by the CLI, which enqueues its scans and drains the queue in the
    /// same invocation.
    pub async fn run_until_drained(
        &self,
        cancel: &CancelToken,
        store: &Store,
        options: &OrchestratorOptions,
    ) {
        while !cancel.is_cancelled() {
            match self.rx.try_recv() {
                Ok(scan_id) => process_one(cancel, store, scan_id, options).await,
                Err(_) => return,
            }
        }
    }
}

/// Run one queued scan, isolating panics so a poisoned scan cannot take the
/// consumer down with it.
async fn process_one(cancel: &CancelToken, store: &Store, scan_id: i64, options: &OrchestratorOptions) {
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        let store = store.clone();
        let options = options.clone();
        async move { run_one_scan(&cancel, &store, scan_id, &options).await }
    });
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::error!(scan = scan_id, error = ?err, "scan failed");
        }
        Err(join_error) => {
            tracing::error!(scan = scan_id, error = %join_error, "scan panicked");
        }
    }
}

/// The per-scan sequence: skip when fully complete, finish the walk if it
/// never completed, then run the hash phase.
async fn run_one_scan(
    cancel: &CancelToken,
    store: &Store,
    scan_id: i64,
    options: &OrchestratorOptions,
) -> Result<()> {
    let scan = store.get_scan(scan_id).await.or_raise(|| ErrorKind::Store)?;
    if scan.is_complete() {
        tracing::info!(scan = scan_id, "scan already complete, skipping");
        return Ok(());
    }
    if scan.completed_at.is_none() {
        let scan_options = ScanOptions {
            exclude_patterns: patterns_for_root(Path::new(&scan.root_path)).await?,
            max_files_per_second: options.max_files_per_second,
            pipeline: options.pipeline.clone(),
        };
        run_scan_for_existing(cancel, store, &scan, &scan_options).await?;
    }
    run_hash_phase(cancel, store, scan_id, &options.hash).await
}
