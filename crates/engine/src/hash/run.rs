//! The hash phase: dispatch candidates to a worker pool, reuse digests where
//! the inode already has one, stream-hash the rest.

use crate::cancel::CancelToken;
use crate::error::{ErrorKind, Result};
use crate::hash::digest;
use crate::throttle::Throttle;
use ditto_store::{BusyRetries, File, Store};
use exn::ResultExt;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::UtcDateTime;

const JOB_CHANNEL_CAPACITY: usize = 1000;
const PROGRESS_LOG_INTERVAL: i64 = 50;

/// How candidates reach the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One producer streams the pending set from a single query into a
    /// bounded channel. No per-row contention; fastest for a one-shot phase.
    Stream,
    /// Each worker atomically claims rows one at a time. Slower, but safe
    /// when the candidate set can grow while the phase runs (or when
    /// several phases share a scan).
    Claim,
}

/// Configuration for one hash phase.
#[derive(Debug, Clone)]
pub struct HashOptions {
    pub workers: usize,
    /// Shared across all workers; 0 means unlimited.
    pub max_hashes_per_second: u32,
    pub mode: DispatchMode,
}

impl Default for HashOptions {
    fn default() -> Self {
        Self { workers: 1, max_hashes_per_second: 0, mode: DispatchMode::Stream }
    }
}

#[derive(Debug, Default)]
struct PhaseCounters {
    completed: AtomicI64,
    reused: AtomicI64,
    errors: AtomicI64,
}

enum JobOutcome {
    Hashed,
    Reused,
    Cancelled,
}

/// Everything a worker needs besides the job itself.
struct WorkerContext {
    cancel: CancelToken,
    store: Store,
    root: PathBuf,
    counters: Arc<PhaseCounters>,
    throttle: Arc<Option<Throttle>>,
    total: i64,
    phase_start: Instant,
    hashed_at: UtcDateTime,
}

/// Run the hash phase for a scan: recover orphaned `hashing` rows, mark the
/// phase started, work through the candidate set, then record completion
/// counts.
///
/// Per-file failures are counted and the file is returned to the queue; they
/// never fail the phase. Cancellation returns [`ErrorKind::Cancelled`]
/// without touching `hash_completed_at`; rows left in `hashing` are reset by
/// the next run.
pub async fn run_hash_phase(
    cancel: &CancelToken,
    store: &Store,
    scan_id: i64,
    options: &HashOptions,
) -> Result<()> {
    store.reset_hash_status_hashing_to_pending(scan_id).await.or_raise(|| ErrorKind::Store)?;
    store.update_scan_hash_started_at(scan_id).await.or_raise(|| ErrorKind::Store)?;

    let scan = store.get_scan(scan_id).await.or_raise(|| ErrorKind::Store)?;
    // Best-effort count for progress logging only.
    let total = store.count_hash_candidates(scan_id).await.unwrap_or(0);
    let workers = options.workers.max(1);
    tracing::info!(scan = scan_id, workers, candidates = total, mode = ?options.mode, "hash phase started");

    let counters = Arc::new(PhaseCounters::default());
    let retries = Arc::new(BusyRetries::default());
    let context = Arc::new(WorkerContext {
        cancel: cancel.clone(),
        store: store.clone(),
        root: PathBuf::from(&scan.root_path),
        counters: Arc::clone(&counters),
        throttle: Arc::new(Throttle::new(options.max_hashes_per_second)),
        total,
        phase_start: Instant::now(),
        hashed_at: UtcDateTime::now(), // one timestamp for the whole phase
    });

    let phase_result = match options.mode {
        DispatchMode::Stream => run_stream_phase(&context, scan_id, workers).await,
        DispatchMode::Claim => run_claim_phase(&context, scan_id, workers, &retries).await,
    };
    if let Err(err) = phase_result {
        tracing::warn!(scan = scan_id, error = ?err, "hash phase failed");
        return Err(err);
    }
    if cancel.is_cancelled() {
        exn::bail!(ErrorKind::Cancelled);
    }

    // Failed claims are parked in `hashing` until here so the claim loop
    // doesn't immediately hand them back out; return them to the queue.
    store.reset_hash_status_hashing_to_pending(scan_id).await.or_raise(|| ErrorKind::Store)?;

    let (hashed_files, hashed_bytes) =
        store.hashed_file_count_and_bytes(scan_id).await.or_raise(|| ErrorKind::Store)?;
    let reused = counters.reused.load(Ordering::Relaxed);
    let errors = counters.errors.load(Ordering::Relaxed);
    tracing::info!(
        scan = scan_id,
        files = hashed_files,
        bytes = hashed_bytes,
        reused,
        errors,
        busy_retries = retries.count(),
        "hash phase completed"
    );
    store
        .update_scan_hash_completed_at(scan_id, hashed_files, hashed_bytes, reused, errors)
        .await
        .or_raise(|| ErrorKind::Store)
}

/// Producer-consumer dispatch. Worker-level per-file errors are counted, not
/// propagated; only a producer failure fails the phase.
async fn run_stream_phase(context: &Arc<WorkerContext>, scan_id: i64, workers: usize) -> Result<()> {
    let (jobs_tx, jobs_rx) = async_channel::bounded::<File>(JOB_CHANNEL_CAPACITY);

    let producer = tokio::spawn({
        let cancel = context.cancel.clone();
        let store = context.store.clone();
        async move {
            // jobs_tx is owned here: when this task ends the channel closes
            // and the workers drain out.
            let mut jobs = store.pending_hash_jobs(scan_id);
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    next = jobs.next() => next,
                };
                match next {
                    Some(Ok(job)) => {
                        if jobs_tx.send(job).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                }
            }
        }
    });

    let mut worker_handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let context = Arc::clone(context);
        let jobs_rx = jobs_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = context.cancel.cancelled() => return,
                    job = jobs_rx.recv() => match job {
                        Ok(job) => job,
                        Err(_) => return, // channel closed and drained
                    },
                };
                match process_job(&context, &job).await {
                    Ok(JobOutcome::Cancelled) => return,
                    Ok(outcome) => record_outcome(&context, outcome),
                    Err(err) => {
                        context.counters.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(file = %job.path, error = ?err, "hash failed; file returned to queue");
                        // Never claimed in this mode, so normally a no-op;
                        // kept so an error can't leave a file stuck.
                        let _ = context.store.reset_file_hash_status_to_pending(job.id).await;
                    }
                }
            }
        }));
    }
    drop(jobs_rx);

    for handle in worker_handles {
        let _ = handle.await;
    }
    match producer.await {
        Ok(result) => result.or_raise(|| ErrorKind::Store),
        Err(join_error) => {
            tracing::error!(error = %join_error, "hash producer panicked");
            exn::bail!(ErrorKind::Store);
        }
    }
}

/// Claim-loop dispatch. A claim failure (retry budget exhausted, bad scan)
/// fails the phase; per-file hash errors do not.
async fn run_claim_phase(
    context: &Arc<WorkerContext>,
    scan_id: i64,
    workers: usize,
    retries: &Arc<BusyRetries>,
) -> Result<()> {
    let mut worker_handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let context = Arc::clone(context);
        let retries = Arc::clone(retries);
        worker_handles.push(tokio::spawn(async move {
            loop {
                if context.cancel.is_cancelled() {
                    return Ok(());
                }
                let job = match context.store.claim_next_hash_job(scan_id, &retries).await {
                    Ok(Some(job)) => job,
                    Ok(None) => return Ok(()),
                    Err(err) => return Err(err),
                };
                match process_job(&context, &job).await {
                    Ok(JobOutcome::Cancelled) => return Ok(()),
                    Ok(outcome) => record_outcome(&context, outcome),
                    Err(err) => {
                        context.counters.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(file = %job.path, error = ?err, "hash failed; file parked until end of phase");
                        // Left in `hashing` deliberately: resetting now would
                        // hand the same failing file straight back to this
                        // loop. The end-of-phase sweep returns it to pending.
                    }
                }
            }
        }));
    }

    let mut result = Ok(());
    let mut panicked = false;
    for handle in worker_handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if result.is_ok() {
                    result = Err(err).or_raise(|| ErrorKind::Store);
                }
            }
            Err(join_error) => {
                tracing::error!(error = %join_error, "hash worker panicked");
                panicked = true;
            }
        }
    }
    if panicked && result.is_ok() {
        exn::bail!(ErrorKind::Store);
    }
    result
}

fn record_outcome(context: &WorkerContext, outcome: JobOutcome) {
    if matches!(outcome, JobOutcome::Reused) {
        context.counters.reused.fetch_add(1, Ordering::Relaxed);
    }
    log_progress(&context.counters, context.total, context.phase_start);
}

/// Hash one candidate: inode reuse first, previous-scan reuse second, and
/// only then an actual read of the file.
async fn process_job(context: &WorkerContext, job: &File) -> Result<JobOutcome> {
    let WorkerContext { cancel, store, root, throttle, hashed_at, .. } = context;
    // Hardlink within the same scan: same inode, digest already known.
    if let Some(found) = store
        .hash_for_inode(job.scan_id, job.inode, job.device_id)
        .await
        .or_raise(|| ErrorKind::Store)?
    {
        tracing::debug!(file = %job.path, "digest reused (hardlink)");
        store.update_file_hash(job.id, &found, *hashed_at).await.or_raise(|| ErrorKind::Store)?;
        return Ok(JobOutcome::Reused);
    }
    // Unchanged since an earlier scan: same inode, device, and size.
    if let Some(found) = store
        .hash_for_inode_any_scan(job.inode, job.device_id, job.size)
        .await
        .or_raise(|| ErrorKind::Store)?
    {
        tracing::debug!(file = %job.path, "digest reused (unchanged)");
        store.update_file_hash(job.id, &found, *hashed_at).await.or_raise(|| ErrorKind::Store)?;
        return Ok(JobOutcome::Reused);
    }
    if let Some(throttle) = throttle.as_ref() {
        tokio::select! {
            _ = throttle.acquire() => {}
            _ = cancel.cancelled() => return Ok(JobOutcome::Cancelled),
        }
    }
    let absolute = root.join(&job.path);
    tracing::debug!(file = %absolute.display(), bytes = job.size, "hashing");
    let found = digest::hash_file(&absolute)
        .await
        .or_raise(|| ErrorKind::HashFile(absolute.clone()))?;
    store.update_file_hash(job.id, &found, *hashed_at).await.or_raise(|| ErrorKind::Store)?;
    Ok(JobOutcome::Hashed)
}

fn log_progress(counters: &PhaseCounters, total: i64, phase_start: Instant) {
    let n = counters.completed.fetch_add(1, Ordering::Relaxed) + 1;
    if total <= 0 || (n % PROGRESS_LOG_INTERVAL != 0 && n != total) {
        return;
    }
    // Reuse can push n past the best-effort candidate count; clamp so we
    // never report more than 100%.
    let done = n.min(total);
    let pct = 100.0 * done as f64 / total as f64;
    let elapsed = phase_start.elapsed().as_secs_f64();
    if done >= total {
        tracing::info!(
            files = done,
            total,
            pct = format_args!("{pct:.1}"),
            elapsed_s = format_args!("{elapsed:.0}"),
            "hash progress"
        );
        return;
    }
    let rate = done as f64 / elapsed.max(0.001);
    let remaining_s = ((total - done) as f64 / rate.max(0.001)).max(0.0);
    tracing::info!(
        files = done,
        total,
        pct = format_args!("{pct:.1}"),
        elapsed_s = format_args!("{elapsed:.0}"),
        remaining_s = format_args!("{remaining_s:.0}"),
        "hash progress"
    );
}
