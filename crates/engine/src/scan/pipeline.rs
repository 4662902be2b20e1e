//! Parallel walk → batched upsert pipeline.
//!
//! A pool of walkers pops directories from an unbounded queue, lists them,
//! pushes subdirectories back, and emits file entries into a bounded channel.
//! A pool of writers drains that channel and flushes batches to the store.
//! The directory queue must be unbounded: walkers both push and pop it, so a
//! capacity there could deadlock the pool against itself. Backpressure
//! belongs on the file channel between walkers and writers instead.
//!
//! Completion handshake: each queued directory is owned by exactly one
//! walker; an outstanding-directory counter starts at one for the root and
//! the walker that finishes the last directory closes the queue. Walkers
//! then exit, the file channel is closed, and writers drain their residual
//! batches.

use crate::cancel::{CancelSource, CancelToken};
use crate::error::{ErrorKind, Result};
use crate::scan::exclude::ExcludeSet;
use crate::scan::walk::{list_dir, Entry, ScanStats};
use crate::throttle::Throttle;
use ditto_store::{NewFile, Store};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Enables pipeline heartbeat logging and stuck detection (`1`/`true`/`yes`).
pub const DEBUG_PIPELINE_ENV: &str = "DITTO_DEBUG_PIPELINE";

/// Env names for pipeline tuning (e.g. small NAS boxes). Unset = default.
pub const ENV_SCAN_WALKERS: &str = "DITTO_SCAN_WALKERS";
pub const ENV_SCAN_WRITERS: &str = "DITTO_SCAN_WRITERS";
pub const ENV_SCAN_BATCH_SIZE: &str = "DITTO_SCAN_BATCH_SIZE";
pub const ENV_SCAN_FILE_CHAN_CAP: &str = "DITTO_SCAN_FILE_CHAN_CAP";

const DEFAULT_WALKERS: usize = 4;
const DEFAULT_WRITERS: usize = 2;
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_FILE_CHANNEL_CAPACITY: usize = 1000;

const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_secs(2);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const WALK_LOG_INTERVAL: i64 = 1000;
const WRITE_LOG_INTERVAL: i64 = 5000;

/// Tuning knobs for the pipeline worker pools.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Tasks that list directories and emit files.
    pub walkers: usize,
    /// Tasks that batch entries and write to the store.
    pub writers: usize,
    /// Max entries per store batch.
    pub batch_size: usize,
    /// Capacity of the walker → writer channel (the backpressure point).
    pub file_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            walkers: DEFAULT_WALKERS,
            writers: DEFAULT_WRITERS,
            batch_size: DEFAULT_BATCH_SIZE,
            file_channel_capacity: DEFAULT_FILE_CHANNEL_CAPACITY,
        }
    }
}

fn env_positive(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse::<usize>().ok().filter(|n| *n > 0)
}

impl PipelineConfig {
    /// Defaults overridden by the `DITTO_SCAN_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_positive(ENV_SCAN_WALKERS) {
            config.walkers = n;
        }
        if let Some(n) = env_positive(ENV_SCAN_WRITERS) {
            config.writers = n;
        }
        if let Some(n) = env_positive(ENV_SCAN_BATCH_SIZE) {
            config.batch_size = n;
        }
        if let Some(n) = env_positive(ENV_SCAN_FILE_CHAN_CAP) {
            config.file_channel_capacity = n;
        }
        config
    }
}

fn debug_pipeline() -> bool {
    std::env::var(DEBUG_PIPELINE_ENV).is_ok_and(|v| v == "1" || v == "true" || v == "yes")
}

/// Live pipeline counters, shared across walkers, writers, and the progress
/// tasks.
#[derive(Debug)]
struct ScanMetrics {
    files_walked: AtomicI64,
    files_written: AtomicI64,
    dirs_processed: AtomicI64,
    file_queue_len: AtomicI64,
    started: Instant,
}

impl ScanMetrics {
    fn new() -> Self {
        Self {
            files_walked: AtomicI64::new(0),
            files_written: AtomicI64::new(0),
            dirs_processed: AtomicI64::new(0),
            file_queue_len: AtomicI64::new(0),
            started: Instant::now(),
        }
    }
}

/// Final counts from a completed pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOutcome {
    pub file_count: i64,
    pub skipped: i64,
}

/// Run the walk → write pipeline for one scan. On success the caller
/// finalises the scan row with [`Store::update_scan_completed_at`].
///
/// The first writer error (or cancellation) wins, but the pipeline only
/// returns after every writer has stopped. Writer panics are converted to
/// [`ErrorKind::WriterPanic`].
#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline(
    cancel: &CancelToken,
    store: &Store,
    scan_id: i64,
    folder_id: i64,
    folder_path: &Path,
    excludes: ExcludeSet,
    max_files_per_second: u32,
    config: &PipelineConfig,
) -> Result<PipelineOutcome> {
    let excludes = Arc::new(excludes);
    let stats = Arc::new(ScanStats::default());
    let metrics = Arc::new(ScanMetrics::new());
    let throttle = Arc::new(Throttle::new(max_files_per_second));

    let (dir_tx, dir_rx) = async_channel::unbounded::<PathBuf>();
    let (file_tx, file_rx) = async_channel::bounded::<Entry>(config.file_channel_capacity.max(1));
    let outstanding = Arc::new(AtomicI64::new(0));

    tracing::debug!(
        walkers = config.walkers,
        writers = config.writers,
        batch = config.batch_size,
        file_channel = config.file_channel_capacity,
        "pipeline starting"
    );

    // Bootstrap: the root is the first owned directory.
    outstanding.fetch_add(1, Ordering::SeqCst);
    dir_tx
        .send(folder_path.to_path_buf())
        .await
        .expect("fresh directory queue cannot be closed");

    // Internal stop signal for the periodic tasks; fired after writers join.
    let ticker_stop = CancelSource::new();
    let progress = tokio::spawn(progress_loop(
        ticker_stop.token(),
        cancel.clone(),
        store.clone(),
        scan_id,
        Arc::clone(&metrics),
    ));
    let heartbeat = debug_pipeline().then(|| {
        tokio::spawn(heartbeat_loop(
            ticker_stop.token(),
            Arc::clone(&metrics),
            Arc::clone(&stats),
            dir_rx.clone(),
        ))
    });

    let mut walker_handles = Vec::with_capacity(config.walkers.max(1));
    for _ in 0..config.walkers.max(1) {
        walker_handles.push(tokio::spawn(walker_loop(
            cancel.clone(),
            dir_tx.clone(),
            dir_rx.clone(),
            file_tx.clone(),
            Arc::clone(&excludes),
            Arc::clone(&throttle),
            Arc::clone(&outstanding),
            Arc::clone(&stats),
            Arc::clone(&metrics),
        )));
    }
    drop(dir_tx);

    let mut writer_handles = Vec::with_capacity(config.writers.max(1));
    for _ in 0..config.writers.max(1) {
        writer_handles.push(tokio::spawn(writer_loop(
            cancel.clone(),
            store.clone(),
            folder_id,
            scan_id,
            folder_path.to_path_buf(),
            file_rx.clone(),
            config.batch_size.max(1),
            Arc::clone(&metrics),
        )));
    }
    // Writers hold the only receiver clones from here on. If every writer
    // dies, the file channel closes behind them and blocked walkers fail
    // their sends instead of deadlocking the pipeline.
    drop(file_rx);

    // Closer: once every walker has exited (queue drained or cancelled),
    // close the file channel so writers flush their residual batches.
    let closer = tokio::spawn(async move {
        for handle in walker_handles {
            // Walkers log their own per-directory failures and cannot error
            // out.
            let _ = handle.await;
        }
        file_tx.close();
    });

    let mut writer_results = Vec::with_capacity(writer_handles.len());
    for handle in writer_handles {
        writer_results.push(handle.await);
    }
    let _ = closer.await;
    ticker_stop.cancel();
    let _ = progress.await;
    if let Some(handle) = heartbeat {
        let _ = handle.await;
    }

    let mut first_error = None;
    let mut panicked = false;
    for result in writer_results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(join_error) => {
                panicked = true;
                tracing::error!(error = %join_error, "scan writer panicked");
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    if panicked {
        exn::bail!(ErrorKind::WriterPanic);
    }
    if cancel.is_cancelled() {
        exn::bail!(ErrorKind::Cancelled);
    }

    let outcome = PipelineOutcome {
        file_count: metrics.files_written.load(Ordering::Relaxed),
        skipped: stats.skipped(),
    };
    tracing::info!(
        files = outcome.file_count,
        dirs = metrics.dirs_processed.load(Ordering::Relaxed),
        skipped = outcome.skipped,
        elapsed_s = format_args!("{:.2}", metrics.started.elapsed().as_secs_f64()),
        "pipeline complete"
    );
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn walker_loop(
    cancel: CancelToken,
    dir_tx: async_channel::Sender<PathBuf>,
    dir_rx: async_channel::Receiver<PathBuf>,
    file_tx: async_channel::Sender<Entry>,
    excludes: Arc<ExcludeSet>,
    throttle: Arc<Option<Throttle>>,
    outstanding: Arc<AtomicI64>,
    stats: Arc<ScanStats>,
    metrics: Arc<ScanMetrics>,
) {
    loop {
        let dir = tokio::select! {
            _ = cancel.cancelled() => return,
            dir = dir_rx.recv() => match dir {
                Ok(dir) => dir,
                Err(_) => return, // queue closed and drained
            },
        };
        if let Err(err) = process_one_dir(
            &cancel, &dir, &dir_tx, &file_tx, &excludes, &throttle, &outstanding, &stats, &metrics,
        )
        .await
        {
            tracing::warn!(path = %dir.display(), error = %err, "walker error");
        }
        metrics.dirs_processed.fetch_add(1, Ordering::Relaxed);
        if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            // That was the last outstanding directory anywhere.
            dir_rx.close();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_one_dir(
    cancel: &CancelToken,
    dir: &Path,
    dir_tx: &async_channel::Sender<PathBuf>,
    file_tx: &async_channel::Sender<Entry>,
    excludes: &ExcludeSet,
    throttle: &Option<Throttle>,
    outstanding: &AtomicI64,
    stats: &ScanStats,
    metrics: &ScanMetrics,
) -> std::io::Result<()> {
    let Some(listing) = list_dir(dir, excludes, stats).await? else {
        return Ok(());
    };
    for subdir in listing.subdirs {
        outstanding.fetch_add(1, Ordering::SeqCst);
        // Unbounded: never blocks on capacity. Fails only once the queue is
        // closed (cancellation), in which case the count is handed back.
        if dir_tx.send(subdir).await.is_err() {
            outstanding.fetch_sub(1, Ordering::SeqCst);
            return Ok(());
        }
    }
    for entry in listing.files {
        if let Some(throttle) = throttle {
            tokio::select! {
                _ = throttle.acquire() => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
        let path = entry.path.clone();
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sent = file_tx.send(entry) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
        metrics.file_queue_len.fetch_add(1, Ordering::Relaxed);
        let walked = metrics.files_walked.fetch_add(1, Ordering::Relaxed) + 1;
        if walked % WALK_LOG_INTERVAL == 0 {
            let elapsed = metrics.started.elapsed().as_secs_f64();
            tracing::info!(
                files = walked,
                rate = format_args!("{:.0}/s", walked as f64 / elapsed.max(0.001)),
                file_queue = metrics.file_queue_len.load(Ordering::Relaxed),
                current = %path.display(),
                "files discovered"
            );
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn writer_loop(
    cancel: CancelToken,
    store: Store,
    folder_id: i64,
    scan_id: i64,
    folder_path: PathBuf,
    file_rx: async_channel::Receiver<Entry>,
    batch_size: usize,
    metrics: Arc<ScanMetrics>,
) -> Result<()> {
    let mut batch: Vec<Entry> = Vec::with_capacity(batch_size);
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
            received = file_rx.recv() => received,
        };
        match received {
            Ok(entry) => {
                metrics.file_queue_len.fetch_sub(1, Ordering::Relaxed);
                batch.push(entry);
                if batch.len() >= batch_size {
                    flush(&store, folder_id, scan_id, &folder_path, &mut batch, &metrics).await?;
                }
            }
            Err(_) => {
                // Channel closed and drained: flush the residual batch.
                flush(&store, folder_id, scan_id, &folder_path, &mut batch, &metrics).await?;
                return Ok(());
            }
        }
    }
}

async fn flush(
    store: &Store,
    folder_id: i64,
    scan_id: i64,
    folder_path: &Path,
    batch: &mut Vec<Entry>,
    metrics: &ScanMetrics,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let rows: Vec<NewFile> = batch
        .drain(..)
        .map(|entry| {
            let path = entry
                .path
                .strip_prefix(folder_path)
                .map(|rel| rel.to_string_lossy().into_owned())
                .unwrap_or_else(|_| entry.path.to_string_lossy().into_owned());
            NewFile {
                path,
                size: entry.size,
                mtime: entry.mtime,
                inode: entry.inode,
                device_id: entry.device_id,
            }
        })
        .collect();
    let ids = store.upsert_files_batch(folder_id, &rows).await.or_raise(|| ErrorKind::Store)?;
    store.insert_file_scan_batch(&ids, scan_id).await.or_raise(|| ErrorKind::Store)?;

    let before = metrics.files_written.fetch_add(rows.len() as i64, Ordering::Relaxed);
    let written = before + rows.len() as i64;
    // Log when crossing a boundary so writer progress shows even while
    // walkers are blocked on a full channel.
    if written / WRITE_LOG_INTERVAL > before / WRITE_LOG_INTERVAL {
        tracing::info!(
            files = written,
            elapsed_s = format_args!("{:.1}", metrics.started.elapsed().as_secs_f64()),
            "files written"
        );
    }
    Ok(())
}

/// Writes the live file count onto the scan row so the UI shows progress.
async fn progress_loop(
    stop: CancelToken,
    cancel: CancelToken,
    store: Store,
    scan_id: i64,
    metrics: Arc<ScanMetrics>,
) {
    let mut ticker = tokio::time::interval(PROGRESS_UPDATE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // first tick is immediate; skip it
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let written = metrics.files_written.load(Ordering::Relaxed);
                if let Err(err) = store.update_scan_file_count_progress(scan_id, written).await {
                    tracing::warn!(error = ?err, "progress update failed");
                }
            }
        }
    }
}

/// Debug-only heartbeat: logs queue depths and counters, and warns when
/// nothing has moved for a few ticks.
async fn heartbeat_loop(
    stop: CancelToken,
    metrics: Arc<ScanMetrics>,
    stats: Arc<ScanStats>,
    dir_rx: async_channel::Receiver<PathBuf>,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut last = (0, 0, 0);
    let mut unchanged_ticks = 0;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let walked = metrics.files_walked.load(Ordering::Relaxed);
        let written = metrics.files_written.load(Ordering::Relaxed);
        let dirs = metrics.dirs_processed.load(Ordering::Relaxed);
        let dir_queue = dir_rx.len();
        let file_queue = metrics.file_queue_len.load(Ordering::Relaxed);
        tracing::info!(
            walked,
            written,
            dirs,
            dir_queue,
            file_queue,
            skipped = stats.skipped(),
            elapsed_s = format_args!("{:.1}", metrics.started.elapsed().as_secs_f64()),
            "pipeline heartbeat"
        );
        if (walked, written, dirs) == last {
            unchanged_ticks += 1;
            if unchanged_ticks >= 2 {
                tracing::warn!(
                    stuck_for_s = HEARTBEAT_INTERVAL.as_secs() * (unchanged_ticks + 1),
                    walked,
                    written,
                    dirs,
                    dir_queue,
                    file_queue,
                    "pipeline possibly stuck: no change across heartbeats"
                );
            }
        } else {
            unchanged_ticks = 0;
        }
        last = (walked, written, dirs);
    }
}
