//! Scan entry points: create or continue a scan, run the pipeline, and
//! finalise the scan row.

use crate::cancel::CancelToken;
use crate::error::{ErrorKind, Result};
use crate::scan::exclude::{self, ExcludeSet};
use crate::scan::pipeline::{run_pipeline, PipelineConfig};
use ditto_store::{Scan, Store};
use exn::ResultExt;
use std::path::Path;

/// Configuration for one scan run.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Exclusion patterns; defaults to the embedded default list.
    pub exclude_patterns: Vec<String>,
    /// Walker throttle; 0 means full speed.
    pub max_files_per_second: u32,
    pub pipeline: PipelineConfig,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            exclude_patterns: ExcludeSet::default_patterns(),
            max_files_per_second: 0,
            pipeline: PipelineConfig::from_env(),
        }
    }
}

/// Options for scanning `root`: the default exclusions merged with the
/// root's own ignore file, if present.
pub async fn options_for_root(root: &Path) -> Result<ScanOptions> {
    Ok(ScanOptions {
        exclude_patterns: exclude::patterns_for_root(root).await?,
        ..ScanOptions::default()
    })
}

async fn ensure_directory(root: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(root).await.or_raise(|| ErrorKind::Walk(root.to_path_buf()))?;
    if !meta.is_dir() {
        exn::bail!(ErrorKind::NotADirectory(root.to_path_buf()));
    }
    Ok(())
}

/// Walk `root`, creating the folder row if needed and a fresh scan row, then
/// upsert files and ledger entries and set the scan's `completed_at`.
/// Returns the scan id.
pub async fn run_scan(
    cancel: &CancelToken,
    store: &Store,
    root: &Path,
    options: &ScanOptions,
) -> Result<i64> {
    ensure_directory(root).await?;
    let folder_id = store.get_or_create_folder_by_path(root).await.or_raise(|| ErrorKind::Store)?;
    let scan = store.create_scan(folder_id).await.or_raise(|| ErrorKind::Store)?;
    run_scan_for_existing(cancel, store, &scan, options).await?;
    Ok(scan.id)
}

/// Walk the scan's root and upsert files + ledger rows against the existing
/// scan row. Used when continuing a scan that never completed its walk.
pub async fn run_scan_for_existing(
    cancel: &CancelToken,
    store: &Store,
    scan: &Scan,
    options: &ScanOptions,
) -> Result<()> {
    let root = Path::new(&scan.root_path);
    ensure_directory(root).await?;
    tracing::info!(scan = scan.id, root = %root.display(), "scan started");
    let outcome = run_pipeline(
        cancel,
        store,
        scan.id,
        scan.folder_id,
        root,
        ExcludeSet::compile(&options.exclude_patterns),
        options.max_files_per_second,
        &options.pipeline,
    )
    .await?;
    store
        .update_scan_completed_at(scan.id, outcome.file_count, outcome.skipped)
        .await
        .or_raise(|| ErrorKind::Store)?;
    tracing::info!(
        scan = scan.id,
        files = outcome.file_count,
        skipped = outcome.skipped,
        "scan completed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use ditto_store::Database;
    use std::fs;

    #[tokio::test]
    async fn test_run_scan_creates_folder_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"aaaa").unwrap();
        fs::write(dir.path().join("b.txt"), b"bbbb").unwrap();

        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let source = CancelSource::new();
        let options = ScanOptions { pipeline: PipelineConfig::default(), ..ScanOptions::default() };
        let scan_id = store_scan(&source, &store, dir.path(), &options).await;

        let scan = store.get_scan(scan_id).await.unwrap();
        assert!(scan.completed_at.is_some());
        assert_eq!(scan.file_count, Some(2));
        assert_eq!(scan.scan_skipped_count, Some(0));
        assert_eq!(store.list_folders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_scan_rejects_files_as_roots() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, b"not a dir").unwrap();

        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let source = CancelSource::new();
        let err = run_scan(&source.token(), &store, &file, &ScanOptions::default()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_continue_fills_in_missing_walk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"aaaa").unwrap();

        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let folder_id = store.get_or_create_folder_by_path(dir.path()).await.unwrap();
        let scan = store.create_scan(folder_id).await.unwrap();
        assert!(scan.completed_at.is_none());

        let source = CancelSource::new();
        run_scan_for_existing(&source.token(), &store, &scan, &ScanOptions::default()).await.unwrap();
        let scan = store.get_scan(scan.id).await.unwrap();
        assert!(scan.completed_at.is_some());
        assert_eq!(scan.file_count, Some(1));
    }

    async fn store_scan(
        source: &CancelSource,
        store: &Store,
        root: &Path,
        options: &ScanOptions,
    ) -> i64 {
        run_scan(&source.token(), store, root, options).await.unwrap()
    }
}
