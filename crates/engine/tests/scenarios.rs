//! End-to-end scan + hash scenarios over a real filesystem tree and a
//! file-backed database.

use ditto_engine::cancel::CancelSource;
use ditto_engine::error::ErrorKind;
use ditto_engine::hash::{run_hash_phase, DispatchMode, HashOptions};
use ditto_engine::scan::{run_scan, PipelineConfig, ScanOptions};
use ditto_store::{BusyRetries, Database, HashStatus, Scan, Store};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::time::Duration;

fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

async fn open_store(dir: &Path) -> Store {
    let db = Database::connect_path(dir.join("ditto.db")).await.unwrap();
    Store::from(&db)
}

fn scan_options() -> ScanOptions {
    ScanOptions { pipeline: PipelineConfig::default(), ..ScanOptions::default() }
}

async fn scan_folder(store: &Store, root: &Path) -> i64 {
    let source = CancelSource::new();
    run_scan(&source.token(), store, root, &scan_options()).await.unwrap()
}

async fn hash_scan(store: &Store, scan_id: i64, mode: DispatchMode) -> Scan {
    let source = CancelSource::new();
    let options = HashOptions { workers: 3, max_hashes_per_second: 0, mode };
    run_hash_phase(&source.token(), store, scan_id, &options).await.unwrap();
    store.get_scan(scan_id).await.unwrap()
}

#[tokio::test]
async fn test_intra_folder_duplicate() {
    for mode in [DispatchMode::Stream, DispatchMode::Claim] {
        let state = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a"), b"aaaaa").unwrap();
        fs::write(root.path().join("b"), b"aaaaa").unwrap();

        let store = open_store(state.path()).await;
        let scan_id = scan_folder(&store, root.path()).await;
        let scan = hash_scan(&store, scan_id, mode).await;

        assert_eq!(scan.file_count, Some(2));
        assert_eq!(scan.hashed_file_count, Some(2));
        assert_eq!(scan.hash_error_count, Some(0));

        let files = store.files_by_scan(scan_id).await.unwrap();
        assert_eq!(files.len(), 2);
        let expected = sha256_hex(b"aaaaa");
        for file in &files {
            assert_eq!(file.hash_status, HashStatus::Done);
            assert_eq!(file.hash.as_deref(), Some(expected.as_str()));
        }

        let groups = store.duplicate_groups_by_hash(scan_id, 0, 0).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].hash, expected);
    }
}

#[tokio::test]
async fn test_unique_sizes_stay_pending() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("a"), vec![b'x'; 10]).unwrap();
    fs::write(root.path().join("b"), vec![b'y'; 20]).unwrap();

    let store = open_store(state.path()).await;
    let scan_id = scan_folder(&store, root.path()).await;
    let scan = hash_scan(&store, scan_id, DispatchMode::Stream).await;

    assert_eq!(scan.hashed_file_count, Some(0));
    let files = store.files_by_scan(scan_id).await.unwrap();
    assert!(files.iter().all(|f| f.hash_status == HashStatus::Pending && f.hash.is_none()));
    assert!(store.duplicate_groups_by_hash(scan_id, 0, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cross_folder_duplicate_of_unique_size_files() {
    let state = tempfile::tempdir().unwrap();
    let first_root = tempfile::tempdir().unwrap();
    let second_root = tempfile::tempdir().unwrap();
    let content = vec![b'z'; 1000];
    fs::write(first_root.path().join("only"), &content).unwrap();
    fs::write(second_root.path().join("twin"), &content).unwrap();

    let store = open_store(state.path()).await;
    // Scan both roots first, then hash both scans: each file is size-unique
    // within its own folder and only becomes a candidate through the other
    // scan's ledger.
    let first_scan = scan_folder(&store, first_root.path()).await;
    let second_scan = scan_folder(&store, second_root.path()).await;
    hash_scan(&store, first_scan, DispatchMode::Stream).await;
    hash_scan(&store, second_scan, DispatchMode::Stream).await;

    let expected = sha256_hex(&content);
    for scan_id in [first_scan, second_scan] {
        let files = store.files_by_scan(scan_id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].hash_status, HashStatus::Done);
        assert_eq!(files[0].hash.as_deref(), Some(expected.as_str()));
    }

    let scans = [first_scan, second_scan];
    let groups = store.duplicate_groups_by_hash_across_scans(&scans, 0, 0).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].count, 2);
    let members = store.files_in_hash_group_across_scans(&scans, &expected, 0).await.unwrap();
    assert_eq!(members.len(), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_hardlink_digest_is_reused() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("a"), b"linked content").unwrap();
    fs::hard_link(root.path().join("a"), root.path().join("b")).unwrap();

    let store = open_store(state.path()).await;
    let scan_id = scan_folder(&store, root.path()).await;
    // One worker so the second path deterministically sees the first one's
    // digest instead of racing it to the file.
    let source = CancelSource::new();
    let options = HashOptions { workers: 1, max_hashes_per_second: 0, mode: DispatchMode::Stream };
    run_hash_phase(&source.token(), &store, scan_id, &options).await.unwrap();
    let scan = store.get_scan(scan_id).await.unwrap();

    assert_eq!(scan.hash_reused_count, Some(1));
    let files = store.files_by_scan(scan_id).await.unwrap();
    assert_eq!(files.len(), 2);
    let expected = sha256_hex(b"linked content");
    for file in &files {
        assert_eq!(file.hash_status, HashStatus::Done);
        assert_eq!(file.hash.as_deref(), Some(expected.as_str()));
    }

    let inode_groups = store.duplicate_groups_by_inode(scan_id).await.unwrap();
    assert_eq!(inode_groups.len(), 1);
    assert_eq!(inode_groups[0].count, 2);
}

#[tokio::test]
async fn test_exclusion_skips_subtree() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("keep.txt"), b"keep").unwrap();
    fs::create_dir_all(root.path().join("skip/nested")).unwrap();
    fs::write(root.path().join("skip/nested/hidden.txt"), b"hidden").unwrap();

    let store = open_store(state.path()).await;
    let source = CancelSource::new();
    let options = ScanOptions {
        exclude_patterns: vec!["skip".to_string()],
        ..scan_options()
    };
    let scan_id = run_scan(&source.token(), &store, root.path(), &options).await.unwrap();

    let scan = store.get_scan(scan_id).await.unwrap();
    assert_eq!(scan.file_count, Some(1));
    assert!(scan.scan_skipped_count.unwrap_or(0) >= 1);
    let files = store.files_by_scan(scan_id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].path.ends_with("keep.txt"));
}

#[tokio::test]
async fn test_per_root_ignore_file_is_honored() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join(".dittoignore"), "# local rules\n*.bak\n").unwrap();
    fs::write(root.path().join("data.txt"), b"data").unwrap();
    fs::write(root.path().join("data.bak"), b"data").unwrap();

    let store = open_store(state.path()).await;
    let source = CancelSource::new();
    let options = ScanOptions {
        exclude_patterns: ditto_engine::scan::patterns_for_root(root.path()).await.unwrap(),
        ..scan_options()
    };
    let scan_id = run_scan(&source.token(), &store, root.path(), &options).await.unwrap();
    let files = store.files_by_scan(scan_id).await.unwrap();
    // The ignore file itself is dotfile-visible and not excluded by default;
    // only *.bak is filtered by the root rules.
    assert!(files.iter().all(|f| !f.path.ends_with(".bak")));
    assert!(files.iter().any(|f| f.path.ends_with("data.txt")));
}

#[tokio::test]
async fn test_rescan_is_idempotent_and_reuses_digests() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("a"), b"stable").unwrap();
    fs::write(root.path().join("b"), b"stable").unwrap();

    let store = open_store(state.path()).await;
    let first_scan = scan_folder(&store, root.path()).await;
    let first = hash_scan(&store, first_scan, DispatchMode::Stream).await;
    assert_eq!(first.hashed_file_count, Some(2));

    let second_scan = scan_folder(&store, root.path()).await;
    let second = hash_scan(&store, second_scan, DispatchMode::Stream).await;

    // Same file rows, two ledger rows each, and the second phase reused the
    // inode digests instead of rereading the files.
    let first_files = store.files_by_scan(first_scan).await.unwrap();
    let second_files = store.files_by_scan(second_scan).await.unwrap();
    assert_eq!(first_files.len(), 2);
    assert_eq!(
        first_files.iter().map(|f| f.id).collect::<Vec<_>>(),
        second_files.iter().map(|f| f.id).collect::<Vec<_>>()
    );
    assert_eq!(second.hashed_file_count, Some(2));
    assert_eq!(second.hash_reused_count, Some(0), "already done, nothing redispatched");
    assert!(second_files.iter().all(|f| f.hash_status == HashStatus::Done));
}

#[tokio::test]
async fn test_crash_recovery_resets_hashing_rows() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    for i in 0..4 {
        fs::write(root.path().join(format!("f{i}")), format!("content-{i:04}")).unwrap();
    }

    let store = open_store(state.path()).await;
    let scan_id = scan_folder(&store, root.path()).await;

    // Simulate a crash mid-phase: two rows claimed, never finished.
    let retries = BusyRetries::default();
    store.claim_next_hash_job(scan_id, &retries).await.unwrap().unwrap();
    store.claim_next_hash_job(scan_id, &retries).await.unwrap().unwrap();

    let scan = hash_scan(&store, scan_id, DispatchMode::Stream).await;
    assert_eq!(scan.hashed_file_count, Some(4));
    let files = store.files_by_scan(scan_id).await.unwrap();
    for file in &files {
        assert_eq!(file.hash_status, HashStatus::Done);
        let name = Path::new(&file.path).file_name().unwrap().to_string_lossy().into_owned();
        let index: usize = name.trim_start_matches('f').parse().unwrap();
        assert_eq!(file.hash.as_deref(), Some(sha256_hex(format!("content-{index:04}").as_bytes()).as_str()));
    }
}

#[tokio::test]
async fn test_cancel_then_resume_completes_all_files() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    for i in 0..10 {
        fs::write(root.path().join(format!("f{i}")), format!("payload-{i:05}")).unwrap();
    }

    let store = open_store(state.path()).await;
    let scan_id = scan_folder(&store, root.path()).await;

    // Throttle hard so cancellation lands mid-phase.
    let source = CancelSource::new();
    let token = source.token();
    let slow = HashOptions { workers: 2, max_hashes_per_second: 5, mode: DispatchMode::Claim };
    let phase = {
        let store = store.clone();
        tokio::spawn(async move { run_hash_phase(&token, &store, scan_id, &slow).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    source.cancel();
    let result = phase.await.unwrap();
    if let Err(err) = &result {
        assert!(matches!(&**err, ErrorKind::Cancelled));
    }
    let interrupted = store.get_scan(scan_id).await.unwrap();
    if result.is_err() {
        assert!(interrupted.hash_completed_at.is_none());
    }

    // Resume: every file reaches done with the right digest.
    let scan = hash_scan(&store, scan_id, DispatchMode::Stream).await;
    assert_eq!(scan.hashed_file_count, Some(10));
    assert_eq!(scan.hash_error_count, Some(0));
    let files = store.files_by_scan(scan_id).await.unwrap();
    for file in &files {
        assert_eq!(file.hash_status, HashStatus::Done);
        let name = Path::new(&file.path).file_name().unwrap().to_string_lossy().into_owned();
        let index: usize = name.trim_start_matches('f').parse().unwrap();
        assert_eq!(
            file.hash.as_deref(),
            Some(sha256_hex(format!("payload-{index:05}").as_bytes()).as_str())
        );
    }
}

#[tokio::test]
async fn test_unreadable_file_counts_as_error_and_stays_pending() {
    let state = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("a"), b"same size!").unwrap();
    fs::write(root.path().join("b"), b"same size2").unwrap();

    let store = open_store(state.path()).await;
    let scan_id = scan_folder(&store, root.path()).await;
    // Remove one file after the walk so hashing it fails.
    fs::remove_file(root.path().join("b")).unwrap();

    let scan = hash_scan(&store, scan_id, DispatchMode::Stream).await;
    assert_eq!(scan.hashed_file_count, Some(1));
    assert_eq!(scan.hash_error_count, Some(1));
    let files = store.files_by_scan(scan_id).await.unwrap();
    let statuses: Vec<_> = files.iter().map(|f| f.hash_status).collect();
    assert!(statuses.contains(&HashStatus::Done));
    assert!(statuses.contains(&HashStatus::Pending));
}
