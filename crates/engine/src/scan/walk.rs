//! Directory traversal: list directories, emit regular-file metadata.
//!
//! Symlinks are never followed and never yielded; metadata comes from
//! non-following stat calls. Unreadable subtrees are skipped and counted,
//! not fatal. There is deliberately no per-directory timeout: a blocked
//! directory-list syscall (FUSE mounts, cloud providers) cannot be preempted
//! from inside the process, and pretending otherwise just reports a stuck
//! scan as healthy. The defenses are the exclusion patterns and, when
//! needed, a per-root ignore file.

use crate::cancel::CancelToken;
use crate::error::{ErrorKind, Result};
use crate::scan::exclude::ExcludeSet;
use crate::throttle::Throttle;
use exn::ResultExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

/// Env var enabling per-directory logging to find hang locations. When the
/// scan hangs, the last "listing directory" line names the path to add to
/// the ignore file.
pub const DEBUG_SCAN_ENV: &str = "DITTO_DEBUG_SCAN";

/// Metadata for a single regular file (no content).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Absolute path.
    pub path: PathBuf,
    pub size: i64,
    /// Modification time as unix seconds.
    pub mtime: i64,
    pub inode: i64,
    /// `None` when the OS does not provide a device id.
    pub device_id: Option<i64>,
}

/// Counters shared between walkers and their caller.
#[derive(Debug, Default)]
pub struct ScanStats {
    /// Paths skipped during the walk (permission errors or exclusions).
    pub skipped: AtomicI64,
}

impl ScanStats {
    pub fn skipped(&self) -> i64 {
        self.skipped.load(Ordering::Relaxed)
    }

    fn skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }
}

/// One listed directory: subdirectories to recurse into and the regular
/// files found, exclusions already applied.
#[derive(Debug, Default)]
pub(crate) struct DirListing {
    pub(crate) subdirs: Vec<PathBuf>,
    pub(crate) files: Vec<Entry>,
}

pub(crate) fn debug_scan() -> bool {
    std::env::var(DEBUG_SCAN_ENV).is_ok_and(|v| !v.is_empty())
}

fn is_permission_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
}

#[cfg(unix)]
fn inode_and_device(meta: &std::fs::Metadata) -> (i64, Option<i64>) {
    use std::os::unix::fs::MetadataExt;
    let inode = i64::try_from(meta.ino()).unwrap_or(0);
    let device = i64::try_from(meta.dev()).unwrap_or(0);
    (inode, (device != 0).then_some(device))
}

#[cfg(not(unix))]
fn inode_and_device(_meta: &std::fs::Metadata) -> (i64, Option<i64>) {
    (0, None)
}

/// List one directory, applying exclusions. Returns `None` when the
/// directory itself is unreadable (skip-dir: counted, logged, not fatal).
/// Errors on individual entries skip that entry the same way.
pub(crate) async fn list_dir(dir: &Path, excludes: &ExcludeSet, stats: &ScanStats) -> io::Result<Option<DirListing>> {
    if debug_scan() {
        tracing::info!(path = %dir.display(), "listing directory");
    }
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(err) if is_permission_error(&err) => {
            stats.skip();
            tracing::warn!(path = %dir.display(), error = %err, "skipped (permission)");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    let mut listing = DirListing::default();
    while let Some(entry) = reader.next_entry().await? {
        let path = entry.path();
        if excludes.matches(&path) {
            stats.skip();
            continue;
        }
        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            Err(err) if is_permission_error(&err) => {
                stats.skip();
                tracing::warn!(path = %path.display(), error = %err, "skipped (permission)");
                continue;
            }
            Err(err) => return Err(err),
        };
        if file_type.is_dir() {
            listing.subdirs.push(path);
            continue;
        }
        if file_type.is_symlink() || !file_type.is_file() {
            // Symlinks are never followed; sockets, devices, and FIFOs are
            // not content.
            continue;
        }
        // Non-following stat so a racing symlink swap still can't lead
        // anywhere.
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if is_permission_error(&err) => {
                stats.skip();
                tracing::warn!(path = %path.display(), error = %err, "skipped (permission)");
                continue;
            }
            Err(err) => return Err(err),
        };
        if !meta.file_type().is_file() {
            continue;
        }
        let (inode, device_id) = inode_and_device(&meta);
        listing.files.push(Entry {
            path,
            size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
            mtime: mtime_seconds(&meta),
            inode,
            device_id,
        });
    }
    Ok(Some(listing))
}

#[cfg(unix)]
fn mtime_seconds(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime()
}

#[cfg(not(unix))]
fn mtime_seconds(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Walk `root` depth-first and call `visit` for each regular file, applying
/// `excludes` and the optional files-per-second throttle. Directories that
/// cannot be read are skipped and counted on `stats`.
///
/// This is the single-walker entry point; the scan pipeline runs the same
/// per-directory listing from a worker pool instead.
pub async fn walk<F>(
    cancel: &CancelToken,
    root: &Path,
    excludes: &ExcludeSet,
    throttle: Option<&Throttle>,
    stats: &ScanStats,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(Entry) -> Result<()>,
{
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        if cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let listing = match list_dir(&dir, excludes, stats).await {
            Ok(Some(listing)) => listing,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(path = %dir.display(), error = %err, "walk error");
                return Err(err).or_raise(|| ErrorKind::Walk(dir.clone()));
            }
        };
        pending.extend(listing.subdirs);
        for entry in listing.files {
            if let Some(throttle) = throttle {
                tokio::select! {
                    _ = throttle.acquire() => {}
                    _ = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
                }
            }
            visit(entry)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use std::fs;

    async fn collect(root: &Path, excludes: ExcludeSet) -> (Vec<Entry>, i64) {
        let source = CancelSource::new();
        let stats = ScanStats::default();
        let mut entries = Vec::new();
        walk(&source.token(), root, &excludes, None, &stats, |entry| {
            entries.push(entry);
            Ok(())
        })
        .await
        .unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        (entries, stats.skipped())
    }

    #[tokio::test]
    async fn test_walk_yields_regular_files_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"hi").unwrap();

        let (entries, skipped) = collect(dir.path(), ExcludeSet::default()).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(skipped, 0);
        assert_eq!(entries[0].path, dir.path().join("a.txt"));
        assert_eq!(entries[0].size, 5);
        assert!(entries[0].mtime > 0);
        #[cfg(unix)]
        {
            assert!(entries[0].inode > 0);
            assert!(entries[0].device_id.is_some());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_never_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), b"outside").unwrap();
        fs::write(dir.path().join("real.txt"), b"inside").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link-dir")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link-file"))
            .unwrap();

        let (entries, _) = collect(dir.path(), ExcludeSet::default()).await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].path.ends_with("real.txt"));
    }

    #[tokio::test]
    async fn test_walk_skips_excluded_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), b"keep").unwrap();
        fs::create_dir_all(dir.path().join("skip/nested")).unwrap();
        fs::write(dir.path().join("skip/nested/hidden.txt"), b"hidden").unwrap();

        let (entries, skipped) = collect(dir.path(), ExcludeSet::compile(["skip"])).await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].path.ends_with("keep.txt"));
        assert!(skipped >= 1);
    }

    #[tokio::test]
    async fn test_walk_honors_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let source = CancelSource::new();
        source.cancel();
        let stats = ScanStats::default();
        let err = walk(&source.token(), dir.path(), &ExcludeSet::default(), None, &stats, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Cancelled));
    }
}
