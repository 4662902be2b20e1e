//! Exclusion patterns: an embedded always-on default list plus an optional
//! per-root ignore file.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use glob::Pattern;
use std::path::{Path, PathBuf};

/// Name of the per-root ignore file, looked up in the scan root itself.
pub const EXCLUDE_FILE_NAME: &str = ".dittoignore";

const DEFAULT_IGNORE: &str = include_str!("default.dittoignore");

/// A compiled set of exclusion patterns.
///
/// Two pattern kinds, distinguished by content:
/// - patterns containing `*` or `?` are globs matched against an entry's
///   **basename** (`*.tmp`, `cache-?`);
/// - anything else is a **path segment**: the entry is excluded when the
///   segment appears as a complete component of its path (`.git`,
///   `node_modules`).
///
/// Order does not matter; any match excludes.
#[derive(Debug, Default, Clone)]
pub struct ExcludeSet {
    globs: Vec<Pattern>,
    segments: Vec<String>,
}

impl ExcludeSet {
    /// Compile a pattern list. Patterns that fail to compile as globs are
    /// dropped with a warning rather than failing the scan.
    pub fn compile<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.contains(['*', '?']) {
                match Pattern::new(pattern) {
                    Ok(glob) => set.globs.push(glob),
                    Err(error) => {
                        tracing::warn!(pattern, %error, "ignoring malformed exclude glob");
                    }
                }
            } else {
                set.segments.push(pattern.to_string());
            }
        }
        set
    }

    /// The embedded default list, always applied when scanning.
    pub fn default_patterns() -> Vec<String> {
        parse_patterns(DEFAULT_IGNORE)
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty() && self.segments.is_empty()
    }

    /// Whether `path` should be excluded from the scan. Checked on files and
    /// directories alike; excluded directories are not recursed into.
    pub fn matches(&self, path: &Path) -> bool {
        if self.is_empty() {
            return false;
        }
        if let Some(base) = path.file_name().and_then(|name| name.to_str()) {
            if self.globs.iter().any(|glob| glob.matches(base)) {
                return true;
            }
        }
        if !self.segments.is_empty() {
            for component in path.components() {
                let Some(component) = component.as_os_str().to_str() else { continue };
                if self.segments.iter().any(|segment| segment == component) {
                    return true;
                }
            }
        }
        false
    }
}

/// Parse ignore-file content: one pattern per non-empty line, `#` comments,
/// surrounding whitespace trimmed.
fn parse_patterns(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Path of the per-root ignore file inside `root`.
pub fn exclude_file_in_root(root: &Path) -> PathBuf {
    root.join(EXCLUDE_FILE_NAME)
}

/// Read exclusion patterns from the file at `path`. A missing file is not an
/// error and yields no patterns.
pub async fn load_exclude_file(path: &Path) -> Result<Vec<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(parse_patterns(&content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err).or_raise(|| ErrorKind::IgnoreFile(path.to_path_buf())),
    }
}

/// The full pattern set for scanning `root`: embedded defaults merged with
/// the root's `.dittoignore`, if present.
pub async fn patterns_for_root(root: &Path) -> Result<Vec<String>> {
    let mut patterns = ExcludeSet::default_patterns();
    patterns.extend(load_exclude_file(&exclude_file_in_root(root)).await?);
    Ok(patterns)
}
