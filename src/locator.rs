//! Source path resolution.
//!
//! Callers name sources the way their pages do: `photos/a.jpg`,
//! `/photos/a.jpg`, or an absolute filesystem path. A [`SourceLocator`] turns
//! that name into a readable file, or reports that there is none.

use std::path::{Path, PathBuf};

pub trait SourceLocator: Send + Sync {
    /// The file behind `source`, or `None` if it doesn't exist.
    fn resolve(&self, source: &str) -> Option<PathBuf>;
}

/// Looks the path up as given first, then below a base directory.
///
/// A leading `/` is ignored for the second lookup, so `/photos/a.jpg`
/// finds `{base}/photos/a.jpg` when no `/photos` exists on the host.
#[derive(Debug, Clone)]
pub struct BaseDirLocator {
    base: PathBuf,
}

impl BaseDirLocator {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

impl SourceLocator for BaseDirLocator {
    fn resolve(&self, source: &str) -> Option<PathBuf> {
        if source.is_empty() {
            return None;
        }
        let direct = Path::new(source);
        if direct.is_file() {
            return Some(direct.to_path_buf());
        }
        let below = self.base.join(source.trim_start_matches('/'));
        below.is_file().then_some(below)
    }
}
