//! Derived-image cache storage.
//!
//! Every derived image lives at a path computed from its fingerprint, so a
//! cache lookup is a single `stat`. There is no manifest or index to load or
//! keep consistent: the directory tree *is* the cache.
//!
//! # Layout
//!
//! ```text
//! {base_path}/{cache_dir}/
//! ├── 3/
//! │   ├── 3f9a…c2.jpg        base derivative
//! │   └── 3f9a…c2@2x.jpg     retina sibling
//! └── a/
//!     └── a01b…7e.webp
//! ```
//!
//! The shard directory is the fingerprint's first hex digit, which caps the
//! fan-out at 16 directories. The extension is the one requested by a `type`
//! operation, or else the source file's own extension.
//!
//! # Freshness
//!
//! An entry is fresh while `now - mtime < ttl`. Nothing here ever deletes an
//! entry; a stale file is simply overwritten by the next miss. An mtime in the
//! future (clock skew, restored backups) counts as fresh.
//!
//! # Writes
//!
//! [`DiskStore::put_atomic`] writes to a temporary file inside the shard
//! directory and renames it over the final path. Readers see either the old
//! file or the complete new one, never a partial encode. Permission changes
//! after the write are best-effort: a failing `chmod` is logged and ignored.

use crate::fingerprint::Fingerprint;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Which artifact of a request a key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Base,
    /// The double-resolution `@2x` sibling.
    Retina,
}

/// Identifies one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: Fingerprint,
    pub variant: Variant,
    pub extension: String,
}

impl CacheKey {
    pub fn new(fingerprint: Fingerprint, extension: impl Into<String>) -> Self {
        Self {
            fingerprint,
            variant: Variant::Base,
            extension: extension.into(),
        }
    }

    /// The `@2x` sibling of this key.
    pub fn retina(&self) -> Self {
        Self {
            variant: Variant::Retina,
            ..self.clone()
        }
    }

    pub fn file_name(&self) -> String {
        let suffix = match self.variant {
            Variant::Base => "",
            Variant::Retina => "@2x",
        };
        format!("{}{}.{}", self.fingerprint.hex(), suffix, self.extension)
    }

    /// `{shard}/{file_name}`, with forward slashes.
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.fingerprint.shard(), self.file_name())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

/// Where a key lives, on disk and on the web.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePath {
    pub shard_dir: PathBuf,
    pub file_path: PathBuf,
    pub web_reference: String,
}

/// Storage for derived images.
///
/// All methods take `&self`; implementations must be safe to share across
/// threads.
pub trait CacheStore: Send + Sync {
    fn resolve(&self, key: &CacheKey) -> CachePath;

    /// Create the shard directory (and the cache root) if missing. Idempotent.
    fn ensure_shard(&self, key: &CacheKey) -> io::Result<()>;

    /// Modification time of the entry, `None` if it doesn't exist.
    fn modified(&self, key: &CacheKey) -> Option<SystemTime>;

    fn get(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>>;

    /// Store `bytes` so that readers never observe a partial entry.
    fn put_atomic(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()>;
}

/// Whether `key` exists and is younger than `ttl` at `now`.
pub fn is_fresh<S: CacheStore + ?Sized>(
    store: &S,
    key: &CacheKey,
    ttl: Duration,
    now: SystemTime,
) -> bool {
    match store.modified(key) {
        None => false,
        Some(mtime) => match now.duration_since(mtime) {
            Ok(age) => age < ttl,
            // mtime in the future
            Err(_) => true,
        },
    }
}

// =============================================================================
// DiskStore
// =============================================================================

/// Default permission bits for shard directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;
/// Default permission bits for cache files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Sharded directory tree on the local filesystem.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    web_prefix: String,
    dir_mode: u32,
    file_mode: u32,
}

impl DiskStore {
    /// A store rooted at `root`, publishing entries under `web_prefix`
    /// (e.g. `"/easyimage"` or `"https://cdn.example.com/easyimage"`).
    pub fn new(root: impl Into<PathBuf>, web_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            web_prefix: web_prefix.into().trim_end_matches('/').to_string(),
            dir_mode: DEFAULT_DIR_MODE,
            file_mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn with_modes(mut self, dir_mode: u32, file_mode: u32) -> Self {
        self.dir_mode = dir_mode;
        self.file_mode = file_mode;
        self
    }
}

impl CacheStore for DiskStore {
    fn resolve(&self, key: &CacheKey) -> CachePath {
        let shard_dir = self.root.join(key.fingerprint.shard().to_string());
        CachePath {
            file_path: shard_dir.join(key.file_name()),
            shard_dir,
            web_reference: format!("{}/{}", self.web_prefix, key.relative_path()),
        }
    }

    fn ensure_shard(&self, key: &CacheKey) -> io::Result<()> {
        let shard_dir = self.resolve(key).shard_dir;
        if shard_dir.is_dir() {
            return Ok(());
        }
        let root_existed = self.root.is_dir();
        fs::create_dir_all(&shard_dir)?;
        if !root_existed {
            set_mode_best_effort(&self.root, self.dir_mode);
        }
        set_mode_best_effort(&shard_dir, self.dir_mode);
        debug!(shard = %shard_dir.display(), "Created cache shard");
        Ok(())
    }

    fn modified(&self, key: &CacheKey) -> Option<SystemTime> {
        fs::metadata(self.resolve(key).file_path)
            .and_then(|m| m.modified())
            .ok()
    }

    fn get(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.resolve(key).file_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put_atomic(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()> {
        self.ensure_shard(key)?;
        let path = self.resolve(key);

        // Temp file in the same directory, so the rename never crosses filesystems
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&path.shard_dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path.file_path).map_err(|e| e.error)?;

        set_mode_best_effort(&path.file_path, self.file_mode);
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode_best_effort(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        warn!(
            path = %path.display(),
            mode = %format!("{mode:o}"),
            error = %e,
            "Could not set permissions"
        );
    }
}

#[cfg(not(unix))]
fn set_mode_best_effort(_path: &Path, _mode: u32) {}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-memory store, for tests and for embedding without a filesystem cache.
///
/// Entries can be aged with [`MemoryStore::set_modified`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    web_prefix: String,
    entries: Mutex<HashMap<String, (Vec<u8>, SystemTime)>>,
}

impl MemoryStore {
    pub fn new(web_prefix: impl Into<String>) -> Self {
        Self {
            web_prefix: web_prefix.into().trim_end_matches('/').to_string(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_modified(&self, key: &CacheKey, time: SystemTime) {
        if let Some(entry) = self.lock().get_mut(&key.relative_path()) {
            entry.1 = time;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, SystemTime)>> {
        // A panic while holding the lock can't leave the map half-updated
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheStore for MemoryStore {
    fn resolve(&self, key: &CacheKey) -> CachePath {
        let shard_dir = PathBuf::from(key.fingerprint.shard().to_string());
        CachePath {
            file_path: shard_dir.join(key.file_name()),
            shard_dir,
            web_reference: format!("{}/{}", self.web_prefix, key.relative_path()),
        }
    }

    fn ensure_shard(&self, _key: &CacheKey) -> io::Result<()> {
        Ok(())
    }

    fn modified(&self, key: &CacheKey) -> Option<SystemTime> {
        self.lock().get(&key.relative_path()).map(|(_, t)| *t)
    }

    fn get(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>> {
        Ok(self.lock().get(&key.relative_path()).map(|(b, _)| b.clone()))
    }

    fn put_atomic(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()> {
        self.lock()
            .insert(key.relative_path(), (bytes.to_vec(), SystemTime::now()));
        Ok(())
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Summary of cache behavior over a batch of requests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub generated: u32,
    pub coalesced: u32,
    pub retina: u32,
    pub failures: u32,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn generate(&mut self) {
        self.generated += 1;
    }

    pub fn coalesce(&mut self) {
        self.coalesced += 1;
    }

    pub fn retina(&mut self) {
        self.retina += 1;
    }

    pub fn fail(&mut self) {
        self.failures += 1;
    }

    pub fn total(&self) -> u32 {
        self.hits + self.generated + self.coalesced + self.failures
    }

    /// Combine two partial summaries (for parallel folds).
    pub fn merge(mut self, other: Self) -> Self {
        self.hits += other.hits;
        self.generated += other.generated;
        self.coalesced += other.coalesced;
        self.retina += other.retina;
        self.failures += other.failures;
        self
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cached, {} generated", self.hits, self.generated)?;
        if self.coalesced > 0 {
            write!(f, ", {} coalesced", self.coalesced)?;
        }
        if self.retina > 0 {
            write!(f, ", {} @2x", self.retina)?;
        }
        if self.failures > 0 {
            write!(f, ", {} failed", self.failures)?;
        }
        write!(f, " ({} total)", self.total())
    }
}
