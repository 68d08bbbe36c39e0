//! Service configuration.
//!
//! Loaded from a TOML file (`thumbstore.toml` by default). Every key is
//! optional; a file only needs the values it wants to change. Unknown keys are
//! rejected to catch typos early.
//!
//! ## Configuration Options
//!
//! ```toml
//! base_path = "."            # Source lookup base; the cache lives below it
//! cache_dir = "easyimage"    # Cache directory under base_path (and base_url)
//! base_url = ""              # Prefix for web references
//! cache_ttl_secs = 2592000   # 30 days
//! quality = 100              # Default output quality (0-100)
//! retina = false             # Also write @2x siblings
//! dir_mode = 0o755           # Best-effort permission bits for shard dirs
//! file_mode = 0o644          # Best-effort permission bits for cache files
//! driver = "rust"            # Image backend
//! max_output_pixels = 50000000  # Largest canvas an operation may build
//!
//! [processing]
//! max_processes = 4          # Parallel workers for `warm` (omit for auto)
//! ```
//!
//! With the defaults, a derivative of `photos/a.jpg` lands at
//! `./easyimage/3/3f9a….jpg` and is referenced as `/easyimage/3/3f9a….jpg`.

use crate::cache::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::imaging::Quality;
use crate::imaging::rust_backend::DEFAULT_MAX_PIXELS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name looked up in the working directory when no `--config` is given.
pub const CONFIG_FILENAME: &str = "thumbstore.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Image backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// Pure Rust, on top of the `image` crate.
    #[default]
    Rust,
}

/// Service configuration loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Base directory for relative source paths, and parent of the cache.
    pub base_path: PathBuf,
    /// Cache directory name, relative to `base_path` and `base_url`.
    pub cache_dir: String,
    /// Prefix for web references. Empty means site-root relative.
    pub base_url: String,
    /// Cache entries older than this are regenerated.
    pub cache_ttl_secs: u64,
    /// Output quality used unless a spec sets its own.
    pub quality: u32,
    /// Write a double-resolution `@2x` sibling when the source is big enough.
    pub retina: bool,
    pub dir_mode: u32,
    pub file_mode: u32,
    pub driver: Driver,
    /// Specs that would build a larger image than this fail instead.
    pub max_output_pixels: u64,
    pub processing: ProcessingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            cache_dir: "easyimage".to_string(),
            base_url: String::new(),
            cache_ttl_secs: 2_592_000,
            quality: 100,
            retina: false,
            dir_mode: DEFAULT_DIR_MODE,
            file_mode: DEFAULT_FILE_MODE,
            driver: Driver::default(),
            max_output_pixels: DEFAULT_MAX_PIXELS,
            processing: ProcessingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quality > 100 {
            return Err(ConfigError::Validation("quality must be 0-100".into()));
        }
        let dir = self.cache_dir.trim_matches('/');
        if dir.is_empty() {
            return Err(ConfigError::Validation("cache_dir must not be empty".into()));
        }
        if dir.split('/').any(|part| part == "..") {
            return Err(ConfigError::Validation(
                "cache_dir must not contain '..'".into(),
            ));
        }
        if self.max_output_pixels == 0 {
            return Err(ConfigError::Validation(
                "max_output_pixels must be at least 1".into(),
            ));
        }
        if self.dir_mode > 0o7777 || self.file_mode > 0o7777 {
            return Err(ConfigError::Validation(
                "dir_mode and file_mode must be permission bits (at most 0o7777)".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding the shard directories.
    pub fn cache_root(&self) -> PathBuf {
        self.base_path.join(self.cache_dir.trim_matches('/'))
    }

    /// Web prefix for cache references: `{base_url}/{cache_dir}`.
    pub fn web_prefix(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.cache_dir.trim_matches('/')
        )
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn default_quality(&self) -> Quality {
        Quality::new(self.quality)
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel workers for batch commands.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_processes.map(|n| n.clamp(1, cores)).unwrap_or(cores)
}

/// Parse and validate config text.
pub fn parse_config(text: &str) -> Result<ServiceConfig, ConfigError> {
    let config: ServiceConfig = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

/// Load config from a TOML file. A missing file is an error.
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Load [`CONFIG_FILENAME`] from `dir`, or the defaults if there is none.
pub fn discover_config(dir: &Path) -> Result<ServiceConfig, ConfigError> {
    let path = dir.join(CONFIG_FILENAME);
    if !path.exists() {
        return Ok(ServiceConfig::default());
    }
    load_config(&path)
}

/// Returns a fully-commented stock config with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# thumbstore configuration
# ========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
# Unknown keys will cause an error.

# Base directory. Relative source paths are looked up here, and the cache
# directory is created inside it.
base_path = "."

# Cache directory, relative to base_path on disk and to base_url on the web.
cache_dir = "easyimage"

# Prefix for returned references, e.g. "https://cdn.example.com".
# Empty gives site-root relative references like "/easyimage/3/3f9a....jpg".
base_url = ""

# Cached derivatives older than this many seconds are regenerated (30 days).
cache_ttl_secs = 2592000

# Output quality (0 = worst, 100 = best) unless a spec sets "quality".
quality = 100

# Also write a double-resolution "@2x" sibling for every fresh derivative,
# when the source is at least twice as large as the result.
retina = false

# Permission bits applied to new shard directories and cache files.
# Failures to apply them are logged and otherwise ignored.
dir_mode = 0o755
file_mode = 0o644

# Image backend. Only "rust" is available.
driver = "rust"

# Largest image, in pixels, any operation may produce. Specs asking for more
# (a huge resize, or its @2x sibling) fail instead of exhausting memory.
max_output_pixels = 50000000

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel workers for the `warm` command.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_processes = 4
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.base_path, PathBuf::from("."));
        assert_eq!(config.cache_dir, "easyimage");
        assert_eq!(config.base_url, "");
        assert_eq!(config.cache_ttl_secs, 2_592_000);
        assert_eq!(config.quality, 100);
        assert!(!config.retina);
        assert_eq!(config.dir_mode, 0o755);
        assert_eq!(config.file_mode, 0o644);
        assert_eq!(config.driver, Driver::Rust);
        assert_eq!(config.max_output_pixels, 50_000_000);
    }

    #[test]
    fn derived_paths() {
        let config = ServiceConfig {
            base_path: PathBuf::from("/srv/site"),
            cache_dir: "/thumbs/".into(),
            base_url: "https://cdn.example.com/".into(),
            ..ServiceConfig::default()
        };
        assert_eq!(config.cache_root(), PathBuf::from("/srv/site/thumbs"));
        assert_eq!(config.web_prefix(), "https://cdn.example.com/thumbs");

        let default = ServiceConfig::default();
        assert_eq!(default.web_prefix(), "/easyimage");
        assert_eq!(default.ttl(), Duration::from_secs(30 * 24 * 3600));
    }

    #[test]
    fn parse_partial_config() {
        let config = parse_config(
            r#"
retina = true
quality = 80
dir_mode = 0o750
"#,
        )
        .unwrap();
        assert!(config.retina);
        assert_eq!(config.quality, 80);
        assert_eq!(config.dir_mode, 0o750);
        // Defaults preserved
        assert_eq!(config.cache_dir, "easyimage");
        assert_eq!(config.file_mode, 0o644);
    }

    #[test]
    fn stock_config_parses_to_defaults() {
        let config = parse_config(stock_config_toml()).unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(matches!(
            parse_config("cache_ttl = 10"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn unknown_driver_rejected() {
        assert!(matches!(
            parse_config(r#"driver = "imagick""#),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn validate_quality_boundary() {
        assert!(parse_config("quality = 100").is_ok());
        assert!(parse_config("quality = 0").is_ok());
        assert!(matches!(
            parse_config("quality = 101"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn validate_max_output_pixels() {
        let config = parse_config("max_output_pixels = 1000000").unwrap();
        assert_eq!(config.max_output_pixels, 1_000_000);
        assert!(matches!(
            parse_config("max_output_pixels = 0"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn validate_cache_dir() {
        assert!(matches!(
            parse_config(r#"cache_dir = "/""#),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            parse_config(r#"cache_dir = "../outside""#),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn validate_modes() {
        assert!(matches!(
            parse_config("file_mode = 0o17777"),
            Err(ConfigError::Validation(_))
        ));
    }

    // =========================================================================
    // load_config / discover_config
    // =========================================================================

    #[test]
    fn load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("custom.toml");
        fs::write(&path, "base_url = \"https://img.example.com\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.base_url, "https://img.example.com");
    }

    #[test]
    fn load_config_missing_file_is_error() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            load_config(&tmp.path().join("nope.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn load_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILENAME);
        fs::write(&path, "this is not valid toml [[[").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn discover_config_defaults_without_file() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            discover_config(tmp.path()).unwrap(),
            ServiceConfig::default()
        );

        fs::write(tmp.path().join(CONFIG_FILENAME), "retina = true").unwrap();
        assert!(discover_config(tmp.path()).unwrap().retina);
    }

    // =========================================================================
    // Processing config
    // =========================================================================

    #[test]
    fn parse_processing_config() {
        let config = parse_config("[processing]\nmax_processes = 2\n").unwrap();
        assert_eq!(config.processing.max_processes, Some(2));
    }

    #[test]
    fn effective_threads_user_constrains_down() {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let config = ProcessingConfig {
            max_processes: Some(1),
        };
        assert_eq!(effective_threads(&config), 1);
        let config = ProcessingConfig {
            max_processes: Some(cores + 100),
        };
        assert_eq!(effective_threads(&config), cores);
        assert_eq!(effective_threads(&ProcessingConfig::default()), cores);
    }
}
