use clap::{Parser, Subcommand};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thumbstore::config::{self, Driver, ServiceConfig};
use thumbstore::editor::Editor;
use thumbstore::imaging::{Quality, RustBackend};
use thumbstore::locator::BaseDirLocator;
use thumbstore::{CacheStats, CacheStore, ThumbnailService, TransformSpec, output};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How a command receives its transform spec.
#[derive(clap::Args, Clone)]
struct SpecArgs {
    /// Transform spec as JSON, e.g. '{"resize":{"width":200},"type":"png"}'
    #[arg(long, conflicts_with = "spec_file")]
    spec: Option<String>,

    /// Read the transform spec from a JSON file
    #[arg(long)]
    spec_file: Option<PathBuf>,

    /// Extra cache-busting token mixed into the fingerprint
    #[arg(long)]
    token: Option<String>,
}

impl SpecArgs {
    fn load(&self) -> Result<TransformSpec, Box<dyn std::error::Error>> {
        let text = match (&self.spec, &self.spec_file) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)?,
            (None, None) => return Ok(TransformSpec::new()),
        };
        Ok(TransformSpec::from_json_str(&text)?)
    }
}

#[derive(Parser)]
#[command(name = "thumbstore")]
#[command(about = "Cached image derivatives: resize, crop, rotate, watermark")]
#[command(long_about = "\
Cached image derivatives: resize, crop, rotate, watermark

A derivative is named by a fingerprint of (source, transform spec, token)
and stored once under the cache directory:

  {base_path}/{cache_dir}/{shard}/{fingerprint}.{ext}
  {base_path}/{cache_dir}/{shard}/{fingerprint}@2x.{ext}   (retina)

Specs are JSON, applied in order:

  [{\"resize\": {\"width\": 400}}, {\"crop\": {\"width\": 200, \"height\": 200}}]
  {\"scaleAndCrop\": {\"width\": 100, \"height\": 100}, \"quality\": 80}

Run 'thumbstore gen-config' to generate a documented thumbstore.toml.")]
#[command(version)]
struct Cli {
    /// Config file (default: ./thumbstore.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Return the cache reference for one source, rendering it if needed
    Thumb {
        source: String,
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Pre-render one spec across many sources in parallel
    Warm {
        sources: Vec<String>,
        /// Also read sources from a file, one per line
        #[arg(long)]
        list: Option<PathBuf>,
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Apply a spec and write the result to a file, bypassing the cache
    Render {
        source: String,
        /// Output file; its extension picks the format
        #[arg(short, long)]
        output: PathBuf,
        /// Encoder quality (1-100)
        #[arg(short, long)]
        quality: Option<u32>,
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Show the fingerprint and cache location without rendering
    Fingerprint {
        source: String,
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Print a stock thumbstore.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Thumb { source, spec } => {
            let (config, backend) = load(config_path)?;
            let transform = spec.load()?;
            let service = ThumbnailService::from_config(backend, &config);
            let result = service.thumbnail_for(&source, &transform, spec.token.as_deref());
            output::print_result(&source, &result);
            result?;
        }
        Command::Warm {
            mut sources,
            list,
            spec,
        } => {
            let (config, backend) = load(config_path)?;
            if let Some(list) = list {
                sources.extend(read_source_list(&list)?);
            }
            let transform = spec.load()?;
            init_thread_pool(&config);
            let service = ThumbnailService::from_config(backend, &config);
            let results: Vec<_> = sources
                .par_iter()
                .map(|source| service.thumbnail_for(source, &transform, spec.token.as_deref()))
                .collect();

            let mut stats = CacheStats::default();
            for (source, result) in sources.iter().zip(&results) {
                output::print_result(source, result);
                match result {
                    Ok(thumbnail) => thumbnail.record(&mut stats),
                    Err(_) => stats.fail(),
                }
            }
            println!();
            println!("{}", output::format_warm_summary(sources.len(), &stats));
            if stats.failures > 0 {
                let message = format!("{} of {} sources failed", stats.failures, sources.len());
                return Err(message.into());
            }
        }
        Command::Render {
            source,
            output: path,
            quality,
            spec,
        } => {
            let (config, backend) = load(config_path)?;
            let transform = spec.load()?;
            let locator = BaseDirLocator::new(&config.base_path);
            let mut editor =
                Editor::new(&backend, &locator).with_quality(config.default_quality());
            editor.set_image(&source)?.apply(&transform)?;
            editor.save(&path, quality.map(Quality::new))?;
            let bytes = std::fs::metadata(&path)?.len();
            println!("{}", output::format_render(&path, editor.dimensions()?, bytes));
        }
        Command::Fingerprint { source, spec } => {
            let (config, backend) = load(config_path)?;
            let transform = spec.load()?;
            let service = ThumbnailService::from_config(backend, &config);
            let (key, _) = service.key_for(&source, &transform, spec.token.as_deref())?;
            let path = service.store().resolve(&key);
            output::print_fingerprint(&source, &path, &transform);
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// The explicit config file, or `./thumbstore.toml` if present, plus the
/// backend it selects.
fn load(path: Option<&Path>) -> Result<(ServiceConfig, RustBackend), config::ConfigError> {
    let config = match path {
        Some(path) => config::load_config(path)?,
        None => config::discover_config(Path::new("."))?,
    };
    let backend = match config.driver {
        Driver::Rust => RustBackend::new().with_max_pixels(config.max_output_pixels),
    };
    Ok((config, backend))
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "thumbstore=debug"
    } else {
        "thumbstore=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Caps at the number of available CPU cores; user can constrain down, not up.
fn init_thread_pool(config: &ServiceConfig) {
    let threads = config::effective_threads(&config.processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

/// Non-empty, non-comment lines of a source list file.
fn read_source_list(path: &Path) -> std::io::Result<Vec<String>> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}
