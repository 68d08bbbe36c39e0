//! CLI output formatting.
//!
//! # Output Format
//!
//! ## Thumb / Warm
//!
//! ```text
//! photos/a.jpg → /easyimage/3/3f9a….jpg (generated)
//!     @2x: /easyimage/3/3f9a…@2x.jpg
//! photos/b.jpg → /easyimage/a/a01b….jpg (cached)
//! photos/c.jpg: source image not found: photos/c.jpg
//!
//! Warmed 3 sources: 1 cached, 1 generated, 1 @2x, 1 failed (3 total)
//! ```
//!
//! ## Fingerprint
//!
//! ```text
//! photos/a.jpg
//!     Fingerprint: 3f9a…
//!     File: ./easyimage/3/3f9a….jpg
//!     Reference: /easyimage/3/3f9a….jpg
//!     001 resize {"width":200}
//! ```
//!
//! # Architecture
//!
//! Each command has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format functions
//! are pure: no I/O, no side effects.

use crate::cache::{CachePath, CacheStats};
use crate::imaging::Dimensions;
use crate::retina::RetinaOutcome;
use crate::service::{CacheStatus, ServiceError, Thumbnail};
use crate::transform::{Operation, TransformSpec};
use std::path::Path;

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn status_label(status: CacheStatus) -> &'static str {
    match status {
        CacheStatus::Hit => "cached",
        CacheStatus::Generated => "generated",
        CacheStatus::Coalesced => "shared",
    }
}

// ============================================================================
// thumb / warm
// ============================================================================

/// Format one served request, with its `@2x` outcome as a context line.
pub fn format_thumbnail(source: &str, thumbnail: &Thumbnail) -> Vec<String> {
    let mut lines = vec![format!(
        "{} → {} ({})",
        source,
        thumbnail.reference,
        status_label(thumbnail.status)
    )];
    match &thumbnail.retina {
        RetinaOutcome::Skipped => {}
        RetinaOutcome::Written(reference) => {
            lines.push(format!("{}@2x: {}", indent(1), reference));
        }
        RetinaOutcome::Failed(message) => {
            lines.push(format!("{}@2x: failed ({})", indent(1), message));
        }
    }
    lines
}

/// Format the result of one request, successful or not.
pub fn format_result(source: &str, result: &Result<Thumbnail, ServiceError>) -> Vec<String> {
    match result {
        Ok(thumbnail) => format_thumbnail(source, thumbnail),
        Err(e) => vec![format!("{}: {}", source, e)],
    }
}

pub fn format_warm_summary(sources: usize, stats: &CacheStats) -> String {
    let noun = if sources == 1 { "source" } else { "sources" };
    format!("Warmed {} {}: {}", sources, noun, stats)
}

pub fn print_result(source: &str, result: &Result<Thumbnail, ServiceError>) {
    for line in format_result(source, result) {
        println!("{}", line);
    }
}

// ============================================================================
// fingerprint
// ============================================================================

/// One line per operation, as it will be fingerprinted.
pub fn format_spec(spec: &TransformSpec) -> Vec<String> {
    spec.operations()
        .iter()
        .enumerate()
        .map(|(i, op)| format!("{} {}", format_index(i + 1), operation_params(op)))
        .collect()
}

fn operation_params(op: &Operation) -> String {
    format!("{} {}", op.name(), op.params_json())
}

pub fn format_fingerprint(source: &str, path: &CachePath, spec: &TransformSpec) -> Vec<String> {
    let hex = path
        .file_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut lines = vec![
        source.to_string(),
        format!("{}Fingerprint: {}", indent(1), hex),
        format!("{}File: {}", indent(1), path.file_path.display()),
        format!("{}Reference: {}", indent(1), path.web_reference),
    ];
    lines.extend(format_spec(spec).into_iter().map(|l| format!("{}{}", indent(1), l)));
    lines
}

pub fn print_fingerprint(source: &str, path: &CachePath, spec: &TransformSpec) {
    for line in format_fingerprint(source, path, spec) {
        println!("{}", line);
    }
}

// ============================================================================
// render
// ============================================================================

pub fn format_render(output: &Path, dims: Dimensions, bytes: u64) -> String {
    format!(
        "{} ({}x{}, {})",
        output.display(),
        dims.width,
        dims.height,
        human_size(bytes)
    )
}

fn human_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KIB {
        format!("{} B", bytes)
    } else if b < KIB * KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{:.1} MiB", b / (KIB * KIB))
    }
}
