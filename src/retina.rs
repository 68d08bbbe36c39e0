//! Double-resolution (`@2x`) siblings.
//!
//! After a base derivative has been freshly written, the service may also
//! write `{hex}@2x.{ext}` next to it for high-DPI screens. This only happens
//! when the source has the pixels for it: both sides of the base result,
//! doubled, must fit inside the original.
//!
//! The sibling is rendered from the *original* decoded source with a derived
//! spec, not by upscaling the base result. Deriving is best-effort: a failure
//! is logged and reported as [`RetinaOutcome::Failed`], never as an error of
//! the base request.

use crate::cache::{CacheKey, CacheStore};
use crate::imaging::{Dimensions, ImageBackend, ImageHandle, OutputFormat};
use crate::pipeline::{PipelineContext, execute};
use crate::transform::{Operation, TransformSpec};
use tracing::{debug, info, warn};

/// What happened to the `@2x` sibling of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetinaOutcome {
    /// Not attempted: disabled, a cache hit, or the source is too small.
    Skipped,
    /// Written; holds the web reference.
    Written(String),
    Failed(String),
}

/// Whether a doubled `base` fits inside `original`.
pub fn fits(base: Dimensions, original: Dimensions) -> bool {
    base.width.saturating_mul(2) <= original.width
        && base.height.saturating_mul(2) <= original.height
}

/// The spec for the `@2x` sibling.
///
/// Resizes that give both width and height, and every `scaleAndCrop` box, are
/// doubled. Everything else is kept as is.
pub fn retina_spec(spec: &TransformSpec) -> TransformSpec {
    spec.operations()
        .iter()
        .map(|op| match op {
            Operation::Resize {
                width: Some(w),
                height: Some(h),
                master,
            } => Operation::Resize {
                width: Some(w.saturating_mul(2)),
                height: Some(h.saturating_mul(2)),
                master: *master,
            },
            Operation::ScaleAndCrop { width, height } => Operation::ScaleAndCrop {
                width: width.saturating_mul(2),
                height: height.saturating_mul(2),
            },
            other => other.clone(),
        })
        .collect()
}

/// Render and store the `@2x` sibling of `base_key` if the source allows it.
///
/// `original` is the decoded source; it is cloned, never modified. `base` is
/// the size of the base result that was just written.
pub fn derive<B: ImageBackend, S: CacheStore + ?Sized>(
    original: &B::Image,
    base: Dimensions,
    spec: &TransformSpec,
    ctx: &PipelineContext<'_, B>,
    store: &S,
    base_key: &CacheKey,
    format: OutputFormat,
) -> RetinaOutcome {
    let source = original.dimensions();
    if !fits(base, source) {
        debug!(
            key = %base_key,
            base = %format!("{}x{}", base.width, base.height),
            source = %format!("{}x{}", source.width, source.height),
            "Source too small for @2x"
        );
        return RetinaOutcome::Skipped;
    }

    let key = base_key.retina();
    match execute::<B, S>(original.clone(), &retina_spec(spec), ctx, store, &key, format) {
        Ok(dims) => {
            info!(key = %key, width = dims.width, height = dims.height, "Generated @2x");
            RetinaOutcome::Written(store.resolve(&key).web_reference)
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to generate @2x");
            RetinaOutcome::Failed(e.to_string())
        }
    }
}
