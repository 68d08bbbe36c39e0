//! Transform pipeline execution.
//!
//! [`apply`] runs a [`TransformSpec`] against a decoded image, one operation
//! at a time and strictly in order: a crop after a resize sees the resized
//! image. [`execute`] adds the single final encode and the atomic cache write.
//!
//! | Operation | Image call |
//! |---|---|
//! | `resize` | `resize(width, height, master)` |
//! | `crop` | `crop(width, height, offset_x, offset_y)` |
//! | `scaleAndCrop` | `resize(w, h, Inverse)` then centered `crop(w, h)` |
//! | `rotate` | `rotate(degrees)` |
//! | `flip` | `flip(direction)` |
//! | `sharpen` | `sharpen(amount)` |
//! | `reflection` | `reflect(height, opacity, fade_in)` |
//! | `watermark` | decode the overlay, then `watermark(overlay, …)` |
//! | `background` | `set_background(color, opacity)` |
//! | `quality` | sets the encode quality |
//! | `type` | nothing (it only picks the file extension) |
//!
//! Any failure aborts the run before anything is written, so a cache path
//! never holds the result of a half-applied spec.

use crate::cache::{CacheKey, CacheStore};
use crate::imaging::{
    BackendError, Dimensions, ImageBackend, ImageHandle, Offset, OutputFormat, Quality,
    ResizeMaster,
};
use crate::locator::SourceLocator;
use crate::transform::{Operation, TransformSpec};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("watermark image not found: {0}")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to store result: {0}")]
    Store(#[source] io::Error),
}

/// Cooperative cancellation: an explicit flag plus an optional deadline.
///
/// Checked before every operation and once more before the result is
/// written. Share it by reference (or in an `Arc`) with whoever may cancel.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never fires unless [`cancel`](Self::cancel)led.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything a pipeline run needs besides the image and the spec.
pub struct PipelineContext<'a, B: ImageBackend> {
    /// Decodes watermark overlays.
    pub backend: &'a B,
    /// Resolves watermark paths.
    pub locator: &'a dyn SourceLocator,
    /// Encode quality unless a `quality` operation overrides it.
    pub default_quality: Quality,
    pub cancel: &'a CancelToken,
}

/// Apply every operation of `spec` to `image`, in order.
///
/// Returns the quality the result should be encoded with.
pub fn apply<B: ImageBackend>(
    image: &mut B::Image,
    spec: &TransformSpec,
    ctx: &PipelineContext<'_, B>,
) -> Result<Quality, PipelineError> {
    let mut quality = ctx.default_quality;

    for op in spec.operations() {
        ctx.cancel.check()?;
        trace!(op = op.name(), "Applying operation");

        match op {
            Operation::Resize {
                width,
                height,
                master,
            } => image.resize(*width, *height, *master)?,
            Operation::Crop {
                width,
                height,
                offset_x,
                offset_y,
            } => image.crop(*width, *height, *offset_x, *offset_y)?,
            Operation::ScaleAndCrop { width, height } => {
                image.resize(Some(*width), Some(*height), Some(ResizeMaster::Inverse))?;
                image.crop(*width, *height, Offset::Center, Offset::Center)?;
            }
            Operation::Rotate { degrees } => image.rotate(*degrees)?,
            Operation::Flip { direction } => image.flip(*direction)?,
            Operation::Sharpen { amount } => image.sharpen(*amount)?,
            Operation::Reflection {
                height,
                opacity,
                fade_in,
            } => image.reflect(*height, *opacity, *fade_in)?,
            Operation::Watermark {
                source,
                offset_x,
                offset_y,
                opacity,
            } => {
                let overlay = match source {
                    Some(source) => {
                        let path = ctx
                            .locator
                            .resolve(source)
                            .ok_or_else(|| PipelineError::NotFound(source.clone()))?;
                        Some(ctx.backend.decode(&path)?)
                    }
                    None => None,
                };
                image.watermark(overlay.as_ref(), *offset_x, *offset_y, *opacity)?;
            }
            Operation::Background { color, opacity } => image.set_background(*color, *opacity)?,
            Operation::Quality(q) => quality = *q,
            Operation::Type { .. } => {}
        }
    }

    Ok(quality)
}

/// Apply `spec`, encode once, and store the result under `key`.
///
/// Returns the dimensions of the stored image.
pub fn execute<B: ImageBackend, S: CacheStore + ?Sized>(
    mut image: B::Image,
    spec: &TransformSpec,
    ctx: &PipelineContext<'_, B>,
    store: &S,
    key: &CacheKey,
    format: OutputFormat,
) -> Result<Dimensions, PipelineError> {
    let quality = apply::<B>(&mut image, spec, ctx)?;
    let bytes = image.encode(format, quality)?;

    ctx.cancel.check()?;
    store.put_atomic(key, &bytes).map_err(PipelineError::Store)?;

    Ok(image.dimensions())
}
