//! Image capability traits and shared types.
//!
//! The [`ImageBackend`] trait decodes a source file into an [`ImageHandle`],
//! and the handle carries every operation a transform pipeline can ask for:
//! resize, crop, rotate, flip, sharpen, reflect, watermark, background fill
//! and encode.
//!
//! Handles are plain owned values. The pipeline holds one by `&mut` and
//! mutates it in place; a fresh copy for a second pass is a `clone()`.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend), pure Rust on top of the
//! `image` crate.

use super::params::{Color, FlipDirection, Offset, OutputFormat, Quality, ResizeMaster};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Watermark image is missing")]
    MissingWatermark,
}

/// Width and height of an image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    /// Pixel count, without overflow for any pair of `u32` sides.
    pub fn pixels(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// A decoded image that operations mutate in place.
pub trait ImageHandle: Clone + Send + Sync {
    fn dimensions(&self) -> Dimensions;

    fn resize(
        &mut self,
        width: Option<u32>,
        height: Option<u32>,
        master: Option<ResizeMaster>,
    ) -> Result<(), BackendError>;

    fn crop(
        &mut self,
        width: u32,
        height: u32,
        offset_x: Offset,
        offset_y: Offset,
    ) -> Result<(), BackendError>;

    fn rotate(&mut self, degrees: i32) -> Result<(), BackendError>;

    fn flip(&mut self, direction: FlipDirection) -> Result<(), BackendError>;

    /// Sharpen by an amount in 1–100.
    fn sharpen(&mut self, amount: u32) -> Result<(), BackendError>;

    /// Append a mirrored copy of the bottom `height` rows, fading out
    /// (or in, with `fade_in`) from `opacity` percent.
    fn reflect(&mut self, height: Option<u32>, opacity: u8, fade_in: bool)
    -> Result<(), BackendError>;

    /// Composite `overlay` on top of this image. `None` means the caller had
    /// no watermark to give; backends reject it.
    fn watermark(
        &mut self,
        overlay: Option<&Self>,
        offset_x: Offset,
        offset_y: Offset,
        opacity: u8,
    ) -> Result<(), BackendError>;

    /// Flatten the image onto a solid `color` at `opacity` percent.
    fn set_background(&mut self, color: Color, opacity: u8) -> Result<(), BackendError>;

    /// Encode the current image to bytes.
    fn encode(&self, format: OutputFormat, quality: Quality) -> Result<Vec<u8>, BackendError>;

    /// Encode the current image to a file.
    ///
    /// The bytes go to a temp file next to `path` that is renamed into place,
    /// so `path` holds either its old content or the complete new image.
    fn save(
        &self,
        path: &Path,
        format: OutputFormat,
        quality: Quality,
    ) -> Result<(), BackendError> {
        let bytes = self.encode(format, quality)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Trait for image processing backends.
///
/// A backend only decodes; everything after decoding happens on the handle.
/// See the [module docs](self) for the operation set.
pub trait ImageBackend: Sync {
    type Image: ImageHandle;

    /// Short name used in logs and configuration (`driver = "rust"`).
    fn name(&self) -> &'static str;

    /// Decode an image file.
    fn decode(&self, path: &Path) -> Result<Self::Image, BackendError>;
}
