//! Direct image editing, without the cache.
//!
//! An [`Editor`] holds at most one decoded image and applies operations to it
//! as they are called, then saves or renders the result:
//!
//! ```no_run
//! # use thumbstore::editor::Editor;
//! # use thumbstore::imaging::{RustBackend, Quality};
//! # use thumbstore::locator::BaseDirLocator;
//! # fn main() -> Result<(), thumbstore::editor::EditorError> {
//! let backend = RustBackend::new();
//! let locator = BaseDirLocator::new("public");
//! let mut editor = Editor::new(&backend, &locator);
//! editor
//!     .set_image("photos/a.jpg")?
//!     .resize(Some(400), None, None)?
//!     .sharpen(20)?;
//! editor.save("public/a-400.jpg".as_ref(), Some(Quality::new(85)))?;
//! # Ok(())
//! # }
//! ```
//!
//! Every operation needs an image; calling one before [`Editor::set_image`]
//! is [`EditorError::NoImage`].

use crate::imaging::{
    BackendError, Color, Dimensions, FlipDirection, ImageBackend, ImageHandle, Offset,
    OutputFormat, Quality, ResizeMaster,
};
use crate::locator::{BaseDirLocator, SourceLocator};
use crate::pipeline::{self, CancelToken, PipelineContext, PipelineError};
use crate::transform::{TransformSpec, ValidationError};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum EditorError {
    #[error("no image loaded")]
    NoImage,
    #[error("image not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<PipelineError> for EditorError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Backend(e) => EditorError::Backend(e),
            PipelineError::NotFound(path) => EditorError::NotFound(path),
            PipelineError::Cancelled => {
                EditorError::Io(io::Error::new(io::ErrorKind::Interrupted, "cancelled"))
            }
            PipelineError::Store(e) => EditorError::Io(e),
        }
    }
}

/// A single decoded image and the operations to change it.
pub struct Editor<'a, B: ImageBackend, L: SourceLocator = BaseDirLocator> {
    backend: &'a B,
    locator: &'a L,
    image: Option<B::Image>,
    quality: Quality,
}

impl<'a, B: ImageBackend, L: SourceLocator> Editor<'a, B, L> {
    pub fn new(backend: &'a B, locator: &'a L) -> Self {
        Self {
            backend,
            locator,
            image: None,
            quality: Quality::new(100),
        }
    }

    /// Default quality for [`save`](Self::save) and [`render`](Self::render).
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Decode `source` (resolved through the locator) as the current image.
    pub fn set_image(&mut self, source: &str) -> Result<&mut Self, EditorError> {
        let path = self
            .locator
            .resolve(source)
            .ok_or_else(|| EditorError::NotFound(source.to_string()))?;
        self.image = Some(self.backend.decode(&path)?);
        debug!(source, "Loaded image");
        Ok(self)
    }

    /// Use an already-decoded image as the current image.
    pub fn set_decoded(&mut self, image: B::Image) -> &mut Self {
        self.image = Some(image);
        self
    }

    pub fn image(&self) -> Option<&B::Image> {
        self.image.as_ref()
    }

    pub fn dimensions(&self) -> Result<Dimensions, EditorError> {
        Ok(self.current()?.dimensions())
    }

    fn current(&self) -> Result<&B::Image, EditorError> {
        self.image.as_ref().ok_or(EditorError::NoImage)
    }

    fn current_mut(&mut self) -> Result<&mut B::Image, EditorError> {
        self.image.as_mut().ok_or(EditorError::NoImage)
    }

    pub fn resize(
        &mut self,
        width: Option<u32>,
        height: Option<u32>,
        master: Option<ResizeMaster>,
    ) -> Result<&mut Self, EditorError> {
        self.current_mut()?.resize(width, height, master)?;
        Ok(self)
    }

    pub fn crop(
        &mut self,
        width: u32,
        height: u32,
        offset_x: Offset,
        offset_y: Offset,
    ) -> Result<&mut Self, EditorError> {
        self.current_mut()?.crop(width, height, offset_x, offset_y)?;
        Ok(self)
    }

    /// Cover `width`×`height`, then crop the overflow evenly from both sides.
    pub fn scale_and_crop(&mut self, width: u32, height: u32) -> Result<&mut Self, EditorError> {
        let image = self.current_mut()?;
        image.resize(Some(width), Some(height), Some(ResizeMaster::Inverse))?;
        image.crop(width, height, Offset::Center, Offset::Center)?;
        Ok(self)
    }

    pub fn rotate(&mut self, degrees: i32) -> Result<&mut Self, EditorError> {
        self.current_mut()?.rotate(degrees)?;
        Ok(self)
    }

    pub fn flip(&mut self, direction: FlipDirection) -> Result<&mut Self, EditorError> {
        self.current_mut()?.flip(direction)?;
        Ok(self)
    }

    pub fn sharpen(&mut self, amount: u32) -> Result<&mut Self, EditorError> {
        self.current_mut()?.sharpen(amount)?;
        Ok(self)
    }

    pub fn reflection(
        &mut self,
        height: Option<u32>,
        opacity: u8,
        fade_in: bool,
    ) -> Result<&mut Self, EditorError> {
        self.current_mut()?.reflect(height, opacity, fade_in)?;
        Ok(self)
    }

    /// Overlay the image at `source` (resolved through the locator).
    pub fn watermark(
        &mut self,
        source: &str,
        offset_x: Offset,
        offset_y: Offset,
        opacity: u8,
    ) -> Result<&mut Self, EditorError> {
        self.current()?;
        let path = self
            .locator
            .resolve(source)
            .ok_or_else(|| EditorError::NotFound(source.to_string()))?;
        let overlay = self.backend.decode(&path)?;
        self.current_mut()?
            .watermark(Some(&overlay), offset_x, offset_y, opacity)?;
        Ok(self)
    }

    /// Overlay another editor's current image, without decoding it again.
    pub fn watermark_image<L2: SourceLocator>(
        &mut self,
        overlay: &Editor<'_, B, L2>,
        offset_x: Offset,
        offset_y: Offset,
        opacity: u8,
    ) -> Result<&mut Self, EditorError> {
        self.current_mut()?
            .watermark(overlay.image(), offset_x, offset_y, opacity)?;
        Ok(self)
    }

    pub fn background(&mut self, color: Color, opacity: u8) -> Result<&mut Self, EditorError> {
        self.current_mut()?.set_background(color, opacity)?;
        Ok(self)
    }

    /// Run a whole spec. A `quality` operation in it becomes the editor's
    /// default quality.
    pub fn apply(&mut self, spec: &TransformSpec) -> Result<&mut Self, EditorError> {
        let cancel = CancelToken::new();
        let ctx = PipelineContext {
            backend: self.backend,
            locator: self.locator,
            default_quality: self.quality,
            cancel: &cancel,
        };
        let image = self.image.as_mut().ok_or(EditorError::NoImage)?;
        self.quality = pipeline::apply::<B>(image, spec, &ctx)?;
        Ok(self)
    }

    /// Encode the current image.
    pub fn render(
        &self,
        format: OutputFormat,
        quality: Option<Quality>,
    ) -> Result<Vec<u8>, EditorError> {
        Ok(self
            .current()?
            .encode(format, quality.unwrap_or(self.quality))?)
    }

    /// Encode the current image to `path`, choosing the format from its
    /// extension. The file appears complete or not at all.
    pub fn save(&self, path: &Path, quality: Option<Quality>) -> Result<(), EditorError> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let format = OutputFormat::from_extension(&extension).ok_or_else(|| {
            BackendError::Unsupported(format!("cannot save as \"{}\"", path.display()))
        })?;
        let quality = quality.unwrap_or(self.quality);
        self.current()?.save(path, format, quality)?;
        debug!(path = %path.display(), quality = quality.value(), "Saved image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::{MockBackend, MockImage};
    use crate::locator::tests::KnownSources;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn backend() -> MockBackend {
        MockBackend::new()
            .with_source("a.jpg", 400, 300)
            .with_source("mark.png", 20, 10)
    }

    fn locator() -> KnownSources {
        KnownSources(vec!["a.jpg", "mark.png"])
    }

    #[test]
    fn operations_need_an_image() {
        let b = backend();
        let l = locator();
        let mut editor = Editor::new(&b, &l);
        assert!(matches!(editor.rotate(90), Err(EditorError::NoImage)));
        assert!(matches!(
            editor.watermark("mark.png", Offset::Center, Offset::Center, 100),
            Err(EditorError::NoImage)
        ));
        assert!(matches!(
            editor.render(OutputFormat::Png, None),
            Err(EditorError::NoImage)
        ));
        assert!(matches!(
            editor.apply(&TransformSpec::new()),
            Err(EditorError::NoImage)
        ));
        assert_eq!(b.decode_count(), 0);
    }

    #[test]
    fn set_image_missing_source() {
        let b = backend();
        let l = locator();
        let mut editor = Editor::new(&b, &l);
        assert!(matches!(
            editor.set_image("missing.jpg"),
            Err(EditorError::NotFound(p)) if p == "missing.jpg"
        ));
        assert!(editor.image().is_none());
    }

    #[test]
    fn chained_operations() {
        let b = backend();
        let l = locator();
        let mut editor = Editor::new(&b, &l);
        editor
            .set_image("a.jpg")
            .unwrap()
            .resize(Some(200), None, None)
            .unwrap()
            .crop(100, 100, Offset::Center, Offset::Center)
            .unwrap()
            .flip(FlipDirection::Horizontal)
            .unwrap();

        assert_eq!(
            editor.dimensions().unwrap(),
            Dimensions {
                width: 100,
                height: 100
            }
        );
        assert_eq!(
            editor.image().unwrap().history,
            vec!["resize 200x150", "crop 100x100+50+25", "flip Horizontal"]
        );
    }

    #[test]
    fn scale_and_crop_is_exact() {
        let b = backend();
        let l = locator();
        let mut editor = Editor::new(&b, &l);
        editor.set_decoded(MockImage::new(1600, 900));
        editor.scale_and_crop(120, 120).unwrap();
        assert_eq!(
            editor.dimensions().unwrap(),
            Dimensions {
                width: 120,
                height: 120
            }
        );
    }

    #[test]
    fn watermark_image_reuses_decoded_overlay() {
        let b = backend();
        let l = locator();

        let mut mark = Editor::new(&b, &l);
        mark.set_image("mark.png").unwrap();
        let mut editor = Editor::new(&b, &l);
        editor.set_image("a.jpg").unwrap();
        assert_eq!(b.decode_count(), 2);

        editor
            .watermark_image(&mark, Offset::End, Offset::End, 60)
            .unwrap();
        assert_eq!(b.decode_count(), 2);
        assert_eq!(editor.image().unwrap().history, vec!["watermark 20x10 60"]);

        // An editor with nothing loaded is not a watermark
        let empty = Editor::new(&b, &l);
        assert!(matches!(
            editor.watermark_image(&empty, Offset::Center, Offset::Center, 100),
            Err(EditorError::Backend(BackendError::MissingWatermark))
        ));
    }

    #[test]
    fn watermark_by_path_decodes_overlay() {
        let b = backend();
        let l = locator();
        let mut editor = Editor::new(&b, &l);
        editor.set_image("a.jpg").unwrap();
        editor
            .watermark("mark.png", Offset::Px(5), Offset::Px(-5), 100)
            .unwrap();
        assert_eq!(b.decode_count(), 2);
        assert!(matches!(
            editor.watermark("nope.png", Offset::Center, Offset::Center, 100),
            Err(EditorError::NotFound(_))
        ));
    }

    #[test]
    fn apply_spec_and_render_with_its_quality() {
        let b = backend();
        let l = locator();
        let mut editor = Editor::new(&b, &l);
        editor.set_image("a.jpg").unwrap();
        let spec = TransformSpec::from_json(&json!({"rotate": 90, "quality": 70})).unwrap();
        editor.apply(&spec).unwrap();

        let bytes = editor.render(OutputFormat::Jpeg, None).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "Jpeg q70 300x400 [rotate 90]");

        let bytes = editor
            .render(OutputFormat::Png, Some(Quality::new(10)))
            .unwrap();
        assert!(String::from_utf8(bytes).unwrap().starts_with("Png q10 "));
    }

    #[test]
    fn save_picks_format_from_extension() {
        let tmp = TempDir::new().unwrap();
        let b = backend();
        let l = locator();
        let mut editor = Editor::new(&b, &l).with_quality(Quality::new(80));
        editor.set_image("a.jpg").unwrap();

        let out = tmp.path().join("out.webp");
        editor.save(&out, None).unwrap();
        assert!(fs::read_to_string(&out).unwrap().starts_with("WebP q80 400x300"));

        let names: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(names.len(), 1, "no temp files left behind");

        assert!(matches!(
            editor.save(&tmp.path().join("out.bmp"), None),
            Err(EditorError::Backend(BackendError::Unsupported(_)))
        ));
    }
}
