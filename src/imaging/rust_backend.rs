//! Pure Rust image processing backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, GIF, TIFF, WebP) | `image::ImageReader` with format sniffing |
//! | Resize | `DynamicImage::resize_exact` with `Lanczos3`, size from [`resize_dimensions`] |
//! | Crop | `DynamicImage::crop_imm`, window from [`crop_window`] |
//! | Rotate | `rotate90/180/270` for right angles, bilinear resampling otherwise |
//! | Flip | `fliph` / `flipv` |
//! | Sharpen | `DynamicImage::unsharpen` |
//! | Reflection, watermark, background | RGBA compositing, `imageops::overlay` |
//! | Encode → JPEG | `JpegEncoder::new_with_quality` |
//! | Encode → AVIF | `AvifEncoder` (rav1e, speed 6) |
//! | Encode → PNG, GIF, WebP, TIFF | `DynamicImage::write_to` (lossless, quality ignored) |
//!
//! Resize, rotate and reflection refuse to build a canvas larger than the
//! backend's pixel limit ([`DEFAULT_MAX_PIXELS`] unless configured), so a spec
//! asking for a huge output fails with [`BackendError::Unsupported`] instead
//! of exhausting memory.

use super::backend::{BackendError, Dimensions, ImageBackend, ImageHandle};
use super::calculations::{
    crop_window, normalize_degrees, reflection_height, resize_dimensions, rotated_dimensions,
};
use super::params::{
    Color, FlipDirection, Offset, OutputFormat, Quality, ResizeMaster, Sharpening,
};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::Path;

/// Largest canvas, in pixels, an operation may produce (50 megapixels).
pub const DEFAULT_MAX_PIXELS: u64 = 50_000_000;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
#[derive(Debug, Clone)]
pub struct RustBackend {
    max_pixels: u64,
}

impl RustBackend {
    pub fn new() -> Self {
        Self {
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }

    /// Limit the size of every canvas built by images this backend decodes.
    pub fn with_max_pixels(mut self, max_pixels: u64) -> Self {
        self.max_pixels = max_pixels;
        self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded image owned by the pipeline.
#[derive(Debug, Clone)]
pub struct RustImage {
    image: DynamicImage,
    max_pixels: u64,
}

impl RustImage {
    /// Wrap an image, with the [`DEFAULT_MAX_PIXELS`] limit.
    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self {
            image,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.image
    }

    /// Fail before allocating a canvas of `target` size past the limit.
    fn ensure_within_limit(&self, target: Dimensions) -> Result<(), BackendError> {
        if target.pixels() > self.max_pixels {
            return Err(BackendError::Unsupported(format!(
                "output of {}x{} exceeds the limit of {} pixels",
                target.width, target.height, self.max_pixels
            )));
        }
        Ok(())
    }
}

/// Load and decode an image from disk.
fn load_image(path: &Path) -> Result<DynamicImage, BackendError> {
    ImageReader::open(path)
        .map_err(BackendError::Io)?
        .with_guessed_format()
        .map_err(BackendError::Io)?
        .decode()
        .map_err(|e| {
            BackendError::ProcessingFailed(format!("Failed to decode {}: {}", path.display(), e))
        })
}

impl ImageBackend for RustBackend {
    type Image = RustImage;

    fn name(&self) -> &'static str {
        "rust"
    }

    fn decode(&self, path: &Path) -> Result<RustImage, BackendError> {
        Ok(RustImage {
            image: load_image(path)?,
            max_pixels: self.max_pixels,
        })
    }
}

/// Scale an alpha channel value by a percentage.
fn scale_alpha(alpha: u8, factor: f32) -> u8 {
    (alpha as f32 * factor.clamp(0.0, 1.0)).round() as u8
}

fn percent(opacity: u8) -> f32 {
    opacity.min(100) as f32 / 100.0
}

/// Rotate by an arbitrary angle (clockwise) onto a transparent canvas large
/// enough to hold the whole image.
fn rotate_arbitrary(src: &RgbaImage, degrees: i32) -> RgbaImage {
    let out = rotated_dimensions(
        Dimensions {
            width: src.width(),
            height: src.height(),
        },
        degrees,
    );
    let radians = (degrees as f32).to_radians();
    let (sin, cos) = radians.sin_cos();
    let (src_cx, src_cy) = (src.width() as f32 / 2.0, src.height() as f32 / 2.0);
    let (out_cx, out_cy) = (out.width as f32 / 2.0, out.height as f32 / 2.0);

    RgbaImage::from_fn(out.width, out.height, |x, y| {
        let dx = x as f32 + 0.5 - out_cx;
        let dy = y as f32 + 0.5 - out_cy;
        // Inverse of a clockwise rotation in y-down coordinates
        let sx = dx * cos + dy * sin + src_cx - 0.5;
        let sy = -dx * sin + dy * cos + src_cy - 0.5;
        sample_bilinear(src, sx, sy)
    })
}

/// Bilinear sample; points outside the source are transparent.
fn sample_bilinear(src: &RgbaImage, x: f32, y: f32) -> Rgba<u8> {
    let (w, h) = (src.width() as f32, src.height() as f32);
    if x < -0.5 || y < -0.5 || x > w - 0.5 || y > h - 0.5 {
        return Rgba([0, 0, 0, 0]);
    }
    let x = x.clamp(0.0, w - 1.0);
    let y = y.clamp(0.0, h - 1.0);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(src.width() - 1), (y0 + 1).min(src.height() - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let p00 = src.get_pixel(x0, y0).0;
    let p10 = src.get_pixel(x1, y0).0;
    let p01 = src.get_pixel(x0, y1).0;
    let p11 = src.get_pixel(x1, y1).0;

    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

/// Encode with a format whose quality setting is ignored. Pixel layout is
/// normalized to 8-bit RGB(A), which every one of these encoders accepts.
fn write_lossless(
    image: &DynamicImage,
    buf: &mut Cursor<Vec<u8>>,
    format: ImageFormat,
) -> Result<(), image::ImageError> {
    let normalized = if image.color().has_alpha() {
        DynamicImage::ImageRgba8(image.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    };
    normalized.write_to(buf, format)
}

impl ImageHandle for RustImage {
    fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.image.width(),
            height: self.image.height(),
        }
    }

    fn resize(
        &mut self,
        width: Option<u32>,
        height: Option<u32>,
        master: Option<ResizeMaster>,
    ) -> Result<(), BackendError> {
        let current = self.dimensions();
        let target = resize_dimensions(current, width, height, master);
        if target != current {
            self.ensure_within_limit(target)?;
            self.image = self
                .image
                .resize_exact(target.width, target.height, FilterType::Lanczos3);
        }
        Ok(())
    }

    fn crop(
        &mut self,
        width: u32,
        height: u32,
        offset_x: Offset,
        offset_y: Offset,
    ) -> Result<(), BackendError> {
        let window = crop_window(self.dimensions(), width, height, offset_x, offset_y);
        self.image = self
            .image
            .crop_imm(window.x, window.y, window.width, window.height);
        Ok(())
    }

    fn rotate(&mut self, degrees: i32) -> Result<(), BackendError> {
        self.image = match normalize_degrees(degrees) {
            0 => return Ok(()),
            90 => self.image.rotate90(),
            180 => self.image.rotate180(),
            -90 => self.image.rotate270(),
            other => {
                self.ensure_within_limit(rotated_dimensions(self.dimensions(), other))?;
                DynamicImage::ImageRgba8(rotate_arbitrary(&self.image.to_rgba8(), other))
            }
        };
        Ok(())
    }

    fn flip(&mut self, direction: FlipDirection) -> Result<(), BackendError> {
        self.image = match direction {
            FlipDirection::Horizontal => self.image.fliph(),
            FlipDirection::Vertical => self.image.flipv(),
        };
        Ok(())
    }

    fn sharpen(&mut self, amount: u32) -> Result<(), BackendError> {
        let sharpening = Sharpening::from_amount(amount);
        self.image = self.image.unsharpen(sharpening.sigma, sharpening.threshold);
        Ok(())
    }

    fn reflect(
        &mut self,
        height: Option<u32>,
        opacity: u8,
        fade_in: bool,
    ) -> Result<(), BackendError> {
        let rh = reflection_height(self.dimensions(), height);
        self.ensure_within_limit(Dimensions {
            width: self.image.width(),
            height: self.image.height().saturating_add(rh),
        })?;
        let src = self.image.to_rgba8();
        let (w, h) = src.dimensions();
        let strength = percent(opacity);

        let mut out = RgbaImage::new(w, h + rh);
        image::imageops::replace(&mut out, &src, 0, 0);
        for i in 0..rh {
            // Fade over the reflected rows: strong next to the image unless fading in
            let progress = if rh > 1 { i as f32 / (rh - 1) as f32 } else { 0.0 };
            let factor = strength * if fade_in { progress } else { 1.0 - progress };
            let src_row = h - 1 - i;
            for x in 0..w {
                let mut px = *src.get_pixel(x, src_row);
                px.0[3] = scale_alpha(px.0[3], factor);
                out.put_pixel(x, h + i, px);
            }
        }
        self.image = DynamicImage::ImageRgba8(out);
        Ok(())
    }

    fn watermark(
        &mut self,
        overlay: Option<&Self>,
        offset_x: Offset,
        offset_y: Offset,
        opacity: u8,
    ) -> Result<(), BackendError> {
        let overlay = overlay.ok_or(BackendError::MissingWatermark)?;
        let mut mark = overlay.image.to_rgba8();
        let factor = percent(opacity);
        if factor < 1.0 {
            for px in mark.pixels_mut() {
                px.0[3] = scale_alpha(px.0[3], factor);
            }
        }

        let mut base = self.image.to_rgba8();
        let x = offset_x.resolve(base.width(), mark.width());
        let y = offset_y.resolve(base.height(), mark.height());
        image::imageops::overlay(&mut base, &mark, x as i64, y as i64);
        self.image = DynamicImage::ImageRgba8(base);
        Ok(())
    }

    fn set_background(&mut self, color: Color, opacity: u8) -> Result<(), BackendError> {
        let src = self.image.to_rgba8();
        let alpha = scale_alpha(255, percent(opacity));
        let fill = Rgba([color.r, color.g, color.b, alpha]);
        let mut canvas = RgbaImage::from_pixel(src.width(), src.height(), fill);
        image::imageops::overlay(&mut canvas, &src, 0, 0);
        self.image = DynamicImage::ImageRgba8(canvas);
        Ok(())
    }

    fn encode(&self, format: OutputFormat, quality: Quality) -> Result<Vec<u8>, BackendError> {
        let mut buf = Cursor::new(Vec::new());
        let failed = |e: image::ImageError| {
            BackendError::ProcessingFailed(format!("{:?} encode failed: {}", format, e))
        };

        match format {
            OutputFormat::Jpeg => {
                let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                    &mut buf,
                    quality.value() as u8,
                );
                DynamicImage::ImageRgb8(self.image.to_rgb8())
                    .write_with_encoder(encoder)
                    .map_err(failed)?;
            }
            OutputFormat::Avif => {
                // speed=6 for reasonable throughput
                let encoder = image::codecs::avif::AvifEncoder::new_with_speed_quality(
                    &mut buf,
                    6,
                    quality.value() as u8,
                );
                DynamicImage::ImageRgba8(self.image.to_rgba8())
                    .write_with_encoder(encoder)
                    .map_err(failed)?;
            }
            OutputFormat::Png => {
                write_lossless(&self.image, &mut buf, ImageFormat::Png).map_err(failed)?
            }
            OutputFormat::Gif => {
                write_lossless(&self.image, &mut buf, ImageFormat::Gif).map_err(failed)?
            }
            OutputFormat::WebP => {
                write_lossless(&self.image, &mut buf, ImageFormat::WebP).map_err(failed)?
            }
            OutputFormat::Tiff => {
                write_lossless(&self.image, &mut buf, ImageFormat::Tiff).map_err(failed)?
            }
        }

        Ok(buf.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageEncoder, RgbImage};

    /// Create a small valid JPEG file with the given dimensions.
    fn create_test_jpeg(path: &Path, width: u32, height: u32) {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let file = std::fs::File::create(path).unwrap();
        let writer = std::io::BufWriter::new(file);
        image::codecs::jpeg::JpegEncoder::new(writer)
            .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
    }

    fn solid(width: u32, height: u32, px: [u8; 4]) -> RustImage {
        RustImage::from_dynamic(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba(px),
        )))
    }

    fn dims(image: &RustImage) -> (u32, u32) {
        let d = image.dimensions();
        (d.width, d.height)
    }

    #[test]
    fn decode_synthetic_jpeg() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("test.jpg");
        create_test_jpeg(&path, 200, 150);

        let image = RustBackend::new().decode(&path).unwrap();
        assert_eq!(dims(&image), (200, 150));
    }

    #[test]
    fn decode_sniffs_format_despite_extension() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("actually-a-jpeg.png");
        create_test_jpeg(&path, 40, 30);

        let image = RustBackend::new().decode(&path).unwrap();
        assert_eq!(dims(&image), (40, 30));
    }

    #[test]
    fn decode_nonexistent_file_errors() {
        let result = RustBackend::new().decode(Path::new("/nonexistent/image.jpg"));
        assert!(matches!(result, Err(BackendError::Io(_))));
    }

    #[test]
    fn decode_garbage_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not an image").unwrap();
        assert!(RustBackend::new().decode(&path).is_err());
    }

    #[test]
    fn resize_and_crop_change_dimensions() {
        let mut image = solid(400, 300, [10, 20, 30, 255]);
        image.resize(Some(200), Some(200), None).unwrap();
        assert_eq!(dims(&image), (200, 150));
        image
            .crop(100, 100, Offset::Center, Offset::End)
            .unwrap();
        assert_eq!(dims(&image), (100, 100));
    }

    #[test]
    fn oversized_resize_fails_before_allocating() {
        let mut image = solid(4, 4, [0, 0, 0, 255]);
        let huge = Some(4_000_000_000);
        let result = image.resize(huge, huge, Some(ResizeMaster::None));
        assert!(matches!(result, Err(BackendError::Unsupported(_))));
        assert_eq!(dims(&image), (4, 4));

        // Cover-fit on a wide image: the short side governs and the long one explodes
        let mut wide = solid(100, 1, [0, 0, 0, 255]);
        let cover = wide.resize(Some(100_000), Some(100_000), Some(ResizeMaster::Inverse));
        assert!(cover.is_err());
    }

    #[test]
    fn pixel_limit_is_configurable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("test.jpg");
        create_test_jpeg(&path, 40, 30);

        let backend = RustBackend::new().with_max_pixels(10_000);
        let mut image = backend.decode(&path).unwrap();
        image.resize(Some(100), None, None).unwrap();
        assert_eq!(dims(&image), (100, 75));
        assert!(image.resize(Some(200), None, None).is_err());
        assert!(image.reflect(None, 100, false).is_err());
        assert!(image.rotate(45).is_err());
        assert_eq!(dims(&image), (100, 75));
    }

    #[test]
    fn rotate_right_angles_and_arbitrary() {
        let mut image = solid(300, 200, [0, 0, 0, 255]);
        image.rotate(90).unwrap();
        assert_eq!(dims(&image), (200, 300));
        image.rotate(-450).unwrap();
        assert_eq!(dims(&image), (300, 200));

        let mut square = solid(100, 100, [255, 0, 0, 255]);
        square.rotate(45).unwrap();
        assert_eq!(dims(&square), (141, 141));
        let rgba = square.as_dynamic().to_rgba8();
        // Corners of the enlarged canvas are transparent, the center is not
        assert_eq!(rgba.get_pixel(0, 0).0[3], 0);
        assert_eq!(rgba.get_pixel(70, 70).0, [255, 0, 0, 255]);
    }

    #[test]
    fn flip_horizontal_mirrors_columns() {
        let mut rgba = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 255]));
        rgba.put_pixel(0, 0, Rgba([255, 255, 255, 255]));
        let mut image = RustImage::from_dynamic(DynamicImage::ImageRgba8(rgba));
        image.flip(FlipDirection::Horizontal).unwrap();
        let out = image.as_dynamic().to_rgba8();
        assert_eq!(out.get_pixel(1, 0).0, [255, 255, 255, 255]);
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 255]);
    }

    #[test]
    fn sharpen_keeps_dimensions() {
        let mut image = solid(50, 40, [100, 100, 100, 255]);
        image.sharpen(80).unwrap();
        assert_eq!(dims(&image), (50, 40));
    }

    #[test]
    fn reflection_appends_fading_rows() {
        let mut image = solid(20, 10, [0, 0, 255, 255]);
        image.reflect(Some(5), 100, false).unwrap();
        assert_eq!(dims(&image), (20, 15));
        let rgba = image.as_dynamic().to_rgba8();
        assert_eq!(rgba.get_pixel(0, 10).0[3], 255);
        assert_eq!(rgba.get_pixel(0, 14).0[3], 0);

        let mut faded_in = solid(20, 10, [0, 0, 255, 255]);
        faded_in.reflect(None, 50, true).unwrap();
        assert_eq!(dims(&faded_in), (20, 20));
        let rgba = faded_in.as_dynamic().to_rgba8();
        assert_eq!(rgba.get_pixel(0, 10).0[3], 0);
        assert_eq!(rgba.get_pixel(0, 19).0[3], 128);
    }

    #[test]
    fn watermark_composites_at_offset() {
        let mut image = solid(100, 100, [0, 0, 0, 255]);
        let mark = solid(10, 10, [255, 255, 255, 255]);
        image
            .watermark(Some(&mark), Offset::End, Offset::End, 100)
            .unwrap();
        let rgba = image.as_dynamic().to_rgba8();
        assert_eq!(rgba.get_pixel(95, 95).0, [255, 255, 255, 255]);
        assert_eq!(rgba.get_pixel(50, 50).0, [0, 0, 0, 255]);
    }

    #[test]
    fn watermark_without_overlay_errors() {
        let mut image = solid(10, 10, [0, 0, 0, 255]);
        let result = image.watermark(None, Offset::Center, Offset::Center, 100);
        assert!(matches!(result, Err(BackendError::MissingWatermark)));
    }

    #[test]
    fn background_fills_transparent_pixels() {
        let mut image = solid(4, 4, [0, 0, 0, 0]);
        let white = Color::from_hex("#fff").unwrap();
        image.set_background(white, 100).unwrap();
        let rgba = image.as_dynamic().to_rgba8();
        assert_eq!(rgba.get_pixel(1, 1).0, [255, 255, 255, 255]);
    }

    #[test]
    fn encode_jpeg_and_png_decode_back() {
        let image = solid(32, 24, [10, 200, 30, 255]);
        for format in [OutputFormat::Jpeg, OutputFormat::Png, OutputFormat::Gif] {
            let bytes = image.encode(format, Quality::new(85)).unwrap();
            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (32, 24), "{format:?}");
        }
    }

    #[test]
    fn jpeg_quality_changes_output_size() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("source.jpg");
        create_test_jpeg(&path, 256, 256);
        let image = RustBackend::new().decode(&path).unwrap();

        let low = image.encode(OutputFormat::Jpeg, Quality::new(10)).unwrap();
        let high = image.encode(OutputFormat::Jpeg, Quality::new(100)).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn save_writes_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let output = tmp.path().join("out.png");
        solid(8, 8, [1, 2, 3, 255])
            .save(&output, OutputFormat::Png, Quality::new(100))
            .unwrap();
        assert!(std::fs::metadata(&output).unwrap().len() > 0);
    }
}
