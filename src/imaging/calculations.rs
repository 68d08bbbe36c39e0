//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.
//! Backends call them so that every backend agrees on the geometry of a
//! resize, crop or rotation.

use super::backend::Dimensions;
use super::params::{Offset, ResizeMaster};

/// Calculate the output size of a resize.
///
/// # Arguments
/// * `current` - Current image dimensions
/// * `width` / `height` - Requested box; either may be absent
/// * `master` - Which side governs (defaults to [`ResizeMaster::Auto`])
///
/// Rules:
/// - Only one side given: that side governs, the other follows the aspect ratio.
/// - Neither side given: nothing changes.
/// - `Auto` fits inside the box, `Inverse` covers it, `None` stretches to it.
/// - `Width`/`Height` ignore the other side of the box.
/// - Results are rounded and never smaller than 1px.
///
/// # Examples
/// ```
/// # use thumbstore::imaging::{resize_dimensions, Dimensions, ResizeMaster};
/// let src = Dimensions { width: 400, height: 300 };
/// // Fit inside 100x100 → width governs
/// assert_eq!(
///     resize_dimensions(src, Some(100), Some(100), None),
///     Dimensions { width: 100, height: 75 }
/// );
/// // Cover 100x100 → height governs
/// assert_eq!(
///     resize_dimensions(src, Some(100), Some(100), Some(ResizeMaster::Inverse)),
///     Dimensions { width: 133, height: 100 }
/// );
/// ```
pub fn resize_dimensions(
    current: Dimensions,
    width: Option<u32>,
    height: Option<u32>,
    master: Option<ResizeMaster>,
) -> Dimensions {
    let width = width.filter(|&w| w > 0);
    let height = height.filter(|&h| h > 0);
    let master = master.unwrap_or(ResizeMaster::Auto);

    if width.is_none() && height.is_none() {
        return current;
    }

    let cur_w = current.width as f64;
    let cur_h = current.height as f64;

    let (out_w, out_h) = match (master, width, height) {
        (ResizeMaster::None, w, h) => (
            w.map(f64::from).unwrap_or(cur_w),
            h.map(f64::from).unwrap_or(cur_h),
        ),
        // A single given side always governs
        (_, Some(w), None) | (ResizeMaster::Width, Some(w), _) => {
            let w = w as f64;
            (w, cur_h * w / cur_w)
        }
        (_, None, Some(h)) | (ResizeMaster::Height, _, Some(h)) => {
            let h = h as f64;
            (cur_w * h / cur_h, h)
        }
        (ResizeMaster::Precise, Some(w), Some(h)) => {
            let (w, h) = (w as f64, h as f64);
            if w / h > cur_w / cur_h {
                (w, cur_h * w / cur_w)
            } else {
                (cur_w * h / cur_h, h)
            }
        }
        (master, Some(w), Some(h)) => {
            let (w, h) = (w as f64, h as f64);
            let width_ratio_larger = cur_w / w > cur_h / h;
            // Auto: the larger ratio governs (fit). Inverse: the smaller one (cover).
            let width_governs = match master {
                ResizeMaster::Inverse => !width_ratio_larger,
                _ => width_ratio_larger,
            };
            if width_governs {
                (w, cur_h * w / cur_w)
            } else {
                (cur_w * h / cur_h, h)
            }
        }
        (_, None, None) => (cur_w, cur_h),
    };

    Dimensions {
        width: (out_w.round() as u32).max(1),
        height: (out_h.round() as u32).max(1),
    }
}

/// A crop window inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Calculate the window for a crop.
///
/// The requested size is clamped to the image, offsets are resolved per
/// [`Offset::resolve`], and the window is shrunk if the offset pushes it past
/// the far edge. A window is never empty: at least 1×1 when the image is.
pub fn crop_window(
    current: Dimensions,
    width: u32,
    height: u32,
    offset_x: Offset,
    offset_y: Offset,
) -> CropWindow {
    let width = width.clamp(1, current.width.max(1));
    let height = height.clamp(1, current.height.max(1));

    let x = offset_x.resolve(current.width, width).min(current.width.saturating_sub(1));
    let y = offset_y.resolve(current.height, height).min(current.height.saturating_sub(1));

    CropWindow {
        x,
        y,
        width: width.min(current.width - x).max(1),
        height: height.min(current.height - y).max(1),
    }
}

/// Normalize a rotation into the range (-180, 180].
pub fn normalize_degrees(degrees: i32) -> i32 {
    let r = degrees.rem_euclid(360);
    if r > 180 { r - 360 } else { r }
}

/// Bounding box of an image rotated by `degrees` around its center.
pub fn rotated_dimensions(current: Dimensions, degrees: i32) -> Dimensions {
    let radians = (normalize_degrees(degrees) as f64).to_radians();
    let (sin, cos) = (radians.sin().abs(), radians.cos().abs());
    let w = current.width as f64;
    let h = current.height as f64;
    Dimensions {
        width: ((w * cos + h * sin).round() as u32).max(1),
        height: ((w * sin + h * cos).round() as u32).max(1),
    }
}

/// Height of a reflection: the requested height, capped at the image height.
pub fn reflection_height(current: Dimensions, requested: Option<u32>) -> u32 {
    requested
        .filter(|&h| h > 0)
        .map_or(current.height, |h| h.min(current.height))
}
