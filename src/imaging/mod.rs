//! Image capability: decode, transform, encode.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Decode** | `image::ImageReader` |
//! | **Resize / crop geometry** | [`calculations`] (pure) |
//! | **Pixel work** | `image::imageops` + RGBA compositing |
//! | **Encode** | `image` codecs (JPEG quality, AVIF via rav1e) |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing image operations
//! - **Backend**: [`ImageBackend`] / [`ImageHandle`] traits + [`RustBackend`]

pub mod backend;
mod calculations;
mod params;
pub mod rust_backend;

pub use backend::{BackendError, Dimensions, ImageBackend, ImageHandle};
pub use calculations::{CropWindow, crop_window, resize_dimensions};
pub use params::{
    Color, FlipDirection, Offset, OutputFormat, Quality, ResizeMaster, Sharpening,
};
pub use rust_backend::{RustBackend, RustImage};
