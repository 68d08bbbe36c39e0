//! Parameter types for image operations.
//!
//! These types describe *what* to do, not *how* to do it. They are the
//! vocabulary shared by the [`transform`](crate::transform) parser, the
//! [`pipeline`](crate::pipeline) executor and the
//! [`backend`](super::backend) that does the actual pixel work.
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100). Clamped on construction.
//! - [`Sharpening`]: Unsharp-mask parameters derived from a 1–100 amount.
//! - [`ResizeMaster`]: Which dimension governs a resize.
//! - [`FlipDirection`]: Horizontal or vertical mirror.
//! - [`Offset`]: Placement of a crop window or watermark along one axis.
//! - [`Color`]: Opaque RGB fill color parsed from hex.
//! - [`OutputFormat`]: Encoded output format, chosen by file extension.

use std::fmt;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

/// Sharpening parameters for unsharp mask.
///
/// - `sigma`: Standard deviation of the Gaussian blur (higher = more sharpening)
/// - `threshold`: Minimum brightness difference to sharpen (0 = sharpen all pixels)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sharpening {
    pub sigma: f32,
    pub threshold: i32,
}

impl Sharpening {
    /// Map a 1–100 sharpen amount onto unsharp-mask parameters.
    ///
    /// Amount 1 is barely visible (sigma 0.5), amount 100 is strong (sigma 3.0).
    pub fn from_amount(amount: u32) -> Self {
        let amount = amount.clamp(1, 100) as f32;
        Self {
            sigma: 0.5 + (amount - 1.0) * 2.5 / 99.0,
            threshold: 0,
        }
    }
}

/// Which side of the target box governs a resize.
///
/// The numeric codes are the ones accepted in transform specs
/// (`"master": 5` is the same as `"master": "inverse"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResizeMaster {
    /// Use the given width and height as-is, ignoring aspect ratio.
    None,
    /// Width governs; height follows the aspect ratio.
    Width,
    /// Height governs; width follows the aspect ratio.
    Height,
    /// Fit inside the box (the larger ratio governs).
    Auto,
    /// Cover the box (the smaller ratio governs).
    Inverse,
    /// Cover the box, computed from the aspect ratio of the box itself.
    Precise,
}

impl ResizeMaster {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0x01 => Some(Self::None),
            0x02 => Some(Self::Width),
            0x03 => Some(Self::Height),
            0x04 => Some(Self::Auto),
            0x05 => Some(Self::Inverse),
            0x06 => Some(Self::Precise),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "width" => Some(Self::Width),
            "height" => Some(Self::Height),
            "auto" => Some(Self::Auto),
            "inverse" => Some(Self::Inverse),
            "precise" => Some(Self::Precise),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Width => "width",
            Self::Height => "height",
            Self::Auto => "auto",
            Self::Inverse => "inverse",
            Self::Precise => "precise",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlipDirection {
    Horizontal,
    Vertical,
}

impl FlipDirection {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0x11 => Some(Self::Horizontal),
            0x12 => Some(Self::Vertical),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "horizontal" | "h" => Some(Self::Horizontal),
            "vertical" | "v" => Some(Self::Vertical),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Horizontal => "horizontal",
            Self::Vertical => "vertical",
        }
    }
}

/// Position of a crop window or overlay along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Offset {
    /// Centered in the available space.
    #[default]
    Center,
    /// Flush with the far edge (right or bottom).
    End,
    /// Pixels from the near edge; negative values count back from the far edge.
    Px(i32),
}

impl Offset {
    /// Resolve to a concrete start coordinate for a `size`-wide window inside
    /// a `total`-wide image. The window is assumed to fit (`size <= total`).
    pub fn resolve(self, total: u32, size: u32) -> u32 {
        let room = total.saturating_sub(size);
        match self {
            Offset::Center => room.div_ceil(2),
            Offset::End => room,
            Offset::Px(px) if px < 0 => room.saturating_sub(px.unsigned_abs()),
            Offset::Px(px) => (px as u32).min(total),
        }
    }
}

/// Opaque RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    /// Parse `#rgb`, `#rrggbb`, `rgb` or `rrggbb`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().trim_start_matches('#');
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let expanded: String = match hex.len() {
            3 => hex.chars().flat_map(|c| [c, c]).collect(),
            6 => hex.to_string(),
            _ => return None,
        };
        let channel = |i: usize| u8::from_str_radix(&expanded[i..i + 2], 16).ok();
        Some(Self {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
        })
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Encoded output format of a derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
    Tiff,
    Avif,
}

impl OutputFormat {
    /// Format for a file extension (case-insensitive, without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "jpe" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::WebP),
            "tif" | "tiff" => Some(Self::Tiff),
            "avif" => Some(Self::Avif),
            _ => None,
        }
    }

}
