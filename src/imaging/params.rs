//! Parameter types for export encoding.
//!
//! These describe *what* to write, not *how*: the [`encode`](super::encode)
//! module turns them into encoder calls. Config files store them by their
//! lowercase names.
//!
//! - [`Quality`]: lossy JPEG quality (0-100, default 90). Clamped on construction.
//! - [`ExportFormat`]: target file type.
//! - [`TiffCompression`]: lossless compression scheme for TIFF output.
//! - [`ExportParams`]: the full encoding request for one file.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Quality setting for lossy image encoding (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quality(pub u8);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.min(100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(90)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Jpg,
    Png,
    Tiff,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Jpg => "jpg",
            ExportFormat::Png => "png",
            ExportFormat::Tiff => "tif",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ExportFormat::Jpg),
            "png" => Some(ExportFormat::Png),
            "tif" | "tiff" => Some(ExportFormat::Tiff),
            _ => None,
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::Jpg => "JPEG",
            ExportFormat::Png => "PNG",
            ExportFormat::Tiff => "TIFF",
        })
    }
}

/// Lossless TIFF compression schemes. The numbers are the TIFF tag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TiffCompression {
    None,
    #[default]
    Lzw,
    Deflate,
    Packbits,
}

impl TiffCompression {
    pub fn tag(self) -> u16 {
        match self {
            TiffCompression::None => 1,
            TiffCompression::Lzw => 5,
            TiffCompression::Deflate => 8,
            TiffCompression::Packbits => 32773,
        }
    }
}

/// Everything the encoder needs to write one exported photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportParams {
    pub format: ExportFormat,
    pub quality: Quality,
    pub compression: TiffCompression,
}
