//! RAW decoding capability.
//!
//! The [`RawDecoder`] trait is the single seam between the pipeline and the
//! pixel source. Production code uses
//! [`RustDecoder`](super::rust_decoder::RustDecoder); tests use the
//! `MockDecoder` in this module's `tests`, which hands out synthetic frames and
//! records every call.
//!
//! Decoded buffers are `Rgb32FImage`s with values in `0..=1`, already
//! demosaiced, white balanced and tone encoded according to [`DecodeParams`].

use image::Rgb32FImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("RAW decode failed: {0}")]
    Raw(String),
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Demosaicing algorithm for Bayer sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Demosaic {
    /// Neighbour averaging at full sensor resolution.
    #[default]
    Bilinear,
    /// One output pixel per 2x2 CFA block (half resolution, no interpolation).
    Superpixel,
}

/// Colour space of the decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColourSpace {
    /// Camera-native primaries.
    Raw,
    #[default]
    Srgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseReduction {
    #[default]
    Off,
    /// Median passes that only replace samples deviating more than
    /// `noise_threshold`.
    Light,
    /// Unconditional median passes.
    Full,
}

/// Parameters handed to the decoder with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecodeParams {
    pub demosaic: Demosaic,
    pub colour_space: ColourSpace,
    /// Output transfer curve as `[power, toe slope]`. `[1.0, 1.0]` is linear.
    pub raw_gamma: [f32; 2],
    /// Exposure shift in stops.
    pub exp_shift: f32,
    pub noise_reduction: NoiseReduction,
    /// Light noise reduction threshold, in thousandths of full scale.
    pub noise_threshold: u32,
    pub median_filter_passes: u32,
    pub use_camera_wb: bool,
    /// Explicit multipliers in CFA order (R, G, B, G2); used when
    /// `use_camera_wb` is off.
    pub wb_mult: [f32; 4],
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            demosaic: Demosaic::Bilinear,
            colour_space: ColourSpace::Srgb,
            raw_gamma: [2.222, 4.5],
            exp_shift: 0.0,
            noise_reduction: NoiseReduction::Off,
            noise_threshold: 100,
            median_filter_passes: 1,
            use_camera_wb: true,
            wb_mult: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

/// Sensor colour description reported by the decoder, e.g. `RGGB` for a
/// Bayer sensor or `RGB` for a raster scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColourDescription(pub String);

impl fmt::Display for ColourDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of a successful decode.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub image: Rgb32FImage,
    pub colour_desc: ColourDescription,
}

/// The external RAW-decoding capability.
///
/// Implementations must be shareable across the loader and export pools.
pub trait RawDecoder: Send + Sync {
    fn decode(&self, path: &Path, params: &DecodeParams) -> Result<Decoded, DecodeError>;
}
