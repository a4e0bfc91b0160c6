//! Pixel I/O: decoding sources and encoding exports.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **RAW decode** | `rawloader` + bilinear/superpixel demosaic |
//! | **Raster decode** | `image::ImageReader` |
//! | **JPEG / PNG export** | `image` codecs |
//! | **TIFF export** | `tiff` encoder with selectable compression |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for size and sampling math (unit testable)
//! - **Parameters**: Data structures describing export encoding
//! - **Decoder**: [`RawDecoder`] trait + [`RustDecoder`]
//! - **Encode**: [`write_image`]

pub mod calculations;
pub mod decoder;
pub mod encode;
mod params;
pub mod rust_decoder;

pub use decoder::{
    ColourDescription, ColourSpace, DecodeError, DecodeParams, Decoded, Demosaic,
    NoiseReduction, RawDecoder,
};
pub use encode::{EncodeError, write_image};
pub use params::{ExportFormat, ExportParams, Quality, TiffCompression};
pub use rust_decoder::{RustDecoder, is_supported, supported_input_extensions};
