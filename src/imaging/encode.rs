//! Raster writers for exported photos.
//!
//! | Format | Depth | Options |
//! |---|---|---|
//! | JPEG | 8-bit | quality 0-100 |
//! | PNG | 16-bit | none |
//! | TIFF | 16-bit | none / LZW / Deflate / PackBits |

use super::params::{ExportFormat, ExportParams, TiffCompression};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgb32FImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use thiserror::Error;
use tiff::encoder::{TiffEncoder, colortype, compression};

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("TIFF encode failed: {0}")]
    Tiff(#[from] tiff::TiffError),
}

/// Write `image` (values in `0..=1`) to `path` in the requested format.
pub fn write_image(
    image: &Rgb32FImage,
    path: &Path,
    params: &ExportParams,
) -> Result<(), EncodeError> {
    match params.format {
        ExportFormat::Jpg => {
            let rgb = DynamicImage::ImageRgb32F(image.clone()).to_rgb8();
            let writer = BufWriter::new(File::create(path)?);
            JpegEncoder::new_with_quality(writer, params.quality.value()).encode_image(&rgb)?;
        }
        ExportFormat::Png => {
            let rgb = DynamicImage::ImageRgb32F(image.clone()).to_rgb16();
            rgb.save_with_format(path, ImageFormat::Png)?;
        }
        ExportFormat::Tiff => write_tiff16(image, path, params.compression)?,
    }
    Ok(())
}

fn to_u16(image: &Rgb32FImage) -> Vec<u16> {
    image
        .as_raw()
        .iter()
        .map(|&v| (v.clamp(0.0, 1.0) * 65535.0).round() as u16)
        .collect()
}

fn write_tiff16(
    image: &Rgb32FImage,
    path: &Path,
    scheme: TiffCompression,
) -> Result<(), EncodeError> {
    let (w, h) = image.dimensions();
    let data = to_u16(image);
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    match scheme {
        TiffCompression::None => encoder.write_image_with_compression::<colortype::RGB16, _>(
            w,
            h,
            compression::Uncompressed,
            &data,
        )?,
        TiffCompression::Lzw => encoder.write_image_with_compression::<colortype::RGB16, _>(
            w,
            h,
            compression::Lzw,
            &data,
        )?,
        TiffCompression::Deflate => encoder
            .write_image_with_compression::<colortype::RGB16, _>(
                w,
                h,
                compression::Deflate::default(),
                &data,
            )?,
        TiffCompression::Packbits => encoder
            .write_image_with_compression::<colortype::RGB16, _>(
                w,
                h,
                compression::Packbits,
                &data,
            )?,
    }
    Ok(())
}
