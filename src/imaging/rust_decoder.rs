//! Production decoder: RAW sensor files via `rawloader`, raster scans via `image`.
//!
//! ## RAW path
//!
//! | Step | Detail |
//! |---|---|
//! | Read | `rawloader::decode_file` |
//! | Levels | subtract per-colour black level, divide by white - black |
//! | White balance | camera coefficients normalized to green, or explicit multipliers |
//! | Demosaic | bilinear (full size) or superpixel (half size) |
//! | Sensor crop | `crops` from the decoder, scaled for superpixel |
//! | Colour space | camera -> sRGB via the inverted, row-normalized `xyz_to_cam` matrix |
//! | Exposure | multiply by `2^exp_shift` |
//! | Noise | 3x3 median passes (light = thresholded, full = unconditional) |
//! | Transfer | `min(slope * x, x^(1/power))` |
//!
//! ## Raster path
//!
//! Flatbed and camera-scan TIFF/PNG/JPEG files are already demosaiced and
//! encoded; only the exposure shift applies.

use super::decoder::{
    ColourDescription, ColourSpace, DecodeError, DecodeParams, Decoded, Demosaic,
    NoiseReduction, RawDecoder,
};
use image::{ImageReader, Rgb32FImage};
use rayon::prelude::*;
use std::path::Path;

const RAW_EXTENSIONS: &[&str] = &[
    "dng", "nef", "nrw", "cr2", "crw", "arw", "srf", "sr2", "raf", "orf", "rw2", "pef", "srw",
    "mrw", "3fr", "erf", "kdc", "dcr", "mef", "mos", "iiq",
];

const RASTER_EXTENSIONS: &[&str] = &["tif", "tiff", "png", "jpg", "jpeg"];

const SRGB_TO_XYZ: [[f32; 3]; 3] = [
    [0.412_456_4, 0.357_576_1, 0.180_437_5],
    [0.212_672_9, 0.715_152_2, 0.072_175_0],
    [0.019_333_9, 0.119_192_0, 0.950_304_1],
];

/// Every file extension the decoder accepts, RAW first.
pub fn supported_input_extensions() -> impl Iterator<Item = &'static str> {
    RAW_EXTENSIONS.iter().chain(RASTER_EXTENSIONS).copied()
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_supported(path: &Path) -> bool {
    extension(path).is_some_and(|e| supported_input_extensions().any(|s| s == e))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RustDecoder;

impl RustDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl RawDecoder for RustDecoder {
    fn decode(&self, path: &Path, params: &DecodeParams) -> Result<Decoded, DecodeError> {
        let ext = extension(path).unwrap_or_default();
        if RAW_EXTENSIONS.contains(&ext.as_str()) {
            decode_raw(path, params)
        } else if RASTER_EXTENSIONS.contains(&ext.as_str()) {
            decode_raster(path, params)
        } else {
            Err(DecodeError::Unsupported(path.display().to_string()))
        }
    }
}

fn decode_raster(path: &Path, params: &DecodeParams) -> Result<Decoded, DecodeError> {
    let mut image = ImageReader::open(path)?.decode()?.to_rgb32f();
    apply_exposure(&mut image, params.exp_shift);
    Ok(Decoded {
        image,
        colour_desc: ColourDescription("RGB".into()),
    })
}

fn decode_raw(path: &Path, params: &DecodeParams) -> Result<Decoded, DecodeError> {
    if !path.exists() {
        return Err(DecodeError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} not found", path.display()),
        )));
    }
    let raw = rawloader::decode_file(path).map_err(|e| DecodeError::Raw(format!("{e:?}")))?;
    let (width, height) = (raw.width, raw.height);
    if width == 0 || height == 0 {
        return Err(DecodeError::Raw(format!("{}: empty sensor data", path.display())));
    }
    let wb = white_balance(&raw.wb_coeffs, params);
    log::debug!(
        "{}: {}x{} cpp={} wb={:?}",
        path.display(),
        width,
        height,
        raw.cpp,
        wb
    );

    let samples: Vec<f32> = match &raw.data {
        rawloader::RawImageData::Integer(values) => values.iter().map(|&v| v as f32).collect(),
        rawloader::RawImageData::Float(values) => values.clone(),
    };
    let integer = matches!(raw.data, rawloader::RawImageData::Integer(_));
    let level = |value: f32, colour: usize| -> f32 {
        if !integer {
            return value;
        }
        let black = raw.blacklevels[colour] as f32;
        let white = (raw.whitelevels[colour] as f32).max(black + 1.0);
        ((value - black) / (white - black)).max(0.0)
    };

    let (mut image, scale, colour_desc) = if raw.cpp == 3 {
        let mut data = samples;
        data.par_chunks_mut(3).for_each(|px| {
            for (c, v) in px.iter_mut().enumerate() {
                *v = level(*v, c) * wb[c];
            }
        });
        let image = Rgb32FImage::from_raw(width as u32, height as u32, data)
            .ok_or_else(|| DecodeError::Raw("sample count does not match dimensions".into()))?;
        (image, 1, "RGB".to_string())
    } else {
        let cfa = &raw.cfa;
        let mut plane = samples;
        plane.par_chunks_mut(width).enumerate().for_each(|(row, line)| {
            for (col, v) in line.iter_mut().enumerate() {
                let colour = cfa.color_at(row, col);
                *v = level(*v, colour) * wb[colour.min(3)];
            }
        });
        let colour_of = |row: usize, col: usize| fold_green(cfa.color_at(row, col));
        let (image, scale) = match params.demosaic {
            Demosaic::Bilinear => (demosaic_bilinear(&plane, width, height, colour_of)?, 1),
            Demosaic::Superpixel => (demosaic_superpixel(&plane, width, height, colour_of)?, 2),
        };
        let desc = if cfa.name.is_empty() {
            "RGBG".to_string()
        } else {
            cfa.name.clone()
        };
        (image, scale, desc)
    };

    image = apply_sensor_crop(image, raw.crops, scale);

    if params.colour_space == ColourSpace::Srgb {
        match camera_to_srgb(&raw.xyz_to_cam) {
            Some(matrix) => apply_matrix(&mut image, &matrix),
            None => log::debug!("{}: no usable colour matrix, keeping camera RGB", path.display()),
        }
    }
    apply_exposure(&mut image, params.exp_shift);
    reduce_noise(&mut image, params);
    apply_transfer(&mut image, params.raw_gamma);

    Ok(Decoded {
        image,
        colour_desc: ColourDescription(colour_desc),
    })
}

/// Per-CFA-colour multipliers, normalized so green is 1.
fn white_balance(camera: &[f32; 4], params: &DecodeParams) -> [f32; 4] {
    let source = if params.use_camera_wb {
        *camera
    } else {
        params.wb_mult
    };
    let valid = |v: f32| v.is_finite() && v > 0.0;
    let green = if valid(source[1]) { source[1] } else { 1.0 };
    let mut wb = [1.0; 4];
    for (i, out) in wb.iter_mut().enumerate() {
        let v = if valid(source[i]) {
            source[i]
        } else if i == 3 {
            green
        } else {
            1.0
        };
        *out = v / green;
    }
    wb
}

/// CFA colour 3 is the second green (or emerald) site; it feeds the green channel.
fn fold_green(colour: usize) -> usize {
    if colour >= 3 { 1 } else { colour }
}

pub(crate) fn demosaic_bilinear(
    plane: &[f32],
    width: usize,
    height: usize,
    colour_of: impl Fn(usize, usize) -> usize + Sync,
) -> Result<Rgb32FImage, DecodeError> {
    if width == 0 || height == 0 {
        return Err(DecodeError::Raw("empty sensor".into()));
    }
    let mut out = vec![0f32; width * height * 3];
    out.par_chunks_mut(width * 3)
        .enumerate()
        .for_each(|(row, line)| {
            for col in 0..width {
                let own = colour_of(row, col);
                let mut sum = [0f32; 3];
                let mut count = [0u32; 3];
                for r in row.saturating_sub(1)..=(row + 1).min(height - 1) {
                    for c in col.saturating_sub(1)..=(col + 1).min(width - 1) {
                        let ch = colour_of(r, c);
                        sum[ch] += plane[r * width + c];
                        count[ch] += 1;
                    }
                }
                for ch in 0..3 {
                    line[col * 3 + ch] = if ch == own {
                        plane[row * width + col]
                    } else if count[ch] > 0 {
                        sum[ch] / count[ch] as f32
                    } else {
                        0.0
                    };
                }
            }
        });
    Rgb32FImage::from_raw(width as u32, height as u32, out)
        .ok_or_else(|| DecodeError::Raw("demosaic buffer size mismatch".into()))
}

pub(crate) fn demosaic_superpixel(
    plane: &[f32],
    width: usize,
    height: usize,
    colour_of: impl Fn(usize, usize) -> usize + Sync,
) -> Result<Rgb32FImage, DecodeError> {
    let (w, h) = (width / 2, height / 2);
    if w == 0 || h == 0 {
        return Err(DecodeError::Raw("sensor too small for superpixel".into()));
    }
    let mut out = vec![0f32; w * h * 3];
    out.par_chunks_mut(w * 3).enumerate().for_each(|(y, line)| {
        for x in 0..w {
            let mut sum = [0f32; 3];
            let mut count = [0u32; 3];
            for r in 2 * y..2 * y + 2 {
                for c in 2 * x..2 * x + 2 {
                    let ch = colour_of(r, c);
                    sum[ch] += plane[r * width + c];
                    count[ch] += 1;
                }
            }
            for ch in 0..3 {
                line[x * 3 + ch] = if count[ch] > 0 {
                    sum[ch] / count[ch] as f32
                } else {
                    0.0
                };
            }
        }
    });
    Rgb32FImage::from_raw(w as u32, h as u32, out)
        .ok_or_else(|| DecodeError::Raw("superpixel buffer size mismatch".into()))
}

/// `crops` is `[top, right, bottom, left]` in sensor pixels.
fn apply_sensor_crop(image: Rgb32FImage, crops: [usize; 4], scale: usize) -> Rgb32FImage {
    let [top, right, bottom, left] = crops.map(|c| (c / scale) as u32);
    let (w, h) = image.dimensions();
    if left + right >= w || top + bottom >= h || crops == [0; 4] {
        return image;
    }
    image::imageops::crop_imm(&image, left, top, w - left - right, h - top - bottom).to_image()
}

/// Invert a 3x3 matrix; `None` when singular.
fn invert3(m: &[[f32; 3]; 3]) -> Option<[[f32; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < 1e-9 || !det.is_finite() {
        return None;
    }
    let inv_det = 1.0 / det;
    let mut out = [[0f32; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            let (a, b) = ((j + 1) % 3, (j + 2) % 3);
            let (c, d) = ((i + 1) % 3, (i + 2) % 3);
            *v = (m[a][c] * m[b][d] - m[a][d] * m[b][c]) * inv_det;
        }
    }
    Some(out)
}

/// Camera RGB -> sRGB, with rows normalized so camera white stays white.
pub(crate) fn camera_to_srgb(xyz_to_cam: &[[f32; 3]; 4]) -> Option<[[f32; 3]; 3]> {
    let mut rgb_to_cam = [[0f32; 3]; 3];
    for (i, row) in rgb_to_cam.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = (0..3).map(|k| xyz_to_cam[i][k] * SRGB_TO_XYZ[k][j]).sum();
        }
    }
    for row in rgb_to_cam.iter_mut() {
        let sum: f32 = row.iter().sum();
        if sum.abs() < 1e-6 {
            return None;
        }
        row.iter_mut().for_each(|v| *v /= sum);
    }
    invert3(&rgb_to_cam)
}

fn apply_matrix(image: &mut Rgb32FImage, m: &[[f32; 3]; 3]) {
    image.par_chunks_mut(3).for_each(|px| {
        let (r, g, b) = (px[0], px[1], px[2]);
        for (i, out) in px.iter_mut().enumerate() {
            *out = (m[i][0] * r + m[i][1] * g + m[i][2] * b).max(0.0);
        }
    });
}

fn apply_exposure(image: &mut Rgb32FImage, stops: f32) {
    if stops == 0.0 {
        return;
    }
    let gain = 2f32.powf(stops);
    image.par_iter_mut().for_each(|v| *v *= gain);
}

fn reduce_noise(image: &mut Rgb32FImage, params: &DecodeParams) {
    let threshold = match params.noise_reduction {
        NoiseReduction::Off => return,
        NoiseReduction::Light => params.noise_threshold as f32 / 1000.0,
        NoiseReduction::Full => 0.0,
    };
    for _ in 0..params.median_filter_passes.max(1) {
        *image = median3(image, threshold);
    }
}

/// One 3x3 per-channel median pass. Samples closer than `threshold` to the
/// local median are kept.
pub(crate) fn median3(image: &Rgb32FImage, threshold: f32) -> Rgb32FImage {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w == 0 || h == 0 {
        return image.clone();
    }
    let src = image.as_raw();
    let mut out = src.clone();
    out.par_chunks_mut(w * 3).enumerate().for_each(|(row, line)| {
        let mut window = [0f32; 9];
        for col in 0..w {
            for ch in 0..3 {
                let mut n = 0;
                for r in row.saturating_sub(1)..=(row + 1).min(h - 1) {
                    for c in col.saturating_sub(1)..=(col + 1).min(w - 1) {
                        window[n] = src[(r * w + c) * 3 + ch];
                        n += 1;
                    }
                }
                let slice = &mut window[..n];
                slice.sort_unstable_by(f32::total_cmp);
                let median = slice[n / 2];
                let v = &mut line[col * 3 + ch];
                if (*v - median).abs() > threshold {
                    *v = median;
                }
            }
        }
    });
    Rgb32FImage::from_raw(w as u32, h as u32, out).unwrap_or_else(|| image.clone())
}

fn apply_transfer(image: &mut Rgb32FImage, [power, slope]: [f32; 2]) {
    let linear = power <= 1.0 && slope <= 1.0;
    let inv_power = 1.0 / power.max(f32::EPSILON);
    image.par_iter_mut().for_each(|v| {
        let x = v.clamp(0.0, 1.0);
        *v = if linear {
            x
        } else {
            (slope * x).min(x.powf(inv_power))
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn rggb(row: usize, col: usize) -> usize {
        match (row % 2, col % 2) {
            (0, 0) => 0,
            (1, 1) => 2,
            _ => 1,
        }
    }

    #[test]
    fn supported_extensions_cover_raw_and_raster() {
        assert!(is_supported(Path::new("/scans/roll1/frame01.NEF")));
        assert!(is_supported(Path::new("frame.dng")));
        assert!(is_supported(Path::new("flatbed.tif")));
        assert!(!is_supported(Path::new("notes.txt")));
        assert!(!is_supported(Path::new("no_extension")));
    }

    #[test]
    fn unsupported_extension_is_error() {
        let result = RustDecoder::new().decode(Path::new("/tmp/x.txt"), &DecodeParams::default());
        assert!(matches!(result, Err(DecodeError::Unsupported(_))));
    }

    #[test]
    fn missing_raw_is_io_error() {
        let result = RustDecoder::new().decode(
            Path::new("/definitely/not/here.dng"),
            &DecodeParams::default(),
        );
        assert!(matches!(result, Err(DecodeError::Io(_))));
    }

    #[test]
    fn decodes_png_scan() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scan.png");
        RgbImage::from_pixel(8, 6, Rgb([255, 0, 51]))
            .save(&path)
            .unwrap();

        let decoded = RustDecoder::new()
            .decode(&path, &DecodeParams::default())
            .unwrap();
        assert_eq!(decoded.image.dimensions(), (8, 6));
        assert_eq!(decoded.colour_desc.to_string(), "RGB");
        let px = decoded.image.get_pixel(3, 3);
        assert!((px[0] - 1.0).abs() < 1e-6);
        assert!((px[2] - 0.2).abs() < 1e-3);
    }

    #[test]
    fn raster_exposure_shift_doubles() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scan.png");
        RgbImage::from_pixel(2, 2, Rgb([51, 51, 51]))
            .save(&path)
            .unwrap();
        let params = DecodeParams {
            exp_shift: 1.0,
            ..Default::default()
        };
        let decoded = RustDecoder::new().decode(&path, &params).unwrap();
        assert!((decoded.image.get_pixel(0, 0)[0] - 0.4).abs() < 1e-3);
    }

    #[test]
    fn corrupt_raster_is_image_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.jpg");
        std::fs::write(&path, b"not a jpeg").unwrap();
        let result = RustDecoder::new().decode(&path, &DecodeParams::default());
        assert!(matches!(result, Err(DecodeError::Image(_))));
    }

    #[test]
    fn white_balance_normalizes_to_green() {
        let wb = white_balance(&[2.0, 1.0, 1.5, f32::NAN], &DecodeParams::default());
        assert_eq!(wb, [2.0, 1.0, 1.5, 1.0]);

        let explicit = DecodeParams {
            use_camera_wb: false,
            wb_mult: [1.0, 2.0, 4.0, 2.0],
            ..Default::default()
        };
        assert_eq!(white_balance(&[9.0; 4], &explicit), [0.5, 1.0, 2.0, 1.0]);
    }

    #[test]
    fn bilinear_on_grey_mosaic_is_grey() {
        let (w, h) = (6, 4);
        let plane = vec![0.5f32; w * h];
        let img = demosaic_bilinear(&plane, w, h, rggb).unwrap();
        assert_eq!(img.dimensions(), (6, 4));
        assert!(img.pixels().all(|p| p.0.iter().all(|&v| (v - 0.5).abs() < 1e-6)));
    }

    #[test]
    fn bilinear_keeps_native_sample() {
        let (w, h) = (4, 4);
        let plane: Vec<f32> = (0..w * h)
            .map(|i| match rggb(i / w, i % w) {
                0 => 0.9,
                1 => 0.5,
                _ => 0.1,
            })
            .collect();
        let img = demosaic_bilinear(&plane, w, h, rggb).unwrap();
        let px = img.get_pixel(1, 1); // blue site
        assert!((px[2] - 0.1).abs() < 1e-6);
        assert!((px[0] - 0.9).abs() < 1e-6);
        assert!((px[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn superpixel_halves_resolution() {
        let (w, h) = (8, 6);
        let plane: Vec<f32> = (0..w * h)
            .map(|i| if rggb(i / w, i % w) == 0 { 1.0 } else { 0.0 })
            .collect();
        let img = demosaic_superpixel(&plane, w, h, rggb).unwrap();
        assert_eq!(img.dimensions(), (4, 3));
        assert_eq!(img.get_pixel(2, 1).0, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn sensor_crop_removes_margins() {
        let img = Rgb32FImage::new(20, 10);
        let cropped = apply_sensor_crop(img, [1, 2, 3, 4], 1);
        assert_eq!(cropped.dimensions(), (14, 6));
    }

    #[test]
    fn sensor_crop_ignores_impossible_values() {
        let img = Rgb32FImage::new(20, 10);
        let cropped = apply_sensor_crop(img, [5, 0, 5, 0], 1);
        assert_eq!(cropped.dimensions(), (20, 10));
    }

    #[test]
    fn camera_matrix_for_srgb_camera_is_identity() {
        // A camera whose native primaries are sRGB has xyz_to_cam = inverse(SRGB_TO_XYZ).
        let inv = invert3(&SRGB_TO_XYZ).unwrap();
        let xyz_to_cam = [inv[0], inv[1], inv[2], [0.0; 3]];
        let m = camera_to_srgb(&xyz_to_cam).unwrap();
        for (i, row) in m.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((v - expected).abs() < 1e-3, "m[{i}][{j}] = {v}");
            }
        }
    }

    #[test]
    fn zero_matrix_is_unusable() {
        assert!(camera_to_srgb(&[[0.0; 3]; 4]).is_none());
    }

    #[test]
    fn median_removes_hot_pixel() {
        let mut img = Rgb32FImage::from_pixel(5, 5, image::Rgb([0.2, 0.2, 0.2]));
        img.put_pixel(2, 2, image::Rgb([1.0, 1.0, 1.0]));
        let out = median3(&img, 0.1);
        assert!((out.get_pixel(2, 2)[0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn median_threshold_keeps_small_deviation() {
        let mut img = Rgb32FImage::from_pixel(5, 5, image::Rgb([0.2, 0.2, 0.2]));
        img.put_pixel(2, 2, image::Rgb([0.25, 0.25, 0.25]));
        let out = median3(&img, 0.1);
        assert!((out.get_pixel(2, 2)[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn linear_transfer_is_identity() {
        let mut img = Rgb32FImage::from_pixel(2, 2, image::Rgb([0.3, 0.6, 0.9]));
        apply_transfer(&mut img, [1.0, 1.0]);
        assert_eq!(img.get_pixel(0, 0).0, [0.3, 0.6, 0.9]);
    }

    #[test]
    fn gamma_transfer_brightens_midtones() {
        let mut img = Rgb32FImage::from_pixel(1, 1, image::Rgb([0.18, 0.18, 0.18]));
        apply_transfer(&mut img, [2.222, 4.5]);
        let v = img.get_pixel(0, 0)[0];
        assert!(v > 0.4 && v < 0.5, "got {v}");
    }
}
