//! Film base neutralization, inversion and white balance.
//!
//! Negatives are converted to density relative to the film base
//! (`log10(base / px)`), which removes the orange mask and inverts in one
//! step. Every film type is then stretched per channel between the configured
//! black and white percentiles.

use super::luminance;
use crate::imaging::calculations::{PixelRect, percentile};
use crate::settings::{BaseDetect, FilmType, SettingsProfile};
use image::{Rgb, Rgb32FImage};
use rayon::prelude::*;

const EPS: f32 = 1e-6;
/// White balance strength per knob step.
const WB_STEP: f32 = 0.005;
const BASE_PERCENTILE: f32 = 99.5;
/// Upper bound on samples fed to a percentile search.
const MAX_SAMPLES: usize = 250_000;

/// Pixel stride that keeps a percentile sample below [`MAX_SAMPLES`].
fn sample_stride(pixels: usize) -> usize {
    pixels.div_ceil(MAX_SAMPLES).max(1)
}

fn channel_percentiles(image: &Rgb32FImage, p: &[f32]) -> Vec<[f32; 3]> {
    let stride = sample_stride(image.width() as usize * image.height() as usize);
    let mut channels: [Vec<f32>; 3] = Default::default();
    for px in image.as_raw().chunks_exact(3).step_by(stride) {
        for (c, values) in channels.iter_mut().enumerate() {
            values.push(px[c]);
        }
    }
    p.iter()
        .map(|&p| {
            let mut out = [0.0; 3];
            for (c, values) in channels.iter_mut().enumerate() {
                out[c] = percentile(values, p);
            }
            out
        })
        .collect()
}

/// Film base colour for a negative, 0..1 per channel.
pub fn film_base(image: &Rgb32FImage, settings: &SettingsProfile) -> [f32; 3] {
    let base = match settings.base_detect {
        BaseDetect::Manual => settings.base_rgb.map(|v| v as f32 / 255.0),
        BaseDetect::Auto => channel_percentiles(image, &[BASE_PERCENTILE])[0],
    };
    base.map(|v| v.max(EPS))
}

fn density(base: f32, px: f32) -> f32 {
    (base / px.max(EPS)).log10().max(0.0)
}

/// Stretch `value` so `lo` maps to 0 and `hi` to 1; a flat range maps to mid grey.
#[inline]
fn stretch(value: f32, lo: f32, hi: f32) -> f32 {
    if hi - lo < EPS {
        0.5
    } else {
        ((value - lo) / (hi - lo)).clamp(0.0, 1.0)
    }
}

fn normalize(image: &mut Rgb32FImage, black_pct: f32, white_pct: f32) {
    let bounds = channel_percentiles(image, &[black_pct, white_pct]);
    let (lo, hi) = (bounds[0], bounds[1]);
    image.par_chunks_exact_mut(3).for_each(|px| {
        for c in 0..3 {
            px[c] = stretch(px[c], lo[c], hi[c]);
        }
    });
}

/// Neutralize the film base and produce a positive, normalized to 0..1.
///
/// - colour negative: per-channel density against the base
/// - B&W negative: luminance density, replicated to all channels
/// - slide: no inversion
///
/// Crop-only film never reaches this stage.
pub fn neutralize_and_invert(
    image: &Rgb32FImage,
    settings: &SettingsProfile,
    black_pct: f32,
    white_pct: f32,
) -> Rgb32FImage {
    let mut out = image.clone();
    match settings.film_type {
        FilmType::ColourNegative => {
            let base = film_base(image, settings);
            out.par_chunks_exact_mut(3).for_each(|px| {
                for c in 0..3 {
                    px[c] = density(base[c], px[c]);
                }
            });
        }
        FilmType::BwNegative => {
            let base = luminance(&film_base(image, settings));
            out.par_chunks_exact_mut(3).for_each(|px| {
                let d = density(base, luminance(px));
                px.fill(d);
            });
        }
        FilmType::Slide | FilmType::CropOnly => {}
    }
    normalize(&mut out, black_pct, white_pct);
    out
}

/// Channel multipliers for a temperature / tint pair.
pub fn white_balance_multipliers(temp: i32, tint: i32) -> [f32; 3] {
    let t = temp as f32 * WB_STEP;
    let n = tint as f32 * WB_STEP;
    [1.0 + t, 1.0 - n, 1.0 - t]
}

pub fn apply_white_balance(image: &mut Rgb32FImage, temp: i32, tint: i32) {
    if temp == 0 && tint == 0 {
        return;
    }
    let mult = white_balance_multipliers(temp, tint);
    image.par_chunks_exact_mut(3).for_each(|px| {
        for c in 0..3 {
            px[c] = (px[c] * mult[c]).clamp(0.0, 1.0);
        }
    });
}

/// Temperature and tint that turn `sample` (taken before white balance) neutral.
///
/// Values are clamped to the knob range; a black sample yields `(0, 0)`.
pub fn neutralizing_balance(sample: [f32; 3]) -> (i32, i32) {
    let [r, g, b] = sample;
    if r + b < EPS || g < EPS {
        return (0, 0);
    }
    let t = (b - r) / (WB_STEP * (r + b));
    let balanced = 2.0 * r * b / (r + b);
    let n = (1.0 - balanced / g) / WB_STEP;
    let knob = |v: f32| (v.round() as i32).clamp(-100, 100);
    (knob(t), knob(n))
}

/// Mean colour of a pixel rectangle.
pub fn mean_colour(image: &Rgb32FImage, rect: PixelRect) -> [f32; 3] {
    let (x0, y0, w, h) = rect;
    let mut sum = [0.0f64; 3];
    let mut count = 0u64;
    for y in y0..(y0 + h).min(image.height()) {
        for x in x0..(x0 + w).min(image.width()) {
            let Rgb(px) = *image.get_pixel(x, y);
            for c in 0..3 {
                sum[c] += px[c] as f64;
            }
            count += 1;
        }
    }
    if count == 0 {
        return [0.0; 3];
    }
    sum.map(|s| (s / count as f64) as f32)
}

/// Base colour of a blank film scan: the pixel at the 90th brightness percentile.
pub fn blank_scan_base(image: &Rgb32FImage) -> [u8; 3] {
    let pixels: Vec<&[f32]> = image.as_raw().chunks_exact(3).collect();
    if pixels.is_empty() {
        return [255; 3];
    }
    let mut order: Vec<usize> = (0..pixels.len()).collect();
    let rank = ((pixels.len() - 1) as f32 * 0.9).round() as usize;
    order.select_nth_unstable_by(rank, |&a, &b| {
        luminance(pixels[a]).total_cmp(&luminance(pixels[b]))
    });
    let px = pixels[order[rank]];
    [0, 1, 2].map(|c| (px[c].clamp(0.0, 1.0) * 255.0).round() as u8)
}
