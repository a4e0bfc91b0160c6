//! Histogram stage: an equalized reference view of the corrected buffer.
//!
//! Diagnostic only; the exported output never passes through here.

use super::luminance;
use image::Rgb32FImage;
use rayon::prelude::*;

const BINS: usize = 1024;

fn bin(l: f32) -> usize {
    ((l.clamp(0.0, 1.0) * (BINS - 1) as f32).round() as usize).min(BINS - 1)
}

/// Region used for the CDF: `ignore_border` percent of width / height is
/// dropped from each side. Falls back to the whole image when nothing remains.
fn sample_region(dims: (u32, u32), ignore_border: [u32; 2]) -> (u32, u32, u32, u32) {
    let (w, h) = dims;
    let bx = (w as u64 * ignore_border[0] as u64 / 100) as u32;
    let by = (h as u64 * ignore_border[1] as u64 / 100) as u32;
    if 2 * bx >= w || 2 * by >= h {
        return (0, 0, w, h);
    }
    (bx, by, w - bx, h - by)
}

/// Luminance histogram equalization; colour ratios are preserved.
pub fn equalize(image: &Rgb32FImage, ignore_border: [u32; 2]) -> Rgb32FImage {
    let (x0, y0, x1, y1) = sample_region(image.dimensions(), ignore_border);
    let mut counts = [0u64; BINS];
    for y in y0..y1 {
        for x in x0..x1 {
            counts[bin(luminance(&image.get_pixel(x, y).0))] += 1;
        }
    }
    let total: u64 = counts.iter().sum();
    let mut cdf = [0f32; BINS];
    let mut running = 0u64;
    for (slot, count) in cdf.iter_mut().zip(counts) {
        running += count;
        *slot = if total == 0 { 0.0 } else { running as f32 / total as f32 };
    }

    let mut out = image.clone();
    out.par_chunks_exact_mut(3).for_each(|px| {
        let l = luminance(px);
        let target = cdf[bin(l)];
        if l > 1e-6 {
            let scale = target / l;
            for v in px.iter_mut() {
                *v = (*v * scale).clamp(0.0, 1.0);
            }
        } else {
            px.fill(target);
        }
    });
    out
}
