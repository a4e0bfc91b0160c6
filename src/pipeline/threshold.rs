//! Threshold stage: separates the film frame from its rebate.

use super::luminance;
use image::{GrayImage, Rgb32FImage};
use rayon::prelude::*;

/// Binary mask: 255 where `dark/100 <= luminance <= light/100`, else 0.
pub fn threshold_mask(image: &Rgb32FImage, dark_threshold: i32, light_threshold: i32) -> GrayImage {
    let lo = dark_threshold as f32 / 100.0;
    let hi = light_threshold as f32 / 100.0;
    let (w, h) = image.dimensions();
    let data: Vec<u8> = image
        .as_raw()
        .par_chunks_exact(3)
        .map(|px| {
            let l = luminance(px);
            if l >= lo && l <= hi { 255 } else { 0 }
        })
        .collect();
    GrayImage::from_raw(w, h, data).unwrap_or_else(|| GrayImage::new(w, h))
}
