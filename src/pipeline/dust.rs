//! Dust removal: small high-contrast specks are painted out.
//!
//! Candidates are pixels that differ from their 5x5 grey median by more than
//! `dust_threshold`. The candidate mask is closed `dust_iter` times, split into
//! 8-connected particles, and particles no larger than `max_dust_area` are
//! replaced by the median colour of the surrounding clean pixels.

use super::luminance;
use crate::config::DustConfig;
use image::{GrayImage, Luma, Rgb32FImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::median_filter;
use imageproc::morphology::close;
use imageproc::region_labelling::{Connectivity, connected_components};
use rayon::prelude::*;

const MEDIAN_RADIUS: u32 = 2;
const FILL_RADIUS: i64 = 3;

fn grey(image: &Rgb32FImage) -> GrayImage {
    let (w, h) = image.dimensions();
    let data: Vec<u8> = image
        .as_raw()
        .par_chunks_exact(3)
        .map(|px| (luminance(px).clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    GrayImage::from_raw(w, h, data).unwrap_or_else(|| GrayImage::new(w, h))
}

/// Binary mask of dust pixels (255) for `image`.
pub fn dust_mask(image: &Rgb32FImage, config: &DustConfig) -> GrayImage {
    let grey = grey(image);
    let median = median_filter(&grey, MEDIAN_RADIUS, MEDIAN_RADIUS);
    let (w, h) = grey.dimensions();
    let mut candidates = GrayImage::from_fn(w, h, |x, y| {
        let diff = grey.get_pixel(x, y)[0].abs_diff(median.get_pixel(x, y)[0]);
        Luma([if diff > config.dust_threshold { 255 } else { 0 }])
    });
    for _ in 0..config.dust_iter {
        candidates = close(&candidates, Norm::LInf, 1);
    }

    let labels = connected_components(&candidates, Connectivity::Eight, Luma([0u8]));
    let mut areas: Vec<u32> = Vec::new();
    for label in labels.pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if areas.len() < label {
            areas.resize(label, 0);
        }
        areas[label - 1] += 1;
    }
    GrayImage::from_fn(w, h, |x, y| {
        let label = labels.get_pixel(x, y)[0] as usize;
        let is_dust = label > 0 && areas[label - 1] <= config.max_dust_area;
        Luma([if is_dust { 255 } else { 0 }])
    })
}

fn median(values: &mut [f32]) -> f32 {
    let mid = values.len() / 2;
    let (_, v, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
    *v
}

/// Median colour of the clean pixels around `(x, y)`; `None` when every
/// neighbour is dust too.
fn fill_colour(image: &Rgb32FImage, mask: &GrayImage, x: u32, y: u32) -> Option<[f32; 3]> {
    let (w, h) = image.dimensions();
    let mut channels: [Vec<f32>; 3] = Default::default();
    for dy in -FILL_RADIUS..=FILL_RADIUS {
        for dx in -FILL_RADIUS..=FILL_RADIUS {
            let (nx, ny) = (x as i64 + dx, y as i64 + dy);
            if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                continue;
            }
            let (nx, ny) = (nx as u32, ny as u32);
            if mask.get_pixel(nx, ny)[0] != 0 {
                continue;
            }
            let px = image.get_pixel(nx, ny);
            for (c, values) in channels.iter_mut().enumerate() {
                values.push(px[c]);
            }
        }
    }
    if channels[0].is_empty() {
        return None;
    }
    Some([0, 1, 2].map(|c| median(&mut channels[c])))
}

pub fn remove_dust(image: &Rgb32FImage, config: &DustConfig) -> Rgb32FImage {
    let mask = dust_mask(image, config);
    let spots: Vec<(u32, u32)> = mask
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] != 0)
        .map(|(x, y, _)| (x, y))
        .collect();
    log::debug!("dust: {} pixels to fill", spots.len());

    let fills: Vec<(u32, u32, [f32; 3])> = spots
        .par_iter()
        .filter_map(|&(x, y)| fill_colour(image, &mask, x, y).map(|c| (x, y, c)))
        .collect();
    let mut out = image.clone();
    for (x, y, colour) in fills {
        out.put_pixel(x, y, image::Rgb(colour));
    }
    out
}
