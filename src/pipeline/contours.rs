//! Contours stage: finds the film frame in the threshold mask.
//!
//! The frame is the largest 8-connected region of the mask whose bounding box
//! touches none of the four image edges. Its box is inset by `border_crop`
//! percent of the box's own width and height. When no region qualifies the
//! caller falls back to the full frame.

use super::CropRect;
use crate::imaging::calculations::PixelRect;
use image::{DynamicImage, GrayImage, Luma, Rgb, Rgb32FImage, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use imageproc::region_labelling::{Connectivity, connected_components};

const OVERLAY_COLOUR: Rgb<u8> = Rgb([255, 0, 0]);

#[derive(Debug, Clone, Copy)]
struct Region {
    area: u64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl Region {
    fn new(x: u32, y: u32) -> Self {
        Region {
            area: 0,
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.area += 1;
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    fn touches_edge(&self, w: u32, h: u32) -> bool {
        self.min_x == 0 || self.min_y == 0 || self.max_x + 1 >= w || self.max_y + 1 >= h
    }
}

/// Locate the frame and return its inset pixel rectangle.
pub fn find_frame(mask: &GrayImage, border_crop: i32) -> Option<PixelRect> {
    let (w, h) = mask.dimensions();
    if w < 3 || h < 3 {
        return None;
    }
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    // Labels are consecutive from 1.
    let mut regions: Vec<Option<Region>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if regions.len() < label {
            regions.resize(label, None);
        }
        regions[label - 1]
            .get_or_insert_with(|| Region::new(x, y))
            .add(x, y);
    }

    let mut best: Option<Region> = None;
    for region in regions.into_iter().flatten() {
        if region.touches_edge(w, h) {
            continue;
        }
        if best.is_none_or(|b| region.area > b.area) {
            best = Some(region);
        }
    }
    let region = best?;
    inset(&region, border_crop, (w, h))
}

fn inset(region: &Region, border_crop: i32, dims: (u32, u32)) -> Option<PixelRect> {
    let bw = (region.max_x - region.min_x + 1) as i64;
    let bh = (region.max_y - region.min_y + 1) as i64;
    let dx = (bw as f64 * border_crop as f64 / 100.0).round() as i64;
    let dy = (bh as f64 * border_crop as f64 / 100.0).round() as i64;
    let x0 = (region.min_x as i64 + dx).max(0);
    let y0 = (region.min_y as i64 + dy).max(0);
    let x1 = (region.max_x as i64 + 1 - dx).min(dims.0 as i64);
    let y1 = (region.max_y as i64 + 1 - dy).min(dims.1 as i64);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

/// The RAW stage as 8-bit RGB with the crop rectangle drawn over it.
pub fn draw_overlay(image: &Rgb32FImage, crop: &CropRect) -> RgbImage {
    let mut overlay = DynamicImage::ImageRgb32F(image.clone()).to_rgb8();
    let (x, y, w, h) = crop.to_pixels(overlay.dimensions());
    let thickness = (overlay.width().max(overlay.height()) / 400).max(1);
    for i in 0..thickness {
        if w <= 2 * i || h <= 2 * i {
            break;
        }
        let rect = Rect::at((x + i) as i32, (y + i) as i32).of_size(w - 2 * i, h - 2 * i);
        draw_hollow_rect_mut(&mut overlay, rect, OVERLAY_COLOUR);
    }
    overlay
}
