//! Final crop and the optional white export frame.

use super::CropRect;
use crate::imaging::calculations::frame_width;
use image::{Rgb, Rgb32FImage, imageops};

pub fn crop(image: &Rgb32FImage, rect: &CropRect) -> Rgb32FImage {
    if rect.is_full() {
        return image.clone();
    }
    let (x, y, w, h) = rect.to_pixels(image.dimensions());
    imageops::crop_imm(image, x, y, w, h).to_image()
}

/// Surround `image` with a white border of `pct` percent of its longer edge.
///
/// Returns the framed image and the border width in pixels.
pub fn add_frame(image: Rgb32FImage, pct: f32) -> (Rgb32FImage, u32) {
    let border = frame_width(image.dimensions(), pct);
    if border == 0 {
        return (image, 0);
    }
    let (w, h) = image.dimensions();
    let mut canvas = Rgb32FImage::from_pixel(w + 2 * border, h + 2 * border, Rgb([1.0; 3]));
    imageops::replace(&mut canvas, &image, border as i64, border as i64);
    (canvas, border)
}
