//! The staged processing pipeline.
//!
//! A deterministic transform from one decoded buffer plus a settings snapshot
//! to one buffer per named stage:
//!
//! | Stage | Module | Output |
//! |---|---|---|
//! | `RAW` | here ([`orient`]) | decoded buffer after flip and rotation |
//! | `Threshold` | [`threshold`] | binary frame/rebate mask |
//! | `Contours` | [`contours`] | crop rectangle, drawn over the RAW stage |
//! | base / white balance | [`colour`] | inverted, base-neutralized, balanced buffer |
//! | tone | [`tone`] | levels, gamma, shadows/highlights, saturation |
//! | dust | [`dust`] | small particles painted out |
//! | `Histogram` | [`histogram`] | equalized reference view (diagnostic only) |
//! | `Full Preview` | [`composite`] | cropped, framed output |
//!
//! Every knob is converted from its 0-100 style scale to a normalized value
//! at the start of the stage that uses it. Geometry failures degrade to the
//! full frame; nothing in here returns an error.
//!
//! `crop_only` film runs the RAW stage and the crop only.

pub mod colour;
pub mod composite;
pub mod contours;
pub mod dust;
pub mod histogram;
pub mod threshold;
pub mod tone;

use crate::config::AppConfig;
use crate::imaging::calculations::PixelRect;
use crate::settings::{FilmType, SettingsProfile};
use image::imageops;
use image::{DynamicImage, GrayImage, Rgb32FImage, RgbImage};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Rec.709 luminance of a normalized RGB sample.
#[inline]
pub fn luminance(px: &[f32]) -> f32 {
    0.2126 * px[0] + 0.7152 * px[1] + 0.0722 * px[2]
}

/// Named stage outputs a front end can ask a photo for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Stage {
    Raw,
    Threshold,
    Contours,
    Histogram,
    /// The composited output (preview or export quality).
    #[default]
    Final,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Raw,
        Stage::Threshold,
        Stage::Contours,
        Stage::Histogram,
        Stage::Final,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Raw => "RAW",
            Stage::Threshold => "Threshold",
            Stage::Contours => "Contours",
            Stage::Histogram => "Histogram",
            Stage::Final => "Full Preview",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Stage::ALL
            .iter()
            .copied()
            .find(|st| st.name().to_ascii_lowercase() == wanted)
            .or(match wanted.as_str() {
                "final" | "preview" | "full" => Some(Stage::Final),
                _ => None,
            })
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// A cheaply clonable handle to one stage buffer.
#[derive(Debug, Clone)]
pub enum StageImage {
    Rgb(Arc<Rgb32FImage>),
    Mask(Arc<GrayImage>),
    Overlay(Arc<RgbImage>),
}

impl StageImage {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            StageImage::Rgb(i) => i.dimensions(),
            StageImage::Mask(i) => i.dimensions(),
            StageImage::Overlay(i) => i.dimensions(),
        }
    }

    /// Owned copy as a `DynamicImage`, for display or saving.
    pub fn to_dynamic(&self) -> DynamicImage {
        match self {
            StageImage::Rgb(i) => DynamicImage::ImageRgb32F((**i).clone()),
            StageImage::Mask(i) => DynamicImage::ImageLuma8((**i).clone()),
            StageImage::Overlay(i) => DynamicImage::ImageRgb8((**i).clone()),
        }
    }

    pub fn as_rgb(&self) -> Option<&Rgb32FImage> {
        match self {
            StageImage::Rgb(i) => Some(i),
            _ => None,
        }
    }
}

/// Crop rectangle in normalized (0..1) image coordinates.
///
/// Normalized so proxy and full-quality renders share one geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl CropRect {
    pub const FULL: CropRect = CropRect {
        x: 0.0,
        y: 0.0,
        w: 1.0,
        h: 1.0,
    };

    pub fn from_pixels(rect: PixelRect, dims: (u32, u32)) -> Self {
        let (x, y, w, h) = rect;
        let (dw, dh) = (dims.0.max(1) as f32, dims.1.max(1) as f32);
        CropRect {
            x: x as f32 / dw,
            y: y as f32 / dh,
            w: w as f32 / dw,
            h: h as f32 / dh,
        }
    }

    /// Pixel rectangle inside an image of `dims`; never empty, never outside.
    pub fn to_pixels(&self, dims: (u32, u32)) -> PixelRect {
        let (dw, dh) = dims;
        let x = ((self.x * dw as f32).round() as u32).min(dw.saturating_sub(1));
        let y = ((self.y * dh as f32).round() as u32).min(dh.saturating_sub(1));
        let w = ((self.w * dw as f32).round() as u32).clamp(1, (dw - x).max(1));
        let h = ((self.h * dh as f32).round() as u32).clamp(1, (dh - y).max(1));
        (x, y, w, h)
    }

    pub fn is_full(&self) -> bool {
        *self == CropRect::FULL
    }
}

/// RAW stage: mirror horizontally when `flip`, then turn `rotation` quarter
/// turns counter-clockwise (negative values turn clockwise).
pub fn orient(source: &Rgb32FImage, flip: bool, rotation: i32) -> Rgb32FImage {
    let flipped;
    let img = if flip {
        flipped = imageops::flip_horizontal(source);
        &flipped
    } else {
        source
    };
    match rotation.rem_euclid(4) {
        1 => imageops::rotate270(img),
        2 => imageops::rotate180(img),
        3 => imageops::rotate90(img),
        _ => img.clone(),
    }
}

/// Everything geometry-related from one run; reused by `skip_crop` runs.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub oriented: Arc<Rgb32FImage>,
    pub crop: CropRect,
    pub threshold: Option<Arc<GrayImage>>,
    pub contours: Option<Arc<RgbImage>>,
}

/// All stage buffers of one run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub geometry: Geometry,
    /// Cropped buffer after base neutralization and inversion, before white
    /// balance. Present for colour film only; the white balance picker reads it.
    pub pre_balance: Option<Arc<Rgb32FImage>>,
    pub histogram: Option<Arc<Rgb32FImage>>,
    pub output: Arc<Rgb32FImage>,
    /// Width of the white frame around `output`, in pixels.
    pub frame_px: u32,
}

/// Inputs of one pipeline run.
pub struct PipelineRequest<'a> {
    pub source: &'a Rgb32FImage,
    pub settings: &'a SettingsProfile,
    pub config: &'a AppConfig,
    /// Geometry of a previous run to reuse instead of re-detecting the crop.
    pub reuse: Option<&'a Geometry>,
    /// Produce the diagnostic stages (threshold, contour overlay, histogram).
    pub diagnostics: bool,
}

fn detect_geometry(req: &PipelineRequest<'_>) -> Geometry {
    let s = req.settings;
    let oriented = Arc::new(orient(req.source, s.flip, s.rotation));

    // Detection runs on the oriented buffer itself; the inset is a share of
    // the box at this resolution.
    let mask = threshold::threshold_mask(&oriented, s.dark_threshold, s.light_threshold);
    let crop = match contours::find_frame(&mask, s.border_crop) {
        Some(rect) => CropRect::from_pixels(rect, mask.dimensions()),
        None => {
            log::debug!("no frame contour found; using the full frame");
            CropRect::FULL
        }
    };

    let (threshold, contours) = if req.diagnostics {
        let overlay = contours::draw_overlay(&oriented, &crop);
        (Some(Arc::new(mask)), Some(Arc::new(overlay)))
    } else {
        (None, None)
    };

    Geometry {
        oriented,
        crop,
        threshold,
        contours,
    }
}

/// Run the pipeline.
pub fn run(req: &PipelineRequest<'_>) -> PipelineOutput {
    let s = req.settings;
    let geometry = match req.reuse {
        Some(previous) => previous.clone(),
        None => detect_geometry(req),
    };

    let cropped = composite::crop(&geometry.oriented, &geometry.crop);

    let (corrected, pre_balance) = if s.film_type == FilmType::CropOnly {
        (cropped, None)
    } else {
        let processing = &req.config.processing;
        let inverted = colour::neutralize_and_invert(
            &cropped,
            s,
            processing.black_point_percentile,
            processing.white_point_percentile,
        );
        let mut corrected;
        let pre_balance = if s.film_type == FilmType::BwNegative {
            corrected = inverted;
            None
        } else {
            corrected = inverted.clone();
            colour::apply_white_balance(&mut corrected, s.temp, s.tint);
            Some(Arc::new(inverted))
        };
        tone::apply(&mut corrected, s);
        if s.remove_dust {
            corrected = dust::remove_dust(&corrected, &req.config.dust);
        }
        (corrected, pre_balance)
    };

    let histogram = req.diagnostics.then(|| {
        Arc::new(histogram::equalize(
            &corrected,
            req.config.processing.ignore_border,
        ))
    });

    let (output, frame_px) = composite::add_frame(corrected, req.config.export.frame as f32);

    PipelineOutput {
        geometry,
        pre_balance,
        histogram,
        output: Arc::new(output),
        frame_px,
    }
}
