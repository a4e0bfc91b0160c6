//! Tone stage.
//!
//! Fixed order: levels (black/white point), gamma, shadows/highlights, then
//! saturation in CIE Lab. Each step expects a 0..1 input and produces one.

use crate::settings::{FilmType, SettingsProfile};
use image::Rgb32FImage;
use rayon::prelude::*;

/// Knob values converted to the normalized form the curve works with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneCurve {
    pub black: f32,
    pub white: f32,
    pub gamma: f32,
    pub shadows: f32,
    pub highlights: f32,
}

impl ToneCurve {
    pub fn from_settings(settings: &SettingsProfile) -> Self {
        ToneCurve {
            black: settings.black_point as f32 / 200.0,
            white: 1.0 - settings.white_point as f32 / 200.0,
            gamma: 2f32.powf(-settings.gamma as f32 / 100.0),
            shadows: settings.shadows as f32 / 100.0,
            highlights: settings.highlights as f32 / 100.0,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.black == 0.0
            && self.white == 1.0
            && self.gamma == 1.0
            && self.shadows == 0.0
            && self.highlights == 0.0
    }

    #[inline]
    pub fn map(&self, v: f32) -> f32 {
        let span = self.white - self.black;
        let mut v = if span.abs() < 1e-6 {
            if v >= self.black { 1.0 } else { 0.0 }
        } else {
            ((v - self.black) / span).clamp(0.0, 1.0)
        };
        v = v.powf(self.gamma);
        let ws = 1.0 - smoothstep(0.0, 0.5, v);
        let wh = smoothstep(0.5, 1.0, v);
        v += (self.shadows * ws + self.highlights * wh) * v * (1.0 - v);
        v.clamp(0.0, 1.0)
    }
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

pub fn apply(image: &mut Rgb32FImage, settings: &SettingsProfile) {
    let curve = ToneCurve::from_settings(settings);
    let saturation = settings.sat as f32 / 100.0;
    let adjust_saturation = settings.sat != 100 && settings.film_type != FilmType::BwNegative;
    if curve.is_identity() && !adjust_saturation {
        return;
    }
    image.par_chunks_exact_mut(3).for_each(|px| {
        if !curve.is_identity() {
            for v in px.iter_mut() {
                *v = curve.map(*v);
            }
        }
        if adjust_saturation {
            let [l, a, b] = rgb_to_lab([px[0], px[1], px[2]]);
            let rgb = lab_to_rgb([l, a * saturation, b * saturation]);
            px.copy_from_slice(&rgb.map(|v| v.clamp(0.0, 1.0)));
        }
    });
}

// D65 reference white.
const WHITE: [f32; 3] = [0.950_47, 1.0, 1.088_83];

fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.040_45 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.max(0.0).powf(1.0 / 2.4) - 0.055
    }
}

fn lab_f(t: f32) -> f32 {
    const D: f32 = 6.0 / 29.0;
    if t > D * D * D {
        t.cbrt()
    } else {
        t / (3.0 * D * D) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    const D: f32 = 6.0 / 29.0;
    if t > D {
        t * t * t
    } else {
        3.0 * D * D * (t - 4.0 / 29.0)
    }
}

pub fn rgb_to_lab(rgb: [f32; 3]) -> [f32; 3] {
    let [r, g, b] = rgb.map(srgb_to_linear);
    let x = 0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b;
    let z = 0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b;
    let fx = lab_f(x / WHITE[0]);
    let fy = lab_f(y / WHITE[1]);
    let fz = lab_f(z / WHITE[2]);
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

pub fn lab_to_rgb(lab: [f32; 3]) -> [f32; 3] {
    let [l, a, b] = lab;
    let fy = (l + 16.0) / 116.0;
    let fx = fy + a / 500.0;
    let fz = fy - b / 200.0;
    let x = WHITE[0] * lab_f_inv(fx);
    let y = WHITE[1] * lab_f_inv(fy);
    let z = WHITE[2] * lab_f_inv(fz);
    let r = 3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z;
    let g = -0.969_266 * x + 1.876_010_8 * y + 0.041_556 * z;
    let b = 0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z;
    [r, g, b].map(linear_to_srgb)
}
