//! Shared test utilities for the film-scan test suite.
//!
//! Synthetic scans stand in for RAW files, and a [`MockDecoder`] hands them
//! out, so no test needs a real sensor file.
//!
//! # Usage
//!
//! ```rust,ignore
//! use crate::test_helpers::*;
//!
//! let frame = bordered_frame(800, 600, 40, 0.05, 0.8);
//! let (ctx, mock) = mock_context(MockDecoder::new(frame), AppConfig::default());
//! let photo = Photo::new("/scans/roll1/001.dng", ctx);
//! photo.process(false, false, false);
//! assert_eq!(mock.call_count(), 1);
//! ```

use crate::config::AppConfig;
use crate::imaging::decoder::tests::MockDecoder;
use crate::photo::PhotoContext;
use image::{Rgb, Rgb32FImage};
use std::path::PathBuf;
use std::sync::Arc;

// =========================================================================
// Synthetic scans
// =========================================================================

/// A grey frame: a uniform `border` px rebate around a brighter interior.
///
/// The interior carries a gentle horizontal falloff (down to 90% of
/// `interior_value`) so it is not perfectly flat.
pub fn bordered_frame(
    width: u32,
    height: u32,
    border: u32,
    border_value: f32,
    interior_value: f32,
) -> Rgb32FImage {
    Rgb32FImage::from_fn(width, height, |x, y| {
        let inside = x >= border && y >= border && x < width - border && y < height - border;
        let v = if inside {
            interior_value * (1.0 - 0.1 * x as f32 / width as f32)
        } else {
            border_value
        };
        Rgb([v, v, v])
    })
}

/// A colour negative filling the whole frame: orange film base everywhere,
/// with a dark subject in the central third.
pub fn negative_frame(width: u32, height: u32) -> Rgb32FImage {
    const BASE: [f32; 3] = [0.9, 0.6, 0.4];
    Rgb32FImage::from_fn(width, height, |x, y| {
        let subject = x >= width / 3 && x < 2 * width / 3 && y >= height / 3 && y < 2 * height / 3;
        if subject {
            Rgb(BASE.map(|v| v * 0.2))
        } else {
            Rgb(BASE)
        }
    })
}

// =========================================================================
// Photo fixtures
// =========================================================================

/// A photo context over `decoder`, without sidecars. The mock is returned
/// too so tests can inspect its calls.
pub fn mock_context(decoder: MockDecoder, config: AppConfig) -> (PhotoContext, Arc<MockDecoder>) {
    let mock = Arc::new(decoder);
    let ctx = PhotoContext::new(mock.clone(), Arc::new(config));
    (ctx, mock)
}

/// `n` plausible RAW paths in one roll.
pub fn scan_paths(n: usize) -> Vec<PathBuf> {
    (1..=n)
        .map(|i| PathBuf::from(format!("/scans/roll1/{i:03}.dng")))
        .collect()
}
