//! Pure calculation functions for sizes, sampling windows and pool sizing.
//!
//! All functions here are pure and testable without any I/O or images.

/// Scale `(width, height)` down so `width + height <= max_sum`.
///
/// Images already inside the budget are returned unchanged; neither side
/// drops below one pixel.
///
/// # Examples
/// ```
/// # use film_scan::imaging::calculations::proxy_dimensions;
/// assert_eq!(proxy_dimensions((6000, 4000), 2500), (1500, 1000));
/// assert_eq!(proxy_dimensions((800, 600), 2500), (800, 600));
/// ```
pub fn proxy_dimensions(source: (u32, u32), max_sum: u32) -> (u32, u32) {
    let (w, h) = source;
    let sum = w as u64 + h as u64;
    if sum <= max_sum as u64 || sum == 0 {
        return source;
    }
    let scale = max_sum as f64 / sum as f64;
    (
        ((w as f64 * scale).round() as u32).max(1),
        ((h as f64 * scale).round() as u32).max(1),
    )
}

/// Pixel-space rectangle `(x, y, width, height)`.
pub type PixelRect = (u32, u32, u32, u32);

/// Square sampling window around a normalized point.
///
/// `radius_pct` is a percentage of the shorter image edge; the window always
/// contains at least the pixel under the point and never leaves the image.
pub fn sample_window(dims: (u32, u32), x: f32, y: f32, radius_pct: f32) -> PixelRect {
    let (w, h) = dims;
    let cx = ((x.clamp(0.0, 1.0) * w as f32) as u32).min(w.saturating_sub(1));
    let cy = ((y.clamp(0.0, 1.0) * h as f32) as u32).min(h.saturating_sub(1));
    let radius = (w.min(h) as f32 * radius_pct.max(0.0) / 100.0).round() as u32;
    let x0 = cx.saturating_sub(radius);
    let y0 = cy.saturating_sub(radius);
    let x1 = (cx + radius).min(w.saturating_sub(1));
    let y1 = (cy + radius).min(h.saturating_sub(1));
    (x0, y0, x1 - x0 + 1, y1 - y0 + 1)
}

/// Width of the white export frame in pixels: `pct` percent of the longer edge.
pub fn frame_width(dims: (u32, u32), pct: f32) -> u32 {
    let longer = dims.0.max(dims.1) as f32;
    (longer * pct.max(0.0) / 100.0).round() as u32
}

/// Value at percentile `p` (0-100) of `values`, by nearest rank.
///
/// Reorders `values`. Returns 0 for an empty slice.
pub fn percentile(values: &mut [f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let rank = ((p.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f32).round() as usize;
    let (_, v, _) = values.select_nth_unstable_by(rank, f32::total_cmp);
    *v
}

/// Export worker count.
///
/// - `override_count > 0`: the override, clamped to `hardware` and `batch`.
/// - otherwise `min(available / mean(observed), hardware, batch)`; the memory
///   term is dropped when there is no figure for available memory or no
///   observed allocation yet.
///
/// The result is always in `1..=max(1, min(hardware, batch))`.
pub fn worker_pool_size(
    override_count: usize,
    hardware: usize,
    batch: usize,
    available_memory: Option<u64>,
    observed_allocations: &[u64],
) -> usize {
    let ceiling = hardware.min(batch).max(1);
    if override_count > 0 {
        return override_count.min(ceiling);
    }
    let observed: Vec<u64> = observed_allocations
        .iter()
        .copied()
        .filter(|&a| a > 0)
        .collect();
    let by_memory = match available_memory {
        Some(available) if !observed.is_empty() => {
            let mean = observed.iter().sum::<u64>() as f64 / observed.len() as f64;
            (available as f64 / mean).round() as usize
        }
        _ => usize::MAX,
    };
    by_memory.min(ceiling).max(1)
}
