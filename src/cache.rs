//! Preview buffer cache for a photo collection.
//!
//! Decoding a RAW file is the slow part of browsing a roll, so photos near the
//! one being viewed are decoded ahead of time and photos far away are dropped
//! to bound memory.
//!
//! # Window
//!
//! For a current index `c` and preload radius `r`, the window is
//! `c - r ..= c + r`, clipped to the collection. After [`ResourceCache::update`]:
//!
//! - every photo inside the window is loaded or has a load in flight
//! - every photo outside the window that holds buffers has released them,
//!   unless a load or process is still running on it
//!
//! # In-flight tracking
//!
//! Loads run on a private thread pool with `2r + 1` threads, one per window
//! slot. The set of indices with a load in flight guarantees that a photo is
//! never scheduled twice; a finished task removes its index (also when it
//! panics) and wakes anyone in [`ResourceCache::wait_idle`].
//!
//! Background loads also render the preview in background mode, so flipping
//! to a preloaded photo shows its output without waiting.

use crate::photo::Photo;
use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct InFlight {
    indices: Mutex<HashSet<usize>>,
    idle: Condvar,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<usize>> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes an index from the in-flight set when a load task ends.
struct Slot {
    in_flight: Arc<InFlight>,
    index: usize,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut indices = self.in_flight.lock();
        indices.remove(&self.index);
        if indices.is_empty() {
            self.in_flight.idle.notify_all();
        }
    }
}

/// What one [`ResourceCache::update`] call did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Loads started by this call.
    pub scheduled: usize,
    /// Window photos that already had buffers (or cannot be read).
    pub resident: usize,
    /// Window photos whose earlier load was still running.
    pub in_flight: usize,
    /// Photos outside the window whose buffers were released.
    pub evicted: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} resident, {} loading, {} scheduled, {} evicted",
            self.resident, self.in_flight, self.scheduled, self.evicted
        )
    }
}

pub struct ResourceCache {
    radius: usize,
    pool: rayon::ThreadPool,
    in_flight: Arc<InFlight>,
}

impl ResourceCache {
    pub fn new(radius: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(2 * radius + 1)
            .thread_name(|i| format!("preload-{i}"))
            .panic_handler(|_| log::error!("background load panicked"))
            .build()?;
        Ok(Self {
            radius,
            pool,
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Indices in the preload window around `current`.
    pub fn window(&self, current: usize, len: usize) -> Option<RangeInclusive<usize>> {
        if len == 0 {
            return None;
        }
        let current = current.min(len - 1);
        Some(current.saturating_sub(self.radius)..=(current + self.radius).min(len - 1))
    }

    pub fn is_in_flight(&self, index: usize) -> bool {
        self.in_flight.lock().contains(&index)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Move the window to `current`: schedule missing loads inside it and
    /// release buffers outside it.
    pub fn update(&self, current: usize, photos: &[Arc<Photo>]) -> CacheStats {
        let mut stats = CacheStats::default();
        let Some(window) = self.window(current, photos.len()) else {
            return stats;
        };

        for index in window.clone() {
            let photo = &photos[index];
            if photo.is_loaded() || photo.file_read_error() {
                stats.resident += 1;
                continue;
            }
            if !self.in_flight.lock().insert(index) {
                stats.in_flight += 1;
                continue;
            }
            stats.scheduled += 1;
            let slot = Slot {
                in_flight: Arc::clone(&self.in_flight),
                index,
            };
            let photo = Arc::clone(photo);
            self.pool.spawn(move || {
                let _slot = slot;
                if photo.load(false) && !photo.is_processed() {
                    photo.process(false, false, true);
                }
            });
        }

        for (index, photo) in photos.iter().enumerate() {
            if window.contains(&index) || !photo.is_loaded() {
                continue;
            }
            if self.is_in_flight(index) || photo.active_processes() > 0 {
                log::debug!("keeping busy photo {index} outside the window");
                continue;
            }
            photo.clear_memory();
            stats.evicted += 1;
        }

        log::debug!("cache at {current}: {stats}");
        stats
    }

    /// Block until no background load is running.
    pub fn wait_idle(&self) {
        let mut indices = self.in_flight.lock();
        while !indices.is_empty() {
            indices = self
                .in_flight
                .idle
                .wait(indices)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        self.wait_idle();
    }
}
