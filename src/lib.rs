//! # Film Scan
//!
//! Converts RAW (or raster) scans of film negatives and slides into corrected
//! positive images. A roll is imported as a [`collection::Collection`] of
//! [`photo::Photo`]s; each photo renders through a staged pipeline and can be
//! exported at full resolution.
//!
//! # Architecture: Staged Pipeline
//!
//! Every render is a pure function from a decoded buffer and a settings
//! snapshot to one buffer per stage:
//!
//! ```text
//! RAW ─▶ Threshold ─▶ Contours ─▶ crop ─▶ base / invert ─▶ white balance
//!                                    ─▶ tone ─▶ dust ─▶ white frame ─▶ Final
//! ```
//!
//! `Histogram` is a diagnostic view (luminance-equalized output) rendered
//! beside the final image, not a step before it.
//!
//! The geometry stages (threshold, contours) only depend on a few keys, so a
//! colour or tone change reruns the rest with the previous crop (`skip_crop`).
//! The crop is detected at the resolution being rendered and stored in
//! normalized coordinates.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`settings`] | The settings profile, its keys, and the shared global profile |
//! | [`photo`] | One scan: load, process, stage buffers, pickers, sidecar save |
//! | [`collection`] | Import, selection, settings edits with change events |
//! | [`cache`] | Preload window around the current photo |
//! | [`export`] | Single and batch export with retries and cancellation |
//! | [`pipeline`] | The stages: threshold, contours, colour, tone, histogram, dust, composite |
//! | [`imaging`] | Decoding (RAW and raster), encoding, sizing math |
//! | [`config`] | `config.toml` loading, merging over stock defaults |
//! | [`sidecar`] | Per-photo settings files keyed by source path |
//! | [`events`] | Progress and change notifications for front ends |
//! | [`scan`] | Finding importable files |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Global Profile as an Explicit Handle
//!
//! Linked photos share one [`settings::GlobalProfile`], passed to them in a
//! [`photo::PhotoContext`]. There is no process-wide state: two collections
//! can hold two independent global profiles. A global write bumps a revision
//! counter, which is how linked photos notice their outputs went stale.
//!
//! ## No Automatic Reprocessing
//!
//! Writing a setting never renders. It flips `is_processed()` and sends an
//! event; the front end decides when to call [`photo::Photo::process`].
//!
//! ## Export Isolation
//!
//! Batch export renders settings snapshots into private photos on its own
//! worker pool, so browsing the collection during an export never races the
//! export's buffers. Each attempt runs under `catch_unwind`.

pub mod cache;
pub mod collection;
pub mod config;
pub mod events;
pub mod export;
pub mod imaging;
pub mod output;
pub mod photo;
pub mod pipeline;
pub mod scan;
pub mod settings;
pub mod sidecar;

#[cfg(test)]
pub(crate) mod test_helpers;
