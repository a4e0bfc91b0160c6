//! One photo: a source file, its settings and its stage buffers.
//!
//! ## Settings
//!
//! Every photo owns an *instance* profile. When `use_global_settings` is on,
//! the effective settings are the shared [`GlobalProfile`] with the photo's own
//! `reject` and `rotation` laid over it; otherwise the instance profile is
//! used as is. Writes through [`Photo::set_setting`] go to whichever profile
//! is in force for the key.
//!
//! ## Freshness
//!
//! `is_processed()` is true only while the held buffers match the current
//! effective settings. Instance writes clear the flag (except for cheap keys);
//! global writes bump the profile revision, and a linked photo compares the
//! revision its buffers were rendered from with the current one. Every run
//! renders from a settings snapshot taken at its start, so a write that lands
//! mid-run leaves the photo unprocessed instead of racing on half-updated
//! buffers.
//!
//! ## Errors
//!
//! Nothing here returns a decode error. A failed decode sets
//! `file_read_error()` and leaves the buffers empty; accessors then return
//! `None`.

use crate::config::AppConfig;
use crate::imaging::calculations::{proxy_dimensions, sample_window};
use crate::imaging::{ColourDescription, RawDecoder};
use crate::pipeline::{self, PipelineOutput, PipelineRequest, Stage, StageImage, colour};
use crate::settings::{
    GlobalProfile, Mutation, SettingKey, SettingValue, SettingsError, SettingsProfile,
};
use crate::sidecar::{SidecarError, SidecarRecord, SidecarStore};
use image::Rgb32FImage;
use image::imageops::{self, FilterType};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Everything a photo needs besides its own path and settings.
#[derive(Clone)]
pub struct PhotoContext {
    pub decoder: Arc<dyn RawDecoder>,
    pub config: Arc<AppConfig>,
    pub global: GlobalProfile,
    pub sidecars: Option<SidecarStore>,
}

impl PhotoContext {
    pub fn new(decoder: Arc<dyn RawDecoder>, config: Arc<AppConfig>) -> Self {
        let global = GlobalProfile::new(config.defaults.clone());
        Self {
            decoder,
            config,
            global,
            sidecars: None,
        }
    }

    pub fn with_sidecars(mut self, store: SidecarStore) -> Self {
        self.sidecars = Some(store);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Downscaled to the `max_proxy_size` budget.
    Proxy,
    /// Native sensor resolution.
    Full,
}

impl Resolution {
    fn of(full_quality: bool) -> Self {
        if full_quality {
            Resolution::Full
        } else {
            Resolution::Proxy
        }
    }
}

struct Rendered {
    pipeline: PipelineOutput,
    settings: SettingsProfile,
    resolution: Resolution,
}

struct PhotoState {
    settings: SettingsProfile,
    use_global: bool,
    /// Bumped by every non-cheap instance write.
    settings_revision: u64,
    source: Option<Arc<Rgb32FImage>>,
    resolution: Option<Resolution>,
    rendered: Option<Rendered>,
    colour_desc: Option<ColourDescription>,
}

/// Decrements the busy counter when a run ends, however it ends.
struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Busy(counter)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Photo {
    path: PathBuf,
    ctx: PhotoContext,
    state: Mutex<PhotoState>,
    processed: AtomicBool,
    file_read_error: AtomicBool,
    active_processes: AtomicUsize,
    rendered_global: AtomicU64,
    memory_alloc: AtomicU64,
}

fn rgb_bytes(img: &Rgb32FImage) -> u64 {
    img.as_raw().len() as u64 * std::mem::size_of::<f32>() as u64
}

fn output_bytes(out: &PipelineOutput) -> u64 {
    let mut total = rgb_bytes(&out.geometry.oriented) + rgb_bytes(&out.output);
    if let Some(t) = &out.geometry.threshold {
        total += t.as_raw().len() as u64;
    }
    if let Some(c) = &out.geometry.contours {
        total += c.as_raw().len() as u64;
    }
    for img in [&out.pre_balance, &out.histogram].into_iter().flatten() {
        total += rgb_bytes(img);
    }
    total
}

impl Photo {
    /// A photo seeded from the configured default profile, linked to the
    /// global profile, with any saved sidecar applied.
    pub fn new(path: impl Into<PathBuf>, ctx: PhotoContext) -> Self {
        let path = path.into();
        let mut settings = ctx.config.defaults.clone();
        let mut use_global = true;
        if let Some(record) = ctx.sidecars.as_ref().and_then(|s| s.load(&path)) {
            log::debug!("restored settings for {}", path.display());
            settings = record.settings;
            use_global = record.use_global_settings;
        }
        Self::build(path, ctx, settings, use_global)
    }

    /// A photo with fixed, unlinked settings and no sidecar lookup.
    pub fn with_settings(path: impl Into<PathBuf>, ctx: PhotoContext, settings: SettingsProfile) -> Self {
        Self::build(path.into(), ctx, settings, false)
    }

    fn build(path: PathBuf, ctx: PhotoContext, settings: SettingsProfile, use_global: bool) -> Self {
        Self {
            path,
            ctx,
            state: Mutex::new(PhotoState {
                settings,
                use_global,
                settings_revision: 0,
                source: None,
                resolution: None,
                rendered: None,
                colour_desc: None,
            }),
            processed: AtomicBool::new(false),
            file_read_error: AtomicBool::new(false),
            active_processes: AtomicUsize::new(0),
            rendered_global: AtomicU64::new(0),
            memory_alloc: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PhotoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn effective(&self, state: &PhotoState) -> SettingsProfile {
        if state.use_global {
            let mut settings = state.settings.clone();
            settings.apply_synced_from(&self.ctx.global.snapshot());
            settings
        } else {
            state.settings.clone()
        }
    }

    fn invalidate(&self, state: &mut PhotoState) {
        state.settings_revision += 1;
        self.processed.store(false, Ordering::SeqCst);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// The settings currently in force.
    pub fn settings(&self) -> SettingsProfile {
        self.effective(&self.lock())
    }

    pub fn instance_settings(&self) -> SettingsProfile {
        self.lock().settings.clone()
    }

    pub fn get_setting(&self, key: SettingKey) -> SettingValue {
        self.settings().get(key)
    }

    pub fn uses_global(&self) -> bool {
        self.lock().use_global
    }

    /// Write one key to the profile in force for it. Returns whether the value
    /// changed. Does not reprocess.
    pub fn set_setting(&self, key: SettingKey, value: SettingValue) -> Result<bool, SettingsError> {
        if key == SettingKey::Reject
            && value == SettingValue::Bool(false)
            && self.file_read_error()
        {
            return Err(SettingsError::Unreadable);
        }
        let mut state = self.lock();
        if state.use_global && key.is_sync_eligible() {
            drop(state);
            return self.ctx.global.set(key, value);
        }
        let changed = state.settings.set(key, value)?;
        if changed && key.mutation() != Mutation::Cheap {
            self.invalidate(&mut state);
        }
        Ok(changed)
    }

    /// Link to or unlink from the global profile.
    ///
    /// Unlinking copies the effective settings into the instance profile, so
    /// what the photo looks like does not change.
    pub fn set_use_global(&self, use_global: bool) {
        let mut state = self.lock();
        if state.use_global == use_global {
            return;
        }
        if !use_global {
            state.settings = self.effective(&state);
        }
        state.use_global = use_global;
        self.invalidate(&mut state);
    }

    /// Replace the instance profile wholesale (paste, restore).
    pub fn replace_settings(&self, settings: SettingsProfile) {
        let mut state = self.lock();
        state.settings = settings;
        if self.file_read_error() {
            state.settings.reject = true;
        }
        self.invalidate(&mut state);
    }

    /// Back to the configured defaults.
    pub fn reset_settings(&self) {
        self.replace_settings(self.ctx.config.defaults.clone());
    }

    /// The effective settings and the link flag. A linked photo stores the
    /// global values it currently renders with.
    pub fn sidecar_record(&self) -> SidecarRecord {
        let state = self.lock();
        SidecarRecord::new(self.effective(&state), state.use_global)
    }

    /// Persist [`Photo::sidecar_record`]. `Ok(None)` when the photo has no
    /// sidecar store.
    pub fn save_settings(&self) -> Result<Option<PathBuf>, SidecarError> {
        let Some(store) = &self.ctx.sidecars else {
            return Ok(None);
        };
        store.save(&self.path, &self.sidecar_record()).map(Some)
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    pub fn is_processed(&self) -> bool {
        if !self.processed.load(Ordering::SeqCst) {
            return false;
        }
        !self.uses_global()
            || self.rendered_global.load(Ordering::SeqCst) == self.ctx.global.revision()
    }

    pub fn file_read_error(&self) -> bool {
        self.file_read_error.load(Ordering::SeqCst)
    }

    /// Number of `process` calls currently running.
    pub fn active_processes(&self) -> usize {
        self.active_processes.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().source.is_some()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.lock().resolution
    }

    pub fn colour_desc(&self) -> Option<ColourDescription> {
        self.lock().colour_desc.clone()
    }

    /// Largest buffer footprint observed for this photo, in bytes.
    pub fn memory_alloc(&self) -> u64 {
        self.memory_alloc.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    fn proxy_of(&self, image: &Rgb32FImage) -> Rgb32FImage {
        let dims = image.dimensions();
        let (w, h) = proxy_dimensions(dims, self.ctx.config.processing.max_proxy_size);
        if (w, h) == dims {
            image.clone()
        } else {
            imageops::resize(image, w, h, FilterType::Triangle)
        }
    }

    /// Decode the source at proxy or full resolution.
    ///
    /// A no-op when already loaded at that resolution. A proxy request on a
    /// fully loaded photo is served by downscaling without decoding again.
    /// Returns whether a buffer is available afterwards.
    pub fn load(&self, full_quality: bool) -> bool {
        let wanted = Resolution::of(full_quality);
        let full_source = {
            let state = self.lock();
            match (state.resolution, &state.source) {
                (Some(r), Some(_)) if r == wanted => return true,
                (Some(Resolution::Full), Some(src)) => Some(Arc::clone(src)),
                _ => None,
            }
        };

        let (image, colour_desc) = match full_source {
            Some(full) => (self.proxy_of(&full), None),
            None => match self.ctx.decoder.decode(&self.path, &self.ctx.config.import) {
                Ok(decoded) => {
                    let image = match wanted {
                        Resolution::Full => decoded.image,
                        Resolution::Proxy => self.proxy_of(&decoded.image),
                    };
                    (image, Some(decoded.colour_desc))
                }
                Err(e) => {
                    log::warn!("cannot read {}: {e}", self.path.display());
                    self.file_read_error.store(true, Ordering::SeqCst);
                    let mut state = self.lock();
                    state.source = None;
                    state.resolution = None;
                    state.rendered = None;
                    self.processed.store(false, Ordering::SeqCst);
                    return false;
                }
            },
        };

        self.file_read_error.store(false, Ordering::SeqCst);
        self.memory_alloc.fetch_max(rgb_bytes(&image), Ordering::SeqCst);
        let mut state = self.lock();
        state.source = Some(Arc::new(image));
        state.resolution = Some(wanted);
        state.rendered = None;
        if colour_desc.is_some() {
            state.colour_desc = colour_desc;
        }
        self.processed.store(false, Ordering::SeqCst);
        true
    }

    /// Run the pipeline against the current effective settings.
    ///
    /// - `skip_crop`: reuse the last crop geometry when nothing that affects it
    ///   changed since; otherwise the geometry is detected again
    /// - `background`: skip the diagnostic stages and drop the result if the
    ///   settings changed while it ran
    ///
    /// Returns whether new buffers were stored.
    pub fn process(&self, full_quality: bool, skip_crop: bool, background: bool) -> bool {
        let _busy = Busy::enter(&self.active_processes);
        if !self.load(full_quality) {
            return false;
        }

        let (source, settings, resolution, use_global, revision, global_revision, reuse) = {
            let state = self.lock();
            let (Some(source), Some(resolution)) = (state.source.clone(), state.resolution) else {
                return false;
            };
            // Revision first: a write between the two reads then only makes
            // this render look stale.
            let global_revision = self.ctx.global.revision();
            let settings = self.effective(&state);
            let reuse = if skip_crop {
                state
                    .rendered
                    .as_ref()
                    .filter(|r| r.resolution == resolution && r.settings.geometry_matches(&settings))
                    .map(|r| r.pipeline.geometry.clone())
            } else {
                None
            };
            if skip_crop && reuse.is_none() {
                log::debug!("{}: crop geometry not reusable, detecting again", self.file_name());
            }
            (
                source,
                settings,
                resolution,
                state.use_global,
                state.settings_revision,
                global_revision,
                reuse,
            )
        };

        let output = pipeline::run(&PipelineRequest {
            source: &source,
            settings: &settings,
            config: &self.ctx.config,
            reuse: reuse.as_ref(),
            diagnostics: !background,
        });

        let mut state = self.lock();
        let same_source = state
            .source
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &source));
        if !same_source {
            log::debug!("{}: buffers replaced during processing", self.file_name());
            return false;
        }
        let stale = state.settings_revision != revision
            || state.use_global != use_global
            || (use_global && self.ctx.global.revision() != global_revision);
        if stale && background {
            log::debug!("{}: discarding stale background render", self.file_name());
            return false;
        }

        let bytes = rgb_bytes(&source) + output_bytes(&output);
        self.memory_alloc.fetch_max(bytes, Ordering::SeqCst);
        state.rendered = Some(Rendered {
            pipeline: output,
            settings,
            resolution,
        });
        self.rendered_global.store(global_revision, Ordering::SeqCst);
        self.processed.store(!stale, Ordering::SeqCst);
        true
    }

    /// Buffer of a named stage (default: the final output). `None` when it
    /// has not been produced or the source could not be read.
    pub fn get_img(&self, stage: Option<Stage>) -> Option<StageImage> {
        if self.file_read_error() {
            return None;
        }
        let state = self.lock();
        let out = &state.rendered.as_ref()?.pipeline;
        match stage.unwrap_or_default() {
            Stage::Raw => Some(StageImage::Rgb(Arc::clone(&out.geometry.oriented))),
            Stage::Threshold => out.geometry.threshold.clone().map(StageImage::Mask),
            Stage::Contours => out.geometry.contours.clone().map(StageImage::Overlay),
            Stage::Histogram => out.histogram.clone().map(StageImage::Rgb),
            Stage::Final => Some(StageImage::Rgb(Arc::clone(&out.output))),
        }
    }

    /// Temperature and tint that neutralize the output at normalized `(x, y)`.
    ///
    /// The sample is read from the buffer before white balance, at the spot
    /// under `(x, y)` once the white frame is taken off. `None` for B&W film,
    /// crop-only film and unprocessed photos.
    pub fn wb_from_picker(&self, x: f32, y: f32) -> Option<(i32, i32)> {
        let state = self.lock();
        let out = &state.rendered.as_ref()?.pipeline;
        let pre = out.pre_balance.as_ref()?;
        let (ow, oh) = out.output.dimensions();
        let (pw, ph) = pre.dimensions();
        let frame = out.frame_px as f32;
        let nx = ((x.clamp(0.0, 1.0) * ow as f32 - frame) / pw as f32).clamp(0.0, 1.0);
        let ny = ((y.clamp(0.0, 1.0) * oh as f32 - frame) / ph as f32).clamp(0.0, 1.0);
        let rect = sample_window((pw, ph), nx, ny, self.ctx.config.processing.picker_radius);
        Some(colour::neutralizing_balance(colour::mean_colour(pre, rect)))
    }

    /// Write the picker's temperature and tint. Returns whether anything
    /// changed. Does not reprocess.
    pub fn set_wb_from_picker(&self, x: f32, y: f32) -> bool {
        let Some((temp, tint)) = self.wb_from_picker(x, y) else {
            return false;
        };
        let mut changed = false;
        for (key, value) in [(SettingKey::Temp, temp), (SettingKey::Tint, tint)] {
            match self.set_setting(key, SettingValue::Int(value)) {
                Ok(c) => changed |= c,
                Err(e) => log::warn!("picker could not set {key}: {e}"),
            }
        }
        changed
    }

    /// Colour of the RAW stage at normalized `(x, y)`, for manual base
    /// selection. Settings are not touched.
    pub fn get_base_colour(&self, x: f32, y: f32) -> Option<[u8; 3]> {
        let (raw, flip, rotation) = {
            let state = self.lock();
            match &state.rendered {
                Some(r) => (Arc::clone(&r.pipeline.geometry.oriented), false, 0),
                None => {
                    let settings = self.effective(&state);
                    (state.source.clone()?, settings.flip, settings.rotation)
                }
            }
        };
        let oriented;
        let raw: &Rgb32FImage = if flip || rotation.rem_euclid(4) != 0 {
            oriented = pipeline::orient(&raw, flip, rotation);
            &oriented
        } else {
            &raw
        };
        let rect = sample_window(
            raw.dimensions(),
            x,
            y,
            self.ctx.config.processing.picker_radius,
        );
        let mean = colour::mean_colour(raw, rect);
        Some(mean.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8))
    }

    /// Base colour taken from this photo as a blank (unexposed) film scan.
    pub fn blank_scan_base(&self) -> Option<[u8; 3]> {
        if !self.load(false) {
            return None;
        }
        let source = self.lock().source.clone()?;
        Some(colour::blank_scan_base(&source))
    }

    /// Release every pixel buffer. Settings, flags and the colour
    /// description survive.
    pub fn clear_memory(&self) {
        let mut state = self.lock();
        state.source = None;
        state.resolution = None;
        state.rendered = None;
        self.processed.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Photo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Photo")
            .field("path", &self.path)
            .field("processed", &self.is_processed())
            .field("file_read_error", &self.file_read_error())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::decoder::tests::MockDecoder;
    use crate::settings::FilmType;
    use crate::test_helpers::{bordered_frame, mock_context, negative_frame};
    use image::Rgb;
    use tempfile::TempDir;

    fn photo(frame: Rgb32FImage) -> (Photo, Arc<MockDecoder>) {
        let (ctx, mock) = mock_context(MockDecoder::new(frame), AppConfig::default());
        (Photo::new("/scans/roll1/001.dng", ctx), mock)
    }

    fn int(v: i32) -> SettingValue {
        SettingValue::Int(v)
    }

    // =========================================================================
    // load
    // =========================================================================

    #[test]
    fn load_is_idempotent() {
        let (p, mock) = photo(negative_frame(60, 40));
        assert!(p.load(false));
        assert!(p.load(false));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(p.colour_desc(), Some(ColourDescription("RGBG".into())));
    }

    #[test]
    fn proxy_load_respects_size_budget() {
        let mut config = AppConfig::default();
        config.processing.max_proxy_size = 200;
        let (ctx, _mock) = mock_context(MockDecoder::new(negative_frame(300, 200)), config);
        let p = Photo::new("/scans/a.dng", ctx);
        p.load(false);
        assert_eq!(p.resolution(), Some(Resolution::Proxy));
        p.process(false, false, false);
        let (w, h) = p.get_img(Some(Stage::Raw)).unwrap().dimensions();
        assert_eq!((w, h), (120, 80));
    }

    #[test]
    fn full_then_proxy_does_not_decode_again() {
        let mut config = AppConfig::default();
        config.processing.max_proxy_size = 200;
        let (ctx, mock) = mock_context(MockDecoder::new(negative_frame(300, 200)), config);
        let p = Photo::new("/scans/a.dng", ctx);
        assert!(p.load(true));
        assert!(p.load(false));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(p.resolution(), Some(Resolution::Proxy));
        assert!(p.load(true));
        assert_eq!(mock.call_count(), 2);
    }

    #[test]
    fn read_error_is_a_flag_not_a_panic() {
        let (ctx, _mock) = mock_context(
            MockDecoder::new(negative_frame(10, 10)).with_broken("/scans/bad.nef"),
            AppConfig::default(),
        );
        let p = Photo::new("/scans/bad.nef", ctx);
        assert!(!p.load(false));
        assert!(p.file_read_error());
        assert!(!p.process(false, false, false));
        assert!(p.get_img(None).is_none());
        assert!(!p.is_processed());
        assert_eq!(p.active_processes(), 0);
    }

    #[test]
    fn unreadable_photo_cannot_be_unrejected() {
        let (ctx, _mock) = mock_context(
            MockDecoder::new(negative_frame(10, 10)).with_broken("/scans/bad.nef"),
            AppConfig::default(),
        );
        let p = Photo::new("/scans/bad.nef", ctx);
        p.load(false);
        p.set_setting(SettingKey::Reject, SettingValue::Bool(true))
            .unwrap();
        assert_eq!(
            p.set_setting(SettingKey::Reject, SettingValue::Bool(false)),
            Err(SettingsError::Unreadable)
        );
        p.reset_settings();
        assert!(p.settings().reject);
    }

    // =========================================================================
    // process / freshness
    // =========================================================================

    #[test]
    fn process_sets_processed_and_fills_stages() {
        let (p, _mock) = photo(bordered_frame(200, 150, 10, 0.05, 0.8));
        assert!(!p.is_processed());
        assert!(p.process(false, false, false));
        assert!(p.is_processed());
        for stage in Stage::ALL {
            assert!(p.get_img(Some(stage)).is_some(), "{stage} missing");
        }
        assert_eq!(p.active_processes(), 0);
    }

    #[test]
    fn process_twice_is_identical() {
        let (p, _mock) = photo(negative_frame(80, 60));
        p.process(false, false, false);
        let a = p.get_img(None).unwrap().to_dynamic();
        p.process(false, false, false);
        let b = p.get_img(None).unwrap().to_dynamic();
        assert_eq!(a, b);
    }

    #[test]
    fn background_render_skips_diagnostics() {
        let (p, _mock) = photo(negative_frame(80, 60));
        assert!(p.process(false, false, true));
        assert!(p.is_processed());
        assert!(p.get_img(None).is_some());
        assert!(p.get_img(Some(Stage::Threshold)).is_none());
        assert!(p.get_img(Some(Stage::Histogram)).is_none());
    }

    #[test]
    fn instance_write_invalidates_unless_cheap() {
        let (p, _mock) = photo(negative_frame(40, 30));
        p.set_use_global(false);
        p.process(false, false, false);
        assert!(p.set_setting(SettingKey::Reject, SettingValue::Bool(true)).unwrap());
        assert!(p.is_processed());
        assert!(p.set_setting(SettingKey::Temp, int(10)).unwrap());
        assert!(!p.is_processed());
    }

    #[test]
    fn unchanged_write_keeps_processed() {
        let (p, _mock) = photo(negative_frame(40, 30));
        p.set_use_global(false);
        p.process(false, false, false);
        assert!(!p.set_setting(SettingKey::Sat, int(100)).unwrap());
        assert!(p.is_processed());
    }

    #[test]
    fn global_write_invalidates_linked_photos_only() {
        let (ctx, _mock) = mock_context(MockDecoder::new(negative_frame(40, 30)), AppConfig::default());
        let linked = Photo::new("/scans/a.dng", ctx.clone());
        let own = Photo::new("/scans/b.dng", ctx.clone());
        own.set_use_global(false);
        linked.process(false, false, false);
        own.process(false, false, false);

        ctx.global.set(SettingKey::Gamma, int(30)).unwrap();
        assert!(!linked.is_processed());
        assert!(own.is_processed());
        assert_eq!(linked.settings().gamma, 30);
        assert_eq!(own.settings().gamma, 0);
    }

    #[test]
    fn linked_photo_keeps_its_own_rotation() {
        let (ctx, _mock) = mock_context(MockDecoder::new(negative_frame(40, 30)), AppConfig::default());
        let p = Photo::new("/scans/a.dng", ctx.clone());
        p.set_setting(SettingKey::Rotation, int(1)).unwrap();
        p.set_setting(SettingKey::Sat, int(150)).unwrap();
        assert_eq!(ctx.global.snapshot().rotation, 0);
        assert_eq!(ctx.global.snapshot().sat, 150);
        assert_eq!(p.settings().rotation, 1);
    }

    #[test]
    fn unlinking_keeps_the_look() {
        let (ctx, _mock) = mock_context(MockDecoder::new(negative_frame(40, 30)), AppConfig::default());
        ctx.global.set(SettingKey::Temp, int(25)).unwrap();
        let p = Photo::new("/scans/a.dng", ctx.clone());
        p.set_use_global(false);
        assert_eq!(p.settings().temp, 25);
        ctx.global.set(SettingKey::Temp, int(-5)).unwrap();
        assert_eq!(p.settings().temp, 25);
    }

    #[test]
    fn skip_crop_reuses_geometry() {
        let (p, _mock) = photo(bordered_frame(200, 150, 10, 0.05, 0.8));
        p.set_use_global(false);
        p.process(false, false, false);
        let StageImage::Rgb(before) = p.get_img(Some(Stage::Raw)).unwrap() else {
            panic!("RAW stage is RGB")
        };
        p.set_setting(SettingKey::Temp, int(30)).unwrap();
        p.process(false, true, false);
        let StageImage::Rgb(after) = p.get_img(Some(Stage::Raw)).unwrap() else {
            panic!("RAW stage is RGB")
        };
        assert!(Arc::ptr_eq(&before, &after));
        assert!(p.is_processed());
    }

    #[test]
    fn skip_crop_is_ignored_after_geometry_change() {
        let (p, _mock) = photo(bordered_frame(200, 150, 10, 0.05, 0.8));
        p.set_use_global(false);
        p.process(false, false, false);
        p.set_setting(SettingKey::Rotation, int(1)).unwrap();
        p.process(false, true, false);
        assert_eq!(p.get_img(Some(Stage::Raw)).unwrap().dimensions(), (150, 200));
    }

    #[test]
    fn clear_memory_keeps_settings_and_description() {
        let (p, mock) = photo(negative_frame(40, 30));
        p.set_use_global(false);
        p.set_setting(SettingKey::Tint, int(7)).unwrap();
        p.process(false, false, false);
        p.clear_memory();
        assert!(!p.is_loaded());
        assert!(!p.is_processed());
        assert!(p.get_img(None).is_none());
        assert_eq!(p.settings().tint, 7);
        assert!(p.colour_desc().is_some());
        assert!(p.memory_alloc() > 0);
        p.process(false, false, false);
        assert_eq!(mock.call_count(), 2);
    }

    // =========================================================================
    // Pickers
    // =========================================================================

    fn cast_slide() -> Rgb32FImage {
        Rgb32FImage::from_fn(100, 100, |x, y| Rgb([x as f32 / 99.0, 0.5, y as f32 / 99.0]))
    }

    #[test]
    fn wb_picker_neutralizes_the_sampled_spot() {
        let (p, _mock) = photo(cast_slide());
        p.set_use_global(false);
        p.set_setting(SettingKey::FilmType, SettingValue::FilmType(FilmType::Slide))
            .unwrap();
        p.process(false, false, false);
        assert!(p.set_wb_from_picker(0.35, 0.65));
        assert!(!p.is_processed());
        p.process(false, true, false);
        let StageImage::Rgb(out) = p.get_img(None).unwrap() else {
            panic!("final stage is RGB")
        };
        let [r, g, b] = out.get_pixel(35, 65).0;
        assert!((r - g).abs() < 0.02 && (b - g).abs() < 0.02, "{r} {g} {b}");
    }

    #[test]
    fn wb_picker_is_a_no_op_for_bw() {
        let (p, _mock) = photo(negative_frame(40, 30));
        p.process(false, false, false);
        assert_eq!(p.wb_from_picker(0.5, 0.5), None);
        assert!(!p.set_wb_from_picker(0.5, 0.5));
    }

    #[test]
    fn base_colour_samples_raw_stage_without_mutation() {
        let (p, _mock) = photo(negative_frame(90, 60));
        p.process(false, false, false);
        let before = p.settings();
        let [r, g, b] = p.get_base_colour(0.05, 0.05).unwrap();
        assert!(r.abs_diff(230) <= 1 && g.abs_diff(153) <= 1 && b.abs_diff(102) <= 1);
        assert_eq!(p.settings(), before);
    }

    #[test]
    fn base_colour_works_before_processing() {
        let (p, _mock) = photo(negative_frame(90, 60));
        p.load(false);
        assert!(p.get_base_colour(0.5, 0.5).is_some());
    }

    #[test]
    fn blank_scan_gives_base() {
        let (p, _mock) = photo(Rgb32FImage::from_pixel(20, 20, Rgb([0.8, 0.4, 0.2])));
        assert_eq!(p.blank_scan_base(), Some([204, 102, 51]));
    }

    // =========================================================================
    // Sidecars
    // =========================================================================

    #[test]
    fn saved_settings_are_restored_at_creation() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _mock) = mock_context(MockDecoder::new(negative_frame(10, 10)), AppConfig::default());
        let ctx = ctx.with_sidecars(SidecarStore::new(tmp.path()));

        let p = Photo::new("/scans/roll2/007.dng", ctx.clone());
        p.set_use_global(false);
        p.set_setting(SettingKey::Gamma, int(-15)).unwrap();
        assert!(p.save_settings().unwrap().is_some());

        let restored = Photo::new("/scans/roll2/007.dng", ctx);
        assert!(!restored.uses_global());
        assert_eq!(restored.settings().gamma, -15);
    }

    #[test]
    fn linked_photo_saves_the_global_values_it_uses() {
        let tmp = TempDir::new().unwrap();
        let store = SidecarStore::new(tmp.path());
        let (ctx, _mock) = mock_context(MockDecoder::new(negative_frame(10, 10)), AppConfig::default());
        let ctx = ctx.with_sidecars(store.clone());

        let p = Photo::new("/scans/roll2/008.dng", ctx.clone());
        ctx.global.set(SettingKey::Gamma, int(30)).unwrap();
        p.set_setting(SettingKey::Rotation, int(2)).unwrap();
        p.save_settings().unwrap();

        let record = store.load(Path::new("/scans/roll2/008.dng")).unwrap();
        assert!(record.use_global_settings);
        assert_eq!(record.settings.gamma, 30);
        assert_eq!(record.settings.rotation, 2);
    }

    #[test]
    fn save_without_store_is_none() {
        let (p, _mock) = photo(negative_frame(10, 10));
        assert!(p.save_settings().unwrap().is_none());
    }
}
