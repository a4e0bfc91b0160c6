//! Export engine: full-quality renders written to disk.
//!
//! ## Single export
//!
//! [`ExportEngine::export_single`] loads and processes one photo at full
//! resolution on the calling thread and writes the result.
//!
//! ## Batch export
//!
//! [`ExportEngine::export_batch`] snapshots the effective settings of every
//! non-rejected photo and renders each snapshot into a fresh, private
//! [`Photo`] on a dedicated worker pool, so the interactive photos and their
//! preview buffers are never touched.
//!
//! - **Pool size**: the configured override, or the memory estimate from
//!   [`worker_pool_size`]; never more than the cores or the batch.
//! - **Isolation**: every attempt runs under `catch_unwind`, so a panicking
//!   decode or stage only fails its own photo. Workers are threads, not
//!   processes: an abort (or a `panic = "abort"` build) still ends the batch.
//! - **Retries**: up to [`MAX_ATTEMPTS`] attempts per photo; after that the
//!   photo is reported as a failure. One bad photo never stops the batch.
//! - **Cancellation**: workers check the shared [`CancellationToken`] before
//!   loading, before processing and before writing. A cancelled photo writes
//!   nothing and is not retried. Cancellation is not an error; the report
//!   just says the batch was cancelled.

use crate::config::{AppConfig, hardware_concurrency};
use crate::events::{Event, emit};
use crate::imaging::calculations::worker_pool_size;
use crate::imaging::{EncodeError, ExportFormat, RawDecoder, write_image};
use crate::photo::{Photo, PhotoContext};
use crate::pipeline::Stage;
use crate::settings::SettingsProfile;
use rayon::prelude::*;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use thiserror::Error;

/// Attempts per photo before it is reported as failed.
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("export cancelled")]
    Cancelled,
    #[error("could not read {}", .0.display())]
    Unreadable(PathBuf),
    #[error("no output was produced for {}", .0.display())]
    NoOutput(PathBuf),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("cannot start export workers: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A photo that could not be exported.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportFailure {
    pub source: PathBuf,
    /// Attempts made before giving up.
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportReport {
    /// Files written, in batch order.
    pub exported: Vec<PathBuf>,
    pub failures: Vec<ExportFailure>,
    /// Rejected photos left out of the batch.
    pub skipped: Vec<PathBuf>,
    pub cancelled: bool,
    pub workers: usize,
}

/// One photo of a batch: its source and the settings it renders with.
#[derive(Debug, Clone)]
struct ExportJob {
    source: PathBuf,
    settings: SettingsProfile,
    destination: PathBuf,
}

enum Outcome {
    Exported(PathBuf),
    Cancelled,
    Failed(ExportFailure),
}

/// Destination for `source` in `output_dir`: same stem, the format's extension.
pub fn export_path(output_dir: &Path, source: &Path, format: ExportFormat) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    output_dir.join(format!("{stem}.{}", format.extension()))
}

/// `MemAvailable` from `/proc/meminfo`, in bytes. `None` where that file does
/// not exist.
pub fn available_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available(&meminfo)
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

pub struct ExportEngine {
    decoder: Arc<dyn RawDecoder>,
    config: Arc<AppConfig>,
    token: CancellationToken,
    events: Option<Sender<Event>>,
}

impl ExportEngine {
    pub fn new(decoder: Arc<dyn RawDecoder>, config: Arc<AppConfig>) -> Self {
        Self {
            decoder,
            config,
            token: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Handle for cancelling from another thread.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Ask running exports to stop. Workers stop at their next check; files
    /// already written stay.
    pub fn abort(&self) {
        log::info!("export abort requested");
        self.token.cancel();
    }

    fn write(&self, photo: &Photo, destination: &Path) -> Result<PathBuf, ExportError> {
        let output = photo
            .get_img(Some(Stage::Final))
            .and_then(|img| img.as_rgb().cloned())
            .ok_or_else(|| ExportError::NoOutput(photo.path().to_path_buf()))?;
        if let Some(dir) = destination.parent() {
            std::fs::create_dir_all(dir)?;
        }
        write_image(&output, destination, &self.config.export_params())?;
        Ok(destination.to_path_buf())
    }

    /// Load, process and write one photo at full resolution, synchronously.
    pub fn export_single(&self, photo: &Photo, destination: &Path) -> Result<PathBuf, ExportError> {
        if !photo.load(true) {
            return Err(ExportError::Unreadable(photo.path().to_path_buf()));
        }
        if !photo.process(true, false, false) {
            return Err(ExportError::NoOutput(photo.path().to_path_buf()));
        }
        self.write(photo, destination)
    }

    fn attempt(&self, job: &ExportJob) -> Result<PathBuf, ExportError> {
        let ctx = PhotoContext::new(Arc::clone(&self.decoder), Arc::clone(&self.config));
        let photo = Photo::with_settings(&job.source, ctx, job.settings.clone());

        if self.token.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        if !photo.load(true) {
            return Err(ExportError::Unreadable(job.source.clone()));
        }
        if self.token.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        if !photo.process(true, false, true) {
            return Err(ExportError::NoOutput(job.source.clone()));
        }
        if self.token.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        self.write(&photo, &job.destination)
    }

    fn run_job(&self, job: &ExportJob) -> Outcome {
        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            if self.token.is_cancelled() {
                return Outcome::Cancelled;
            }
            let result = catch_unwind(AssertUnwindSafe(|| self.attempt(job)))
                .unwrap_or_else(|payload| Err(ExportError::Panicked(panic_message(&*payload))));
            match result {
                Ok(path) => return Outcome::Exported(path),
                Err(ExportError::Cancelled) => return Outcome::Cancelled,
                Err(e) => {
                    log::warn!(
                        "export of {} failed (attempt {attempt}/{MAX_ATTEMPTS}): {e}",
                        job.source.display()
                    );
                    last_error = e.to_string();
                }
            }
        }
        Outcome::Failed(ExportFailure {
            source: job.source.clone(),
            attempts: MAX_ATTEMPTS,
            message: last_error,
        })
    }

    /// Export every non-rejected photo into `output_dir`.
    ///
    /// Per-photo failures and cancellation are reported in the
    /// [`ExportReport`]; `Err` means the batch could not start at all.
    pub fn export_batch(&self, photos: &[Arc<Photo>], output_dir: &Path) -> Result<ExportReport, ExportError> {
        std::fs::create_dir_all(output_dir)?;
        let format = self.config.export.file_type;
        let mut report = ExportReport::default();
        let mut jobs = Vec::new();

        for photo in photos {
            // A read error seen earlier may be transient; only the reject
            // flag keeps a photo out.
            let settings = photo.settings();
            if settings.reject {
                report.skipped.push(photo.path().to_path_buf());
                continue;
            }
            jobs.push(ExportJob {
                source: photo.path().to_path_buf(),
                destination: export_path(output_dir, photo.path(), format),
                settings,
            });
        }

        let observed: Vec<u64> = photos.iter().map(|p| p.memory_alloc()).collect();
        let workers = worker_pool_size(
            self.config.export.max_processors_override,
            hardware_concurrency(),
            jobs.len(),
            available_memory(),
            &observed,
        );
        report.workers = workers;
        log::info!("exporting {} photos with {workers} workers", jobs.len());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("export-{i}"))
            .build()?;

        let total = jobs.len();
        let done = AtomicUsize::new(0);
        let outcomes: Vec<Outcome> = pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    let outcome = self.run_job(job);
                    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                    match &outcome {
                        Outcome::Exported(destination) => emit(
                            self.events.as_ref(),
                            Event::PhotoExported {
                                source: job.source.clone(),
                                destination: destination.clone(),
                            },
                        ),
                        Outcome::Failed(failure) => emit(
                            self.events.as_ref(),
                            Event::PhotoFailed {
                                source: failure.source.clone(),
                                message: failure.message.clone(),
                            },
                        ),
                        Outcome::Cancelled => {}
                    }
                    emit(
                        self.events.as_ref(),
                        Event::progress(finished, total, "exporting"),
                    );
                    outcome
                })
                .collect()
        });

        for outcome in outcomes {
            match outcome {
                Outcome::Exported(path) => report.exported.push(path),
                Outcome::Failed(failure) => report.failures.push(failure),
                Outcome::Cancelled => report.cancelled = true,
            }
        }
        report.cancelled |= self.token.is_cancelled();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::decoder::tests::MockDecoder;
    use crate::settings::{SettingKey, SettingValue};
    use crate::test_helpers::{bordered_frame, mock_context, negative_frame, scan_paths};
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn engine_with(mock: MockDecoder, config: AppConfig) -> (ExportEngine, Arc<MockDecoder>, Vec<Arc<Photo>>) {
        let (ctx, mock) = mock_context(mock, config);
        let photos = scan_paths(4)
            .into_iter()
            .map(|p| Arc::new(Photo::new(p, ctx.clone())))
            .collect();
        let engine = ExportEngine::new(mock.clone(), Arc::clone(&ctx.config));
        (engine, mock, photos)
    }

    fn single_worker() -> AppConfig {
        let mut config = AppConfig::default();
        config.export.max_processors_override = 1;
        config
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn export_path_swaps_extension() {
        let p = export_path(Path::new("/out"), Path::new("/scans/001.dng"), ExportFormat::Tiff);
        assert_eq!(p, PathBuf::from("/out/001.tif"));
    }

    #[test]
    fn parses_mem_available() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:  100 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(8_000_000 * 1024));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn token_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    // =========================================================================
    // Single export
    // =========================================================================

    #[test]
    fn single_export_writes_full_resolution() {
        let tmp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.processing.max_proxy_size = 100;
        let (engine, _mock, photos) = engine_with(MockDecoder::new(bordered_frame(240, 160, 8, 0.05, 0.8)), config);
        let dest = tmp.path().join("one.jpg");
        let written = engine.export_single(&photos[0], &dest).unwrap();
        assert_eq!(written, dest);
        let img = image::open(&dest).unwrap();
        let expected = photos[0].get_img(Some(Stage::Final)).unwrap().dimensions();
        assert_eq!((img.width(), img.height()), expected);
        assert!(img.width() > 100);
    }

    #[test]
    fn single_export_of_unreadable_photo_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let paths = scan_paths(1);
        let (engine, _mock, photos) = engine_with(
            MockDecoder::new(negative_frame(20, 20)).with_broken(paths[0].clone()),
            AppConfig::default(),
        );
        let err = engine
            .export_single(&photos[0], &tmp.path().join("x.jpg"))
            .unwrap_err();
        assert!(matches!(err, ExportError::Unreadable(_)));
    }

    // =========================================================================
    // Batch export
    // =========================================================================

    #[test]
    fn batch_exports_all_non_rejected() {
        let tmp = TempDir::new().unwrap();
        let (engine, _mock, photos) = engine_with(MockDecoder::new(bordered_frame(60, 40, 4, 0.05, 0.8)), AppConfig::default());
        photos[2]
            .set_setting(SettingKey::Reject, SettingValue::Bool(true))
            .unwrap();
        let report = engine.export_batch(&photos, tmp.path()).unwrap();
        assert_eq!(report.exported.len(), 3);
        assert_eq!(report.skipped, vec![photos[2].path().to_path_buf()]);
        assert!(report.failures.is_empty());
        assert!(!report.cancelled);
        assert_eq!(files_in(tmp.path()), 3);
        assert!(report.workers >= 1 && report.workers <= 3);
    }

    #[test]
    fn batch_does_not_touch_interactive_photos() {
        let tmp = TempDir::new().unwrap();
        let (engine, _mock, photos) = engine_with(MockDecoder::new(negative_frame(30, 20)), AppConfig::default());
        engine.export_batch(&photos, tmp.path()).unwrap();
        assert!(photos.iter().all(|p| !p.is_loaded()));
    }

    #[test]
    fn transient_failures_are_retried() {
        let tmp = TempDir::new().unwrap();
        let (engine, mock, photos) = engine_with(
            MockDecoder::new(negative_frame(30, 20)).with_transient_failures(2),
            single_worker(),
        );
        let report = engine.export_batch(&photos[..1], tmp.path()).unwrap();
        assert_eq!(report.exported.len(), 1);
        assert!(report.failures.is_empty());
        assert_eq!(mock.call_count(), 3);
    }

    #[test]
    fn persistent_failure_is_retried_five_times_then_reported() {
        let tmp = TempDir::new().unwrap();
        let paths = scan_paths(4);
        let (engine, mock, photos) = engine_with(
            MockDecoder::new(negative_frame(30, 20)).with_broken(paths[1].clone()),
            single_worker(),
        );
        let report = engine.export_batch(&photos, tmp.path()).unwrap();
        assert_eq!(report.exported.len(), 3);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.source, paths[1]);
        assert_eq!(failure.attempts, MAX_ATTEMPTS);
        assert!(failure.message.contains("could not read"));
        assert_eq!(mock.calls_for(&paths[1]), MAX_ATTEMPTS as usize);
    }

    #[test]
    fn earlier_read_error_is_retried_in_the_batch() {
        let tmp = TempDir::new().unwrap();
        let (engine, mock, photos) = engine_with(
            MockDecoder::new(negative_frame(30, 20)).with_transient_failures(1),
            single_worker(),
        );
        assert!(!photos[0].load(false));
        assert!(photos[0].file_read_error());
        let report = engine.export_batch(&photos[..1], tmp.path()).unwrap();
        assert_eq!(report.exported.len(), 1);
        assert!(report.failures.is_empty());
        assert_eq!(mock.calls_for(photos[0].path()), 2);
    }

    #[test]
    fn rejected_unreadable_photo_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let paths = scan_paths(4);
        let (engine, mock, photos) = engine_with(
            MockDecoder::new(negative_frame(30, 20)).with_broken(paths[0].clone()),
            single_worker(),
        );
        photos[0].load(false);
        photos[0]
            .set_setting(SettingKey::Reject, SettingValue::Bool(true))
            .unwrap();
        let report = engine.export_batch(&photos, tmp.path()).unwrap();
        assert_eq!(report.skipped, vec![paths[0].clone()]);
        assert!(report.failures.is_empty());
        assert_eq!(report.exported.len(), 3);
        assert_eq!(mock.calls_for(&paths[0]), 1);
    }

    #[test]
    fn abort_mid_batch_keeps_written_files() {
        let tmp = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let (ctx, _mock) = mock_context(
            MockDecoder::new(negative_frame(30, 20)).cancel_on_call(4, token.clone()),
            single_worker(),
        );
        let photos: Vec<Arc<Photo>> = scan_paths(10)
            .into_iter()
            .map(|p| Arc::new(Photo::new(p, ctx.clone())))
            .collect();
        let engine = ExportEngine::new(Arc::clone(&ctx.decoder), Arc::clone(&ctx.config)).with_token(token);

        let report = engine.export_batch(&photos, tmp.path()).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.exported.len(), 3);
        assert!(report.failures.is_empty());
        assert_eq!(files_in(tmp.path()), 3);
    }

    #[test]
    fn abort_before_start_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let (engine, mock, photos) = engine_with(MockDecoder::new(negative_frame(30, 20)), AppConfig::default());
        engine.abort();
        let report = engine.export_batch(&photos, tmp.path()).unwrap();
        assert!(report.cancelled);
        assert!(report.exported.is_empty());
        assert_eq!(mock.call_count(), 0);
        assert_eq!(files_in(tmp.path()), 0);
    }

    #[test]
    fn batch_reports_events() {
        let tmp = TempDir::new().unwrap();
        let (engine, _mock, photos) = engine_with(MockDecoder::new(negative_frame(30, 20)), single_worker());
        let (tx, rx) = mpsc::channel();
        let engine = engine.with_events(tx);
        engine.export_batch(&photos[..2], tmp.path()).unwrap();
        drop(engine);
        let events: Vec<Event> = rx.iter().collect();
        let exported = events
            .iter()
            .filter(|e| matches!(e, Event::PhotoExported { .. }))
            .count();
        assert_eq!(exported, 2);
        assert!(events.contains(&Event::Progress {
            percent: 100,
            message: "exporting".into()
        }));
    }
}
