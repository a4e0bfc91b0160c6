//! The working set of photos: import, selection and settings edits.
//!
//! A [`Collection`] owns the photos of one session, the shared
//! [`GlobalProfile`] they link to, and the [`ResourceCache`] that keeps the
//! neighbourhood of the current photo decoded. Every settings write made
//! through it is announced as [`Event::SettingsChanged`] and marks the
//! collection unsaved until [`Collection::save_settings`] runs.
//!
//! Nothing here reprocesses: a write only makes the affected photos report
//! `is_processed() == false`, and callers decide when to call
//! [`Photo::process`].

use crate::cache::{CacheStats, ResourceCache};
use crate::events::{Event, emit};
use crate::photo::{Photo, PhotoContext};
use crate::settings::{
    BaseDetect, GlobalProfile, SettingKey, SettingValue, SettingsError, SettingsProfile,
};
use crate::sidecar::SidecarError;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("no photo at index {0}")]
    NoSuchPhoto(usize),
    #[error("nothing has been copied")]
    EmptyClipboard,
    #[error("could not read blank scan {}", .0.display())]
    BlankScan(PathBuf),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("sidecar error: {0}")]
    Sidecar(#[from] SidecarError),
    #[error("cannot start preload workers: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Outcome of [`Collection::import`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub imported: usize,
    /// Files that could not be decoded. They stay in the collection,
    /// rejected.
    pub unreadable: Vec<PathBuf>,
}

pub struct Collection {
    ctx: PhotoContext,
    photos: Vec<Arc<Photo>>,
    current: usize,
    cache: ResourceCache,
    events: Option<Sender<Event>>,
    clipboard: Option<SettingsProfile>,
    unsaved: bool,
}

impl Collection {
    pub fn new(ctx: PhotoContext, events: Option<Sender<Event>>) -> Result<Self, CollectionError> {
        let cache = ResourceCache::new(ctx.config.processing.preload)?;
        Ok(Self {
            ctx,
            photos: Vec::new(),
            current: 0,
            cache,
            events,
            clipboard: None,
            unsaved: false,
        })
    }

    pub fn context(&self) -> &PhotoContext {
        &self.ctx
    }

    pub fn global(&self) -> &GlobalProfile {
        &self.ctx.global
    }

    pub fn photos(&self) -> &[Arc<Photo>] {
        &self.photos
    }

    pub fn photo(&self, index: usize) -> Option<&Arc<Photo>> {
        self.photos.get(index)
    }

    pub fn len(&self) -> usize {
        self.photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photos.is_empty()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn is_unsaved(&self) -> bool {
        self.unsaved
    }

    fn get(&self, index: usize) -> Result<&Arc<Photo>, CollectionError> {
        self.photos
            .get(index)
            .ok_or(CollectionError::NoSuchPhoto(index))
    }

    fn changed(&mut self, key: Option<SettingKey>, global: bool, index: Option<usize>) {
        self.unsaved = true;
        emit(
            self.events.as_ref(),
            Event::SettingsChanged { key, global, index },
        );
    }

    // ------------------------------------------------------------------
    // Import / removal
    // ------------------------------------------------------------------

    /// Add `paths` to the collection.
    ///
    /// Each file is decoded once at proxy size to check it can be read and
    /// to pick up its colour description; the buffers are then released and
    /// left to the cache. Unreadable files are kept but rejected.
    pub fn import(&mut self, paths: &[PathBuf]) -> ImportReport {
        let total = paths.len();
        let done = AtomicUsize::new(0);
        let events = self.events.clone();
        let ctx = &self.ctx;

        let imported: Vec<(Arc<Photo>, bool)> = paths
            .par_iter()
            .map(|path| {
                let photo = Arc::new(Photo::new(path, ctx.clone()));
                let readable = photo.load(false);
                photo.clear_memory();
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                emit(events.as_ref(), Event::progress(finished, total, "importing"));
                (photo, readable)
            })
            .collect();

        let mut report = ImportReport::default();
        for (photo, readable) in imported {
            if !readable {
                log::warn!("cannot read {}, rejecting it", photo.path().display());
                // Reject is per-photo, so this never reaches the global profile.
                if let Err(e) = photo.set_setting(SettingKey::Reject, SettingValue::Bool(true)) {
                    log::warn!("cannot reject {}: {e}", photo.path().display());
                }
                report.unreadable.push(photo.path().to_path_buf());
            }
            report.imported += 1;
            self.photos.push(photo);
        }
        log::info!(
            "imported {} photos ({} unreadable)",
            report.imported,
            report.unreadable.len()
        );
        report
    }

    /// Drop the photo at `index`. Waits for background loads first so no
    /// task outlives its slot.
    pub fn remove(&mut self, index: usize) -> Result<Arc<Photo>, CollectionError> {
        self.get(index)?;
        self.cache.wait_idle();
        let photo = self.photos.remove(index);
        if self.current >= self.photos.len() {
            self.current = self.photos.len().saturating_sub(1);
        }
        Ok(photo)
    }

    /// Make `index` the current photo and move the preload window there.
    pub fn select(&mut self, index: usize) -> Result<CacheStats, CollectionError> {
        self.get(index)?;
        self.current = index;
        Ok(self.cache.update(index, &self.photos))
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Write one key on one photo. Linked photos forward sync-eligible keys
    /// to the global profile, which invalidates every linked photo.
    pub fn set_setting(
        &mut self,
        index: usize,
        key: SettingKey,
        value: SettingValue,
    ) -> Result<bool, CollectionError> {
        let photo = self.get(index)?;
        let global = photo.uses_global() && key.is_sync_eligible();
        let changed = photo.set_setting(key, value)?;
        if changed {
            self.changed(Some(key), global, (!global).then_some(index));
        }
        Ok(changed)
    }

    /// Write one key on the global profile.
    pub fn set_global(&mut self, key: SettingKey, value: SettingValue) -> Result<bool, CollectionError> {
        if !key.is_sync_eligible() {
            return Err(SettingsError::NotSyncEligible(key).into());
        }
        let changed = self.ctx.global.set(key, value)?;
        if changed {
            self.changed(Some(key), true, None);
        }
        Ok(changed)
    }

    pub fn set_use_global(&mut self, index: usize, use_global: bool) -> Result<(), CollectionError> {
        let photo = self.get(index)?;
        if photo.uses_global() != use_global {
            photo.set_use_global(use_global);
            self.changed(None, false, Some(index));
        }
        Ok(())
    }

    /// Copy the effective settings of `index` to the clipboard.
    pub fn copy_settings(&mut self, index: usize) -> Result<(), CollectionError> {
        self.clipboard = Some(self.get(index)?.settings());
        Ok(())
    }

    pub fn clipboard(&self) -> Option<&SettingsProfile> {
        self.clipboard.as_ref()
    }

    /// Paste the clipboard onto photo `index`, or onto the global profile
    /// when `to_global` is set (then `index` is ignored).
    ///
    /// A photo paste unlinks the photo and keeps its own `reject` and
    /// `rotation`.
    pub fn paste_settings(&mut self, index: usize, to_global: bool) -> Result<(), CollectionError> {
        let clipboard = self.clipboard.clone().ok_or(CollectionError::EmptyClipboard)?;
        if to_global {
            let mut profile = self.ctx.global.snapshot();
            profile.apply_synced_from(&clipboard);
            self.ctx.global.replace(profile);
            self.changed(None, true, None);
            return Ok(());
        }
        let photo = self.get(index)?;
        let mut profile = photo.settings();
        profile.apply_synced_from(&clipboard);
        photo.set_use_global(false);
        photo.replace_settings(profile);
        self.changed(None, false, Some(index));
        Ok(())
    }

    /// Reset photo `index` (or the global profile for `None`) to the
    /// configured defaults.
    pub fn reset_settings(&mut self, index: Option<usize>) -> Result<(), CollectionError> {
        match index {
            Some(i) => self.get(i)?.reset_settings(),
            None => self.ctx.global.replace(self.ctx.config.defaults.clone()),
        }
        self.changed(None, index.is_none(), index);
        Ok(())
    }

    /// Write every photo's sidecar. Returns how many were written.
    pub fn save_settings(&mut self) -> Result<usize, CollectionError> {
        let mut written = 0;
        for photo in &self.photos {
            if photo.save_settings()?.is_some() {
                written += 1;
            }
        }
        self.unsaved = false;
        log::debug!("saved {written} sidecars");
        Ok(written)
    }

    /// Take the film base colour from a blank scan and switch the target to
    /// manual base detection. `None` targets the global profile.
    pub fn apply_blank_scan(&mut self, path: &Path, index: Option<usize>) -> Result<[u8; 3], CollectionError> {
        let blank = Photo::with_settings(path, self.ctx.clone(), SettingsProfile::default());
        let base = blank
            .blank_scan_base()
            .ok_or_else(|| CollectionError::BlankScan(path.to_path_buf()))?;
        log::info!("blank scan base colour {base:?}");
        let writes = [
            (SettingKey::BaseRgb, SettingValue::Rgb(base)),
            (SettingKey::BaseDetect, SettingValue::BaseDetect(BaseDetect::Manual)),
        ];
        for (key, value) in writes {
            match index {
                Some(i) => self.set_setting(i, key, value)?,
                None => self.set_global(key, value)?,
            };
        }
        Ok(base)
    }
}
