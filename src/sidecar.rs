//! Per-photo settings sidecars.
//!
//! Each photo's settings are stored as a small JSON file named after the
//! SHA-256 of its source path:
//!
//! ```text
//! ~/.film_scan_converter/settings/3f1c…e9.json
//! {
//!   "version": 1,
//!   "use_global_settings": false,
//!   "settings": { "film_type": "colour_negative", "temp": 12, ... }
//! }
//! ```
//!
//! Keying by path instead of content means renaming or moving a scan loses
//! its settings, while re-exporting an edited RAW keeps them. The sidecars
//! live outside the scan folders so read-only archives can be processed.
//!
//! Loading is forgiving in the same way the config is: a missing file means
//! "no saved settings", and an unreadable or corrupt file is logged and
//! treated as missing. Settings keys a sidecar does not mention take their
//! defaults.

use crate::config::config_dir;
use crate::settings::SettingsProfile;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Version of the sidecar format. Files with another version are ignored.
const SIDECAR_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a sidecar file holds for one photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarRecord {
    pub version: u32,
    pub use_global_settings: bool,
    pub settings: SettingsProfile,
}

impl Default for SidecarRecord {
    fn default() -> Self {
        Self {
            version: SIDECAR_VERSION,
            use_global_settings: true,
            settings: SettingsProfile::default(),
        }
    }
}

impl SidecarRecord {
    pub fn new(settings: SettingsProfile, use_global_settings: bool) -> Self {
        Self {
            version: SIDECAR_VERSION,
            use_global_settings,
            settings,
        }
    }
}

/// Directory of sidecar files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarStore {
    dir: PathBuf,
}

impl SidecarStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<config_dir>/settings`, when a home directory exists.
    pub fn default_location() -> Option<Self> {
        config_dir().map(|d| Self::new(d.join("settings")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sidecar path for a source file.
    pub fn path_for(&self, source: &Path) -> PathBuf {
        self.dir.join(format!("{}.json", hash_source_path(source)))
    }

    /// Saved settings for `source`, or `None` when there are none usable.
    pub fn load(&self, source: &Path) -> Option<SidecarRecord> {
        let path = self.path_for(source);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("cannot read settings {}: {e}", path.display());
                return None;
            }
        };
        let record: SidecarRecord = match serde_json::from_str(&content) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("ignoring corrupt settings {}: {e}", path.display());
                return None;
            }
        };
        if record.version != SIDECAR_VERSION {
            log::warn!(
                "ignoring settings {} with version {}",
                path.display(),
                record.version
            );
            return None;
        }
        Some(record)
    }

    pub fn save(&self, source: &Path, record: &SidecarRecord) -> Result<PathBuf, SidecarError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(source);
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn remove(&self, source: &Path) -> Result<(), SidecarError> {
        match std::fs::remove_file(self.path_for(source)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// SHA-256 of the absolute source path, as hex.
///
/// Relative paths are made absolute first so the same scan opened from
/// different working directories maps to one sidecar.
pub fn hash_source_path(source: &Path) -> String {
    let absolute = std::fs::canonicalize(source)
        .or_else(|_| std::path::absolute(source))
        .unwrap_or_else(|_| source.to_path_buf());
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    format!("{:x}", digest)
}
