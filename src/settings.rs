//! Settings profiles: the named processing parameters of a photo.
//!
//! A [`SettingsProfile`] is the unit that is either *global* (shared by every
//! photo that syncs with it) or *instance* (one photo's private copy). The
//! profile is a plain value type: copying it yields an independent profile,
//! and nothing is validated beyond type. Range clamping belongs to whoever
//! produces the value (a slider, a picker, a config file).
//!
//! ## Keys
//!
//! | Key | Type | Default | Scale |
//! |---|---|---|---|
//! | `film_type` | [`FilmType`] | B&W negative | |
//! | `dark_threshold` | int | 25 | 0..100 |
//! | `light_threshold` | int | 100 | 0..100 |
//! | `border_crop` | int | 1 | % |
//! | `flip` | bool | false | |
//! | `white_point`, `black_point` | int | 0 | -100..100 |
//! | `gamma`, `shadows`, `highlights` | int | 0 | -100..100 |
//! | `temp`, `tint` | int | 0 | -100..100 |
//! | `sat` | int | 100 | 0..200 % |
//! | `base_detect` | [`BaseDetect`] | auto | |
//! | `base_rgb` | rgb | (255, 255, 255) | 0..255 |
//! | `remove_dust` | bool | false | |
//! | `reject` | bool | false | |
//! | `rotation` | int | 0 | quarter turns |
//!
//! ## Global profile
//!
//! [`GlobalProfile`] wraps one profile in shared ownership. Every write bumps a
//! revision counter; photos remember the revision their outputs were rendered
//! from, so a global write invalidates all linked photos at once without the
//! profile having to know who holds it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown setting: {0}")]
    UnknownKey(String),
    #[error("setting {key} expects {expected}, got {got}")]
    TypeMismatch {
        key: SettingKey,
        expected: &'static str,
        got: &'static str,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: SettingKey, value: String },
    #[error("{0} is a per-photo setting and cannot be set globally")]
    NotSyncEligible(SettingKey),
    #[error("unreadable photos stay rejected")]
    Unreadable,
}

/// Kind of film the scan was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilmType {
    #[default]
    BwNegative,
    ColourNegative,
    Slide,
    /// Geometry only: no inversion, colour or tone work.
    CropOnly,
}

impl FilmType {
    pub fn index(self) -> i32 {
        match self {
            FilmType::BwNegative => 0,
            FilmType::ColourNegative => 1,
            FilmType::Slide => 2,
            FilmType::CropOnly => 3,
        }
    }

    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(FilmType::BwNegative),
            1 => Some(FilmType::ColourNegative),
            2 => Some(FilmType::Slide),
            3 => Some(FilmType::CropOnly),
            _ => None,
        }
    }

    pub fn is_negative(self) -> bool {
        matches!(self, FilmType::BwNegative | FilmType::ColourNegative)
    }
}

/// How the film base colour is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseDetect {
    #[default]
    Auto,
    Manual,
}

/// Every key a profile holds. Unknown names never parse into a key, so they
/// can never be written into a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    FilmType,
    DarkThreshold,
    LightThreshold,
    BorderCrop,
    Flip,
    WhitePoint,
    BlackPoint,
    Gamma,
    Shadows,
    Highlights,
    Temp,
    Tint,
    Sat,
    BaseDetect,
    BaseRgb,
    RemoveDust,
    Reject,
    Rotation,
}

/// What a change to a key requires before outputs are current again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// No pixel changes at all.
    Cheap,
    /// Colour/tone only; crop geometry can be reused.
    SkipCrop,
    /// Geometry may change; the whole pipeline reruns.
    Full,
}

impl SettingKey {
    pub const ALL: [SettingKey; 18] = [
        SettingKey::FilmType,
        SettingKey::DarkThreshold,
        SettingKey::LightThreshold,
        SettingKey::BorderCrop,
        SettingKey::Flip,
        SettingKey::WhitePoint,
        SettingKey::BlackPoint,
        SettingKey::Gamma,
        SettingKey::Shadows,
        SettingKey::Highlights,
        SettingKey::Temp,
        SettingKey::Tint,
        SettingKey::Sat,
        SettingKey::BaseDetect,
        SettingKey::BaseRgb,
        SettingKey::RemoveDust,
        SettingKey::Reject,
        SettingKey::Rotation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SettingKey::FilmType => "film_type",
            SettingKey::DarkThreshold => "dark_threshold",
            SettingKey::LightThreshold => "light_threshold",
            SettingKey::BorderCrop => "border_crop",
            SettingKey::Flip => "flip",
            SettingKey::WhitePoint => "white_point",
            SettingKey::BlackPoint => "black_point",
            SettingKey::Gamma => "gamma",
            SettingKey::Shadows => "shadows",
            SettingKey::Highlights => "highlights",
            SettingKey::Temp => "temp",
            SettingKey::Tint => "tint",
            SettingKey::Sat => "sat",
            SettingKey::BaseDetect => "base_detect",
            SettingKey::BaseRgb => "base_rgb",
            SettingKey::RemoveDust => "remove_dust",
            SettingKey::Reject => "reject",
            SettingKey::Rotation => "rotation",
        }
    }

    /// Keys that follow the global profile when a photo is linked to it.
    /// `reject` and `rotation` always stay with the photo.
    pub fn is_sync_eligible(self) -> bool {
        !matches!(self, SettingKey::Reject | SettingKey::Rotation)
    }

    pub fn mutation(self) -> Mutation {
        match self {
            SettingKey::Reject => Mutation::Cheap,
            SettingKey::WhitePoint
            | SettingKey::BlackPoint
            | SettingKey::Gamma
            | SettingKey::Shadows
            | SettingKey::Highlights
            | SettingKey::Temp
            | SettingKey::Tint
            | SettingKey::Sat
            | SettingKey::BaseDetect
            | SettingKey::BaseRgb
            | SettingKey::RemoveDust => Mutation::SkipCrop,
            SettingKey::FilmType
            | SettingKey::DarkThreshold
            | SettingKey::LightThreshold
            | SettingKey::BorderCrop
            | SettingKey::Flip
            | SettingKey::Rotation => Mutation::Full,
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SettingKey {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| SettingsError::UnknownKey(s.to_string()))
    }
}

/// A dynamically-typed setting value, for front ends that drive the profile
/// by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingValue {
    Int(i32),
    Bool(bool),
    Rgb([u8; 3]),
    FilmType(FilmType),
    BaseDetect(BaseDetect),
}

impl SettingValue {
    fn type_name(&self) -> &'static str {
        match self {
            SettingValue::Int(_) => "int",
            SettingValue::Bool(_) => "bool",
            SettingValue::Rgb(_) => "rgb",
            SettingValue::FilmType(_) => "film type",
            SettingValue::BaseDetect(_) => "base detect mode",
        }
    }

    /// Parse a textual value for `key`, e.g. from the command line.
    ///
    /// Accepts `true`/`false` for flags, integers for knobs, `r,g,b` for
    /// `base_rgb`, and either the snake_case name or the index for enums.
    pub fn parse(key: SettingKey, text: &str) -> Result<Self, SettingsError> {
        let invalid = || SettingsError::InvalidValue {
            key,
            value: text.to_string(),
        };
        let text = text.trim();
        match SettingsProfile::default().get(key) {
            SettingValue::Int(_) => text.parse().map(SettingValue::Int).map_err(|_| invalid()),
            SettingValue::Bool(_) => text.parse().map(SettingValue::Bool).map_err(|_| invalid()),
            SettingValue::Rgb(_) => {
                let parts: Vec<u8> = text
                    .trim_matches(|c| c == '(' || c == ')')
                    .split(',')
                    .map(|p| p.trim().parse::<u8>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| invalid())?;
                match parts.as_slice() {
                    [r, g, b] => Ok(SettingValue::Rgb([*r, *g, *b])),
                    _ => Err(invalid()),
                }
            }
            SettingValue::FilmType(_) => text
                .parse::<i32>()
                .ok()
                .and_then(FilmType::from_index)
                .or_else(|| serde_json::from_value(serde_json::Value::from(text)).ok())
                .map(SettingValue::FilmType)
                .ok_or_else(invalid),
            SettingValue::BaseDetect(_) => match text {
                "0" | "auto" => Ok(SettingValue::BaseDetect(BaseDetect::Auto)),
                "1" | "manual" => Ok(SettingValue::BaseDetect(BaseDetect::Manual)),
                _ => Err(invalid()),
            },
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Int(v) => write!(f, "{v}"),
            SettingValue::Bool(v) => write!(f, "{v}"),
            SettingValue::Rgb([r, g, b]) => write!(f, "({r}, {g}, {b})"),
            SettingValue::FilmType(t) => write!(f, "{t:?}"),
            SettingValue::BaseDetect(b) => write!(f, "{b:?}"),
        }
    }
}

/// The full set of per-photo processing parameters.
///
/// Serialized as a flat key/value map; missing keys take their defaults so
/// old sidecars and partial config sections still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsProfile {
    pub film_type: FilmType,
    pub dark_threshold: i32,
    pub light_threshold: i32,
    pub border_crop: i32,
    pub flip: bool,
    pub white_point: i32,
    pub black_point: i32,
    pub gamma: i32,
    pub shadows: i32,
    pub highlights: i32,
    pub temp: i32,
    pub tint: i32,
    pub sat: i32,
    pub base_detect: BaseDetect,
    pub base_rgb: [u8; 3],
    pub remove_dust: bool,
    pub reject: bool,
    pub rotation: i32,
}

impl Default for SettingsProfile {
    fn default() -> Self {
        Self {
            film_type: FilmType::BwNegative,
            dark_threshold: 25,
            light_threshold: 100,
            border_crop: 1,
            flip: false,
            white_point: 0,
            black_point: 0,
            gamma: 0,
            shadows: 0,
            highlights: 0,
            temp: 0,
            tint: 0,
            sat: 100,
            base_detect: BaseDetect::Auto,
            base_rgb: [255, 255, 255],
            remove_dust: false,
            reject: false,
            rotation: 0,
        }
    }
}

impl SettingsProfile {
    pub fn get(&self, key: SettingKey) -> SettingValue {
        match key {
            SettingKey::FilmType => SettingValue::FilmType(self.film_type),
            SettingKey::DarkThreshold => SettingValue::Int(self.dark_threshold),
            SettingKey::LightThreshold => SettingValue::Int(self.light_threshold),
            SettingKey::BorderCrop => SettingValue::Int(self.border_crop),
            SettingKey::Flip => SettingValue::Bool(self.flip),
            SettingKey::WhitePoint => SettingValue::Int(self.white_point),
            SettingKey::BlackPoint => SettingValue::Int(self.black_point),
            SettingKey::Gamma => SettingValue::Int(self.gamma),
            SettingKey::Shadows => SettingValue::Int(self.shadows),
            SettingKey::Highlights => SettingValue::Int(self.highlights),
            SettingKey::Temp => SettingValue::Int(self.temp),
            SettingKey::Tint => SettingValue::Int(self.tint),
            SettingKey::Sat => SettingValue::Int(self.sat),
            SettingKey::BaseDetect => SettingValue::BaseDetect(self.base_detect),
            SettingKey::BaseRgb => SettingValue::Rgb(self.base_rgb),
            SettingKey::RemoveDust => SettingValue::Bool(self.remove_dust),
            SettingKey::Reject => SettingValue::Bool(self.reject),
            SettingKey::Rotation => SettingValue::Int(self.rotation),
        }
    }

    /// Write one key. Returns whether the stored value actually changed.
    pub fn set(&mut self, key: SettingKey, value: SettingValue) -> Result<bool, SettingsError> {
        let before = self.get(key);
        if std::mem::discriminant(&before) != std::mem::discriminant(&value) {
            return Err(SettingsError::TypeMismatch {
                key,
                expected: before.type_name(),
                got: value.type_name(),
            });
        }
        if before == value {
            return Ok(false);
        }
        match (key, value) {
            (SettingKey::FilmType, SettingValue::FilmType(v)) => self.film_type = v,
            (SettingKey::DarkThreshold, SettingValue::Int(v)) => self.dark_threshold = v,
            (SettingKey::LightThreshold, SettingValue::Int(v)) => self.light_threshold = v,
            (SettingKey::BorderCrop, SettingValue::Int(v)) => self.border_crop = v,
            (SettingKey::Flip, SettingValue::Bool(v)) => self.flip = v,
            (SettingKey::WhitePoint, SettingValue::Int(v)) => self.white_point = v,
            (SettingKey::BlackPoint, SettingValue::Int(v)) => self.black_point = v,
            (SettingKey::Gamma, SettingValue::Int(v)) => self.gamma = v,
            (SettingKey::Shadows, SettingValue::Int(v)) => self.shadows = v,
            (SettingKey::Highlights, SettingValue::Int(v)) => self.highlights = v,
            (SettingKey::Temp, SettingValue::Int(v)) => self.temp = v,
            (SettingKey::Tint, SettingValue::Int(v)) => self.tint = v,
            (SettingKey::Sat, SettingValue::Int(v)) => self.sat = v,
            (SettingKey::BaseDetect, SettingValue::BaseDetect(v)) => self.base_detect = v,
            (SettingKey::BaseRgb, SettingValue::Rgb(v)) => self.base_rgb = v,
            (SettingKey::RemoveDust, SettingValue::Bool(v)) => self.remove_dust = v,
            (SettingKey::Reject, SettingValue::Bool(v)) => self.reject = v,
            (SettingKey::Rotation, SettingValue::Int(v)) => self.rotation = v,
            _ => unreachable!("value type checked above"),
        }
        Ok(true)
    }

    /// Deep, independent copy.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn reset_to_default(&mut self) {
        *self = Self::default();
    }

    /// Overwrite every sync-eligible key with the values from `source`,
    /// keeping this profile's per-photo keys.
    pub fn apply_synced_from(&mut self, source: &SettingsProfile) {
        let reject = self.reject;
        let rotation = self.rotation;
        *self = source.clone();
        self.reject = reject;
        self.rotation = rotation;
    }

    /// Keys whose values differ between the two profiles.
    pub fn diff(&self, other: &SettingsProfile) -> Vec<SettingKey> {
        SettingKey::ALL
            .iter()
            .copied()
            .filter(|&k| self.get(k) != other.get(k))
            .collect()
    }

    /// True when a change from `self` to `other` leaves crop geometry valid.
    pub fn geometry_matches(&self, other: &SettingsProfile) -> bool {
        self.diff(other)
            .iter()
            .all(|k| k.mutation() != Mutation::Full)
    }
}

struct GlobalInner {
    profile: RwLock<SettingsProfile>,
    revision: AtomicU64,
}

/// The shared global profile.
///
/// Cloning the handle shares the same profile. The owning collection is the
/// only writer; photos read snapshots.
#[derive(Clone)]
pub struct GlobalProfile {
    inner: Arc<GlobalInner>,
}

impl GlobalProfile {
    pub fn new(profile: SettingsProfile) -> Self {
        Self {
            inner: Arc::new(GlobalInner {
                profile: RwLock::new(profile),
                revision: AtomicU64::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> SettingsProfile {
        self.inner
            .profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, key: SettingKey) -> SettingValue {
        self.inner
            .profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
    }

    /// Write one key; bumps the revision when the value changed.
    pub fn set(&self, key: SettingKey, value: SettingValue) -> Result<bool, SettingsError> {
        let changed = self
            .inner
            .profile
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(key, value)?;
        if changed {
            self.inner.revision.fetch_add(1, Ordering::SeqCst);
        }
        Ok(changed)
    }

    /// Replace the whole profile (paste, reset). Always bumps the revision.
    pub fn replace(&self, profile: SettingsProfile) {
        *self
            .inner
            .profile
            .write()
            .unwrap_or_else(PoisonError::into_inner) = profile;
        self.inner.revision.fetch_add(1, Ordering::SeqCst);
    }

    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    pub fn ptr_eq(&self, other: &GlobalProfile) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for GlobalProfile {
    fn default() -> Self {
        Self::new(SettingsProfile::default())
    }
}

impl fmt::Debug for GlobalProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalProfile")
            .field("revision", &self.revision())
            .field("profile", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let p = SettingsProfile::default();
        assert_eq!(p.film_type, FilmType::BwNegative);
        assert_eq!(p.dark_threshold, 25);
        assert_eq!(p.light_threshold, 100);
        assert_eq!(p.border_crop, 1);
        assert_eq!(p.sat, 100);
        assert_eq!(p.base_rgb, [255, 255, 255]);
        assert!(!p.remove_dust);
        assert!(!p.reject);
        assert_eq!(p.rotation, 0);
    }

    #[test]
    fn every_key_round_trips_through_its_name() {
        for key in SettingKey::ALL {
            assert_eq!(key.name().parse::<SettingKey>().unwrap(), key);
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert_eq!(
            "exposure".parse::<SettingKey>(),
            Err(SettingsError::UnknownKey("exposure".into()))
        );
    }

    #[test]
    fn set_and_get() {
        let mut p = SettingsProfile::default();
        assert!(p.set(SettingKey::Temp, SettingValue::Int(40)).unwrap());
        assert_eq!(p.get(SettingKey::Temp), SettingValue::Int(40));
        assert!(!p.set(SettingKey::Temp, SettingValue::Int(40)).unwrap());
    }

    #[test]
    fn set_rejects_wrong_type() {
        let mut p = SettingsProfile::default();
        let err = p.set(SettingKey::Flip, SettingValue::Int(1)).unwrap_err();
        assert!(matches!(err, SettingsError::TypeMismatch { key: SettingKey::Flip, .. }));
        assert!(!p.flip);
    }

    #[test]
    fn set_does_not_clamp() {
        let mut p = SettingsProfile::default();
        p.set(SettingKey::Sat, SettingValue::Int(900)).unwrap();
        assert_eq!(p.sat, 900);
    }

    #[test]
    fn copy_is_independent() {
        let mut a = SettingsProfile::default();
        let b = a.copy();
        a.gamma = 30;
        assert_eq!(b.gamma, 0);
    }

    #[test]
    fn reset_restores_defaults() {
        let mut p = SettingsProfile::default();
        p.shadows = -20;
        p.film_type = FilmType::Slide;
        p.reset_to_default();
        assert_eq!(p, SettingsProfile::default());
    }

    #[test]
    fn apply_synced_keeps_per_photo_keys() {
        let mut photo = SettingsProfile {
            reject: true,
            rotation: 3,
            ..Default::default()
        };
        let global = SettingsProfile {
            temp: 10,
            rotation: 1,
            ..Default::default()
        };
        photo.apply_synced_from(&global);
        assert_eq!(photo.temp, 10);
        assert!(photo.reject);
        assert_eq!(photo.rotation, 3);
    }

    #[test]
    fn geometry_matches_only_for_tone_changes() {
        let base = SettingsProfile::default();
        let tone = SettingsProfile {
            gamma: 20,
            temp: -5,
            remove_dust: true,
            ..Default::default()
        };
        let crop = SettingsProfile {
            border_crop: 4,
            ..Default::default()
        };
        assert!(base.geometry_matches(&tone));
        assert!(!base.geometry_matches(&crop));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let p: SettingsProfile = serde_json::from_str(r#"{"temp": 12, "film_type": "slide"}"#).unwrap();
        assert_eq!(p.temp, 12);
        assert_eq!(p.film_type, FilmType::Slide);
        assert_eq!(p.dark_threshold, 25);
    }

    #[test]
    fn parse_values_from_text() {
        assert_eq!(
            SettingValue::parse(SettingKey::BaseRgb, "(200, 120, 80)").unwrap(),
            SettingValue::Rgb([200, 120, 80])
        );
        assert_eq!(
            SettingValue::parse(SettingKey::FilmType, "1").unwrap(),
            SettingValue::FilmType(FilmType::ColourNegative)
        );
        assert_eq!(
            SettingValue::parse(SettingKey::FilmType, "crop_only").unwrap(),
            SettingValue::FilmType(FilmType::CropOnly)
        );
        assert_eq!(
            SettingValue::parse(SettingKey::Flip, "true").unwrap(),
            SettingValue::Bool(true)
        );
        assert!(SettingValue::parse(SettingKey::Gamma, "lots").is_err());
    }

    #[test]
    fn global_revision_bumps_only_on_change() {
        let global = GlobalProfile::default();
        assert_eq!(global.revision(), 0);
        global.set(SettingKey::Tint, SettingValue::Int(5)).unwrap();
        assert_eq!(global.revision(), 1);
        global.set(SettingKey::Tint, SettingValue::Int(5)).unwrap();
        assert_eq!(global.revision(), 1);
        global.replace(SettingsProfile::default());
        assert_eq!(global.revision(), 2);
    }

    #[test]
    fn global_clones_share_state() {
        let a = GlobalProfile::default();
        let b = a.clone();
        a.set(SettingKey::Sat, SettingValue::Int(150)).unwrap();
        assert_eq!(b.get(SettingKey::Sat), SettingValue::Int(150));
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn sync_eligibility() {
        assert!(SettingKey::Flip.is_sync_eligible());
        assert!(SettingKey::BaseRgb.is_sync_eligible());
        assert!(!SettingKey::Reject.is_sync_eligible());
        assert!(!SettingKey::Rotation.is_sync_eligible());
    }
}
