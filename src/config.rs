//! Application configuration.
//!
//! One process-wide `config.toml` holds the advanced pipeline parameters and
//! the default settings profile new photos start from. Stock defaults are
//! overridden key by key by the user's file, so a config only needs the
//! values it changes.
//!
//! ## Config File Location
//!
//! ```text
//! ~/.film_scan_converter/
//! ├── config.toml        # this file
//! └── settings/          # per-photo sidecars (see `sidecar`)
//! ```
//!
//! `film-scan --config <path>` reads a different file.
//!
//! ## Configuration Options
//!
//! ```toml
//! [import]
//! demosaic = "bilinear"          # or "superpixel"
//! colour_space = "srgb"          # or "raw"
//! raw_gamma = [2.222, 4.5]       # power, toe slope
//! exp_shift = 0.0                # stops
//! noise_reduction = "off"        # "off", "light", "full"
//! noise_threshold = 100
//! median_filter_passes = 1
//! use_camera_wb = true
//! wb_mult = [1.0, 1.0, 1.0, 1.0]
//!
//! [processing]
//! max_proxy_size = 3000          # width + height of preview buffers
//! preload = 4                    # photos kept decoded either side of the current one
//! ignore_border = [5, 5]         # % of width, height skipped by equalization
//! white_point_percentile = 99.0
//! black_point_percentile = 1.0
//! picker_radius = 2.0            # % of the shorter edge
//!
//! [dust]
//! dust_threshold = 10
//! dust_iter = 5
//! max_dust_area = 20
//!
//! [export]
//! file_type = "jpg"              # "jpg", "png", "tiff"
//! jpg_quality = 90
//! tiff_compression = "lzw"       # "none", "lzw", "deflate", "packbits"
//! frame = 0                      # white frame, % of the longer edge
//! max_processors_override = 0    # 0 = size the pool automatically
//!
//! [defaults]
//! film_type = "bw_negative"
//! dark_threshold = 25
//! # ... every settings key, see `settings`
//! ```
//!
//! Unknown keys are rejected, except inside `[defaults]` where they are
//! ignored. A file that does not parse or validate is reported and replaced by
//! the stock defaults; startup never fails on configuration.

use crate::imaging::{DecodeParams, ExportFormat, ExportParams, Quality, TiffCompression};
use crate::settings::SettingsProfile;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Name of the per-user configuration folder inside the home directory.
pub const CONFIG_DIR_NAME: &str = ".film_scan_converter";

/// The process-wide configuration record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Parameters passed to the RAW decoder.
    pub import: DecodeParams,
    pub processing: ProcessingConfig,
    pub dust: DustConfig,
    pub export: ExportConfig,
    /// Settings profile new photos (and the global profile) start from.
    pub defaults: SettingsProfile,
}

impl AppConfig {
    /// Reject values no pipeline stage can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.processing;
        if p.max_proxy_size < 2 {
            return Err(ConfigError::Validation(
                "processing.max_proxy_size must be at least 2".into(),
            ));
        }
        if !(0.0..=100.0).contains(&p.black_point_percentile)
            || !(0.0..=100.0).contains(&p.white_point_percentile)
            || p.black_point_percentile >= p.white_point_percentile
        {
            return Err(ConfigError::Validation(
                "processing percentiles must satisfy 0 <= black < white <= 100".into(),
            ));
        }
        if p.ignore_border.iter().any(|&b| b >= 50) {
            return Err(ConfigError::Validation(
                "processing.ignore_border values must be below 50".into(),
            ));
        }
        if self.export.jpg_quality > 100 {
            return Err(ConfigError::Validation(
                "export.jpg_quality must be 0-100".into(),
            ));
        }
        if self.dust.dust_iter == 0 {
            return Err(ConfigError::Validation(
                "dust.dust_iter must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Encoding request for the configured export format.
    pub fn export_params(&self) -> ExportParams {
        ExportParams {
            format: self.export.file_type,
            quality: Quality::new(self.export.jpg_quality),
            compression: self.export.tiff_compression,
        }
    }
}

/// Preview, preload and pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Upper bound on `width + height` of proxy (preview) buffers.
    pub max_proxy_size: u32,
    /// Preload radius around the current photo.
    pub preload: usize,
    /// Border, in percent of width and height, left out of histogram equalization.
    pub ignore_border: [u32; 2],
    /// Per-channel percentile mapped to white after inversion.
    pub white_point_percentile: f32,
    /// Per-channel percentile mapped to black after inversion.
    pub black_point_percentile: f32,
    /// Half-size of the white balance / base picker window, % of the shorter edge.
    pub picker_radius: f32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_proxy_size: 3000,
            preload: 4,
            ignore_border: [5, 5],
            white_point_percentile: 99.0,
            black_point_percentile: 1.0,
            picker_radius: 2.0,
        }
    }
}

/// Dust detection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DustConfig {
    /// Minimum difference (0-255) from the local median for a dust candidate.
    pub dust_threshold: u8,
    /// Morphological closing iterations applied to the candidate mask.
    pub dust_iter: u8,
    /// Largest particle, in pixels, that is treated as dust.
    pub max_dust_area: u32,
}

impl Default for DustConfig {
    fn default() -> Self {
        Self {
            dust_threshold: 10,
            dust_iter: 5,
            max_dust_area: 20,
        }
    }
}

/// Export format and worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub file_type: ExportFormat,
    pub jpg_quality: u32,
    pub tiff_compression: TiffCompression,
    /// White frame around exported photos, % of the longer edge.
    pub frame: u32,
    /// Fixed export worker count; 0 sizes the pool from memory and cores.
    pub max_processors_override: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            file_type: ExportFormat::Jpg,
            jpg_quality: 90,
            tiff_compression: TiffCompression::Lzw,
            frame: 0,
            max_processors_override: 0,
        }
    }
}

/// Number of hardware threads, at least 1.
pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// `~/.film_scan_converter`, when a home directory is known.
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME))
}

/// Default location of `config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the base layer user overrides are merged onto.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(AppConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto the stock defaults, then deserialize and validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<AppConfig, ConfigError> {
    let base = stock_defaults_value();
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: AppConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load the config at `path`, strictly.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    resolve_config(load_raw_config(path)?)
}

/// Load the config at `path`, substituting stock defaults on any failure.
///
/// Failures are logged; this never stops startup.
pub fn load_config_or_default(path: Option<&Path>) -> AppConfig {
    let Some(path) = path else {
        log::warn!("no home directory found; using stock configuration");
        return AppConfig::default();
    };
    match load_config(path) {
        Ok(config) => {
            log::debug!("loaded configuration from {}", path.display());
            config
        }
        Err(e) => {
            log::warn!(
                "ignoring configuration {}: {e}; using stock defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}

/// Write `config` to `path`, creating parent directories.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml::to_string_pretty(config)?)?;
    Ok(())
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Film Scan Configuration
# =======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Default location: ~/.film_scan_converter/config.toml
# Unknown keys will cause the file to be ignored (with a warning).

# ---------------------------------------------------------------------------
# RAW import
# ---------------------------------------------------------------------------
[import]
# Demosaicing algorithm: "bilinear" (full resolution) or "superpixel" (half).
demosaic = "bilinear"

# Output colour space of decoded RAW files: "srgb" or "raw" (camera native).
colour_space = "srgb"

# Transfer curve as [power, toe slope]. [1.0, 1.0] keeps data linear.
raw_gamma = [2.222, 4.5]

# Exposure shift in stops applied at decode time.
exp_shift = 0.0

# Noise reduction: "off", "light" (thresholded median), "full" (median).
noise_reduction = "off"

# Light noise reduction threshold, in thousandths of full scale.
noise_threshold = 100

# Number of 3x3 median passes when noise reduction is on.
median_filter_passes = 1

# Use the camera's as-shot white balance. When false, wb_mult is used.
use_camera_wb = true

# Explicit white balance multipliers in CFA order (R, G, B, G2).
wb_mult = [1.0, 1.0, 1.0, 1.0]

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Largest width + height of preview buffers.
max_proxy_size = 3000

# Photos kept decoded on each side of the current one.
preload = 4

# Border (% of width, % of height) excluded from histogram equalization.
ignore_border = [5, 5]

# Percentiles mapped to white and black after negative inversion.
white_point_percentile = 99.0
black_point_percentile = 1.0

# Picker window half-size, % of the shorter image edge.
picker_radius = 2.0

# ---------------------------------------------------------------------------
# Dust removal
# ---------------------------------------------------------------------------
[dust]
# Minimum brightness difference (0-255) from the local median.
dust_threshold = 10

# Morphological closing iterations on the candidate mask.
dust_iter = 5

# Largest particle area, in pixels, treated as dust.
max_dust_area = 20

# ---------------------------------------------------------------------------
# Export
# ---------------------------------------------------------------------------
[export]
# Output format: "jpg", "png" (16-bit) or "tiff" (16-bit).
file_type = "jpg"

# JPEG quality (0 = worst, 100 = best).
jpg_quality = 90

# TIFF compression: "none", "lzw", "deflate" or "packbits".
tiff_compression = "lzw"

# White frame around exported photos, % of the longer edge.
frame = 0

# Fixed number of export workers. 0 sizes the pool from free memory and cores.
max_processors_override = 0

# ---------------------------------------------------------------------------
# Default photo settings
# ---------------------------------------------------------------------------
[defaults]
# "bw_negative", "colour_negative", "slide" or "crop_only".
film_type = "bw_negative"

# Crop detection luminance band (0-100) and inset (%).
dark_threshold = 25
light_threshold = 100
border_crop = 1
flip = false

# Tone knobs, -100..100.
white_point = 0
black_point = 0
gamma = 0
shadows = 0
highlights = 0

# White balance knobs, -100..100, and saturation in %.
temp = 0
tint = 0
sat = 100

# Film base: "auto" or "manual" (uses base_rgb).
base_detect = "auto"
base_rgb = [255, 255, 255]

remove_dust = false
reject = false
rotation = 0
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::Demosaic;
    use crate::settings::FilmType;
    use tempfile::TempDir;

    #[test]
    fn default_config_values() {
        let config = AppConfig::default();
        assert_eq!(config.processing.max_proxy_size, 3000);
        assert_eq!(config.processing.preload, 4);
        assert_eq!(config.export.file_type, ExportFormat::Jpg);
        assert_eq!(config.export.max_processors_override, 0);
        assert_eq!(config.defaults, SettingsProfile::default());
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[processing]
preload = 2

[defaults]
film_type = "colour_negative"
"#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.processing.preload, 2);
        assert_eq!(config.processing.max_proxy_size, 3000);
        assert_eq!(config.defaults.film_type, FilmType::ColourNegative);
        assert_eq!(config.defaults.dark_threshold, 25);
    }

    #[test]
    fn export_params_from_config() {
        let mut config = AppConfig::default();
        config.export.file_type = ExportFormat::Tiff;
        config.export.tiff_compression = TiffCompression::Deflate;
        config.export.jpg_quality = 70;
        let params = config.export_params();
        assert_eq!(params.format, ExportFormat::Tiff);
        assert_eq!(params.compression, TiffCompression::Deflate);
        assert_eq!(params.quality.value(), 70);
    }

    // =========================================================================
    // load_config tests
    // =========================================================================

    #[test]
    fn load_config_returns_default_when_no_file() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[import]
demosaic = "superpixel"

[export]
jpg_quality = 75
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.import.demosaic, Demosaic::Superpixel);
        assert_eq!(config.export.jpg_quality, 75);
        assert_eq!(config.export.tiff_compression, TiffCompression::Lzw);
    }

    #[test]
    fn load_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "this is not valid toml [[[").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn corrupt_config_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[processing]\npreload = \"lots\"\n").unwrap();
        assert_eq!(load_config_or_default(Some(&path)), AppConfig::default());
    }

    #[test]
    fn missing_home_falls_back_to_defaults() {
        assert_eq!(load_config_or_default(None), AppConfig::default());
    }

    #[test]
    fn unknown_defaults_key_is_ignored() {
        let config: AppConfig = toml::from_str("[defaults]\nexposure = 3\ntemp = 4\n").unwrap();
        assert_eq!(config.defaults.temp, 4);
    }

    #[test]
    fn unknown_section_rejected() {
        let result: Result<AppConfig, _> = toml::from_str("[exprot]\nframe = 2\n");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_key_rejected() {
        let result: Result<AppConfig, _> = toml::from_str("[export]\nqualty = 2\n");
        assert!(result.unwrap_err().to_string().contains("unknown field"));
    }

    // =========================================================================
    // save_config tests
    // =========================================================================

    #[test]
    fn save_then_load_preserves_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        let mut config = AppConfig::default();
        config.processing.preload = 7;
        config.dust.max_dust_area = 50;
        config.defaults.sat = 120;

        save_config(&config, &path).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
    }

    // =========================================================================
    // Validation tests
    // =========================================================================

    #[test]
    fn validate_default_config_passes() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_percentile_order() {
        let mut config = AppConfig::default();
        config.processing.black_point_percentile = 99.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_quality_too_high() {
        let mut config = AppConfig::default();
        config.export.jpg_quality = 101;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("jpg_quality"));
    }

    #[test]
    fn validate_proxy_size() {
        let mut config = AppConfig::default();
        config.processing.max_proxy_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_config_validates_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[export]\njpg_quality = 200\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Validation(_))));
    }

    // =========================================================================
    // merge_toml tests
    // =========================================================================

    #[test]
    fn merge_toml_table_merge() {
        let base: toml::Value = toml::from_str("[dust]\ndust_iter = 5\nmax_dust_area = 20\n").unwrap();
        let overlay: toml::Value = toml::from_str("[dust]\ndust_iter = 2\n").unwrap();
        let merged = merge_toml(base, overlay);
        let dust = merged.get("dust").unwrap();
        assert_eq!(dust.get("dust_iter").unwrap().as_integer(), Some(2));
        assert_eq!(dust.get("max_dust_area").unwrap().as_integer(), Some(20));
    }

    #[test]
    fn merge_toml_scalar_replaces_array() {
        let base: toml::Value = toml::from_str("a = [1, 2]").unwrap();
        let overlay: toml::Value = toml::from_str("a = [3]").unwrap();
        let merged = merge_toml(base, overlay);
        assert_eq!(merged.get("a").unwrap().as_array().unwrap().len(), 1);
    }

    // =========================================================================
    // stock_config_toml tests
    // =========================================================================

    #[test]
    fn stock_config_toml_roundtrips_to_defaults() {
        let config: AppConfig = toml::from_str(stock_config_toml()).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn stock_config_toml_contains_all_sections() {
        let content = stock_config_toml();
        for section in ["[import]", "[processing]", "[dust]", "[export]", "[defaults]"] {
            assert!(content.contains(section), "missing {section}");
        }
    }

    #[test]
    fn stock_defaults_value_has_all_sections() {
        let val = stock_defaults_value();
        assert!(val.is_table());
        for key in ["import", "processing", "dust", "export", "defaults"] {
            assert!(val.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn hardware_concurrency_is_positive() {
        assert!(hardware_concurrency() >= 1);
    }
}
