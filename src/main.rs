use clap::{Parser, Subcommand};
use film_scan::collection::Collection;
use film_scan::config::{self, AppConfig};
use film_scan::export::ExportEngine;
use film_scan::imaging::{ExportFormat, RustDecoder};
use film_scan::photo::{Photo, PhotoContext};
use film_scan::pipeline::Stage;
use film_scan::events::Event;
use film_scan::settings::{BaseDetect, SettingKey, SettingValue, SettingsProfile};
use film_scan::sidecar::SidecarStore;
use film_scan::{output, scan};
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Sender;

#[derive(Parser)]
#[command(name = "film-scan")]
#[command(about = "Convert RAW scans of film negatives and slides into positives")]
#[command(long_about = "\
Convert RAW scans of film negatives and slides into positives

Each scan is cropped to the film frame, inverted against the film base,
white balanced, tone mapped and optionally cleaned of dust.

Settings:
  Photos share one global settings profile unless they are given their own.
  Per-photo settings live in sidecar files under ~/.film_scan_converter/settings,
  keyed by the source path; advanced options live in
  ~/.film_scan_converter/config.toml.

  Settings are passed as key=value, for example:
    --set film_type=colour_negative --set temp=-10 --set base_rgb=230,160,110

Run 'film-scan gen-config' to print a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.film_scan_converter/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Ignore per-photo sidecar files
    #[arg(long, global = true)]
    no_sidecars: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone)]
struct SettingsArgs {
    /// Setting to apply, as key=value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_setting)]
    settings: Vec<(SettingKey, SettingValue)>,

    /// Take the film base colour from this blank scan
    #[arg(long, value_name = "FILE")]
    blank_scan: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Import scans and report which can be read
    Check {
        /// Files or directories
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Render one scan at preview size and save a pipeline stage
    Preview {
        input: PathBuf,
        /// Image file to write (format from the extension)
        #[arg(short, long)]
        output: PathBuf,
        /// Stage to save: raw, threshold, contours, histogram, final
        #[arg(long, default_value = "final")]
        stage: Stage,
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Export every non-rejected scan at full resolution
    Export {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Output directory
        #[arg(short, long, default_value = "exported")]
        output: PathBuf,
        /// File type: jpg, png or tiff
        #[arg(long, value_parser = parse_format)]
        format: Option<ExportFormat>,
        /// JPEG quality (0-100)
        #[arg(long)]
        quality: Option<u32>,
        /// Export workers (0 sizes the pool from memory and cores)
        #[arg(long)]
        workers: Option<usize>,
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Store settings for scans in their sidecar files
    SaveSettings {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Give each scan its own settings instead of the global profile
        #[arg(long)]
        own: bool,
        /// Reset to the configured defaults before applying --set
        #[arg(long)]
        reset: bool,
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Print a stock config.toml with all options documented
    GenConfig {
        /// Write it to the configuration path instead of stdout
        #[arg(long)]
        write: bool,
    },
}

fn parse_setting(text: &str) -> Result<(SettingKey, SettingValue), String> {
    let (key, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{text}'"))?;
    let key: SettingKey = key.trim().parse().map_err(|e| format!("{e}"))?;
    let value = SettingValue::parse(key, value).map_err(|e| format!("{e}"))?;
    Ok((key, value))
}

fn parse_format(text: &str) -> Result<ExportFormat, String> {
    ExportFormat::from_extension(text).ok_or_else(|| format!("unknown file type: {text}"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().or_else(config::default_config_path);

    match cli.command {
        Command::Check { ref inputs } => {
            let mut collection = open_collection(&cli, load_config(&cli), None)?;
            let report = collection.import(&scan::collect_sources(inputs)?);
            output::print_import_report(&report);
            let photos: Vec<&Photo> = collection.photos().iter().map(|p| p.as_ref()).collect();
            output::print_check(&photos);
        }
        Command::Preview {
            ref input,
            output: ref out_file,
            stage,
            ref settings,
        } => {
            let ctx = photo_context(&cli, load_config(&cli));
            let photo = Photo::new(input, ctx.clone());
            apply_to_photo(&photo, &ctx, settings)?;
            if !photo.process(false, false, false) {
                return Err(format!("cannot read {}", input.display()).into());
            }
            let image = photo
                .get_img(Some(stage))
                .ok_or_else(|| format!("stage {stage} is not available"))?;
            DynamicImage::ImageRgb8(image.to_dynamic().to_rgb8()).save(out_file)?;
            println!("{} -> {} ({stage})", input.display(), out_file.display());
        }
        Command::Export {
            ref inputs,
            output: ref out_dir,
            format,
            quality,
            workers,
            ref settings,
        } => {
            let mut config = load_config(&cli);
            if let Some(format) = format {
                config.export.file_type = format;
            }
            if let Some(quality) = quality {
                config.export.jpg_quality = quality;
            }
            if let Some(workers) = workers {
                config.export.max_processors_override = workers;
            }

            let (tx, rx) = std::sync::mpsc::channel::<Event>();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    output::print_event(&event);
                }
            });

            let mut collection = open_collection(&cli, config, Some(tx.clone()))?;
            let report = collection.import(&scan::collect_sources(inputs)?);
            if !report.unreadable.is_empty() {
                output::print_import_report(&report);
            }
            apply_to_global(&mut collection, settings)?;

            let ctx = collection.context();
            let engine = ExportEngine::new(Arc::clone(&ctx.decoder), Arc::clone(&ctx.config))
                .with_events(tx);
            let result = engine.export_batch(collection.photos(), out_dir);
            drop(engine);
            drop(collection);
            printer.join().map_err(|_| "output thread panicked")?;
            output::print_export_report(&result?);
        }
        Command::SaveSettings {
            ref inputs,
            own,
            reset,
            ref settings,
        } => {
            let mut collection = open_collection(&cli, load_config(&cli), None)?;
            collection.import(&scan::collect_sources(inputs)?);
            for index in 0..collection.len() {
                if reset {
                    collection.reset_settings(Some(index))?;
                }
                collection.set_use_global(index, !own)?;
            }
            if own {
                for index in 0..collection.len() {
                    apply_to_photo_at(&mut collection, index, settings)?;
                }
            } else {
                apply_to_global(&mut collection, settings)?;
                // A linked photo reopens under the global profile, which
                // starts from the configured defaults.
                let mut updated = (*collection.context().config).clone();
                updated.defaults = collection.global().snapshot();
                if let Some(path) = &config_path {
                    config::save_config(&updated, path)?;
                    println!("Global settings -> {}", path.display());
                }
            }
            let written = collection.save_settings()?;
            println!("Saved settings for {written} photos");
            let defaults = &collection.context().config.defaults;
            for (i, photo) in collection.photos().iter().enumerate() {
                let diff = output::format_settings_diff(&photo.settings(), defaults);
                if !diff.is_empty() {
                    println!("{:0>3} {}", i + 1, photo.file_name());
                    diff.iter().for_each(|line| println!("{line}"));
                }
            }
        }
        Command::GenConfig { write } => {
            if write {
                let path = config_path.ok_or("no home directory for the configuration")?;
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(&path, config::stock_config_toml())?;
                println!("Wrote {}", path.display());
            } else {
                print!("{}", config::stock_config_toml());
            }
        }
    }

    Ok(())
}

/// `info` by default, `debug` with `--verbose`; `RUST_LOG` wins over both.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn load_config(cli: &Cli) -> AppConfig {
    let path = cli.config.clone().or_else(config::default_config_path);
    config::load_config_or_default(path.as_deref())
}

fn photo_context(cli: &Cli, config: AppConfig) -> PhotoContext {
    let ctx = PhotoContext::new(Arc::new(RustDecoder::new()), Arc::new(config));
    match SidecarStore::default_location() {
        Some(store) if !cli.no_sidecars => ctx.with_sidecars(store),
        _ => ctx,
    }
}

fn open_collection(
    cli: &Cli,
    config: AppConfig,
    events: Option<Sender<Event>>,
) -> Result<Collection, Box<dyn std::error::Error>> {
    Ok(Collection::new(photo_context(cli, config), events)?)
}

fn apply_to_global(collection: &mut Collection, args: &SettingsArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(blank) = &args.blank_scan {
        let base = collection.apply_blank_scan(blank, None)?;
        println!("Film base from {}: {:?}", blank.display(), base);
    }
    for &(key, value) in &args.settings {
        if key.is_sync_eligible() {
            collection.set_global(key, value)?;
        } else {
            for index in 0..collection.len() {
                collection.set_setting(index, key, value)?;
            }
        }
    }
    Ok(())
}

fn apply_to_photo_at(
    collection: &mut Collection,
    index: usize,
    args: &SettingsArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(blank) = &args.blank_scan {
        collection.apply_blank_scan(blank, Some(index))?;
    }
    for &(key, value) in &args.settings {
        collection.set_setting(index, key, value)?;
    }
    Ok(())
}

fn apply_to_photo(
    photo: &Photo,
    ctx: &PhotoContext,
    args: &SettingsArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(blank) = &args.blank_scan {
        let base = Photo::with_settings(blank, ctx.clone(), SettingsProfile::default())
            .blank_scan_base()
            .ok_or_else(|| format!("cannot read blank scan {}", blank.display()))?;
        photo.set_setting(SettingKey::BaseRgb, SettingValue::Rgb(base))?;
        photo.set_setting(
            SettingKey::BaseDetect,
            SettingValue::BaseDetect(BaseDetect::Manual),
        )?;
    }
    for &(key, value) in &args.settings {
        photo.set_setting(key, value)?;
    }
    Ok(())
}
