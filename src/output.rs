//! CLI output formatting.
//!
//! # Photo Display Contract
//!
//! Every photo is shown the same way: a 3-digit positional index and the file
//! name, followed by indented context lines.
//!
//! ```text
//! 001 frame01.NEF
//!     Decoder: RGBG
//!     Settings: global
//! 002 frame02.NEF
//!     Unreadable
//! ```
//!
//! # Export
//!
//! ```text
//! Exported 8 of 10 photos (4 workers)
//!     Skipped 1 rejected
//! Failures
//!     003 frame03.NEF (5 attempts)
//!         could not read /scans/frame03.NEF
//! ```
//!
//! # Architecture
//!
//! Each display has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::collection::ImportReport;
use crate::events::Event;
use crate::export::ExportReport;
use crate::photo::Photo;
use crate::settings::SettingsProfile;
use std::path::Path;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn photo_line(index: usize, path: &Path) -> String {
    format!("{} {}", format_index(index), file_name(path))
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

// ============================================================================
// Check
// ============================================================================

/// Summarize imported photos: readability, decoder description, settings.
pub fn format_check(photos: &[&Photo]) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, photo) in photos.iter().enumerate() {
        lines.push(photo_line(i + 1, photo.path()));
        if photo.file_read_error() {
            lines.push(format!("{}Unreadable", indent(1)));
            continue;
        }
        if let Some(desc) = photo.colour_desc() {
            lines.push(format!("{}Decoder: {}", indent(1), desc));
        }
        let source = if photo.uses_global() { "global" } else { "own" };
        lines.push(format!("{}Settings: {}", indent(1), source));
        let settings = photo.settings();
        if settings.reject {
            lines.push(format!("{}Rejected", indent(1)));
        }
    }
    lines
}

pub fn print_check(photos: &[&Photo]) {
    for line in format_check(photos) {
        println!("{}", line);
    }
}

/// One line per key where `settings` differs from `defaults`.
pub fn format_settings_diff(settings: &SettingsProfile, defaults: &SettingsProfile) -> Vec<String> {
    defaults
        .diff(settings)
        .into_iter()
        .map(|key| format!("{}{} = {}", indent(1), key, settings.get(key)))
        .collect()
}

// ============================================================================
// Import
// ============================================================================

pub fn format_import_report(report: &ImportReport) -> Vec<String> {
    let mut lines = vec![format!("Imported {}", plural(report.imported, "photo"))];
    if !report.unreadable.is_empty() {
        lines.push(format!("{}{} unreadable:", indent(1), report.unreadable.len()));
        for path in &report.unreadable {
            lines.push(format!("{}{}", indent(2), path.display()));
        }
    }
    lines
}

pub fn print_import_report(report: &ImportReport) {
    for line in format_import_report(report) {
        println!("{}", line);
    }
}

// ============================================================================
// Events
// ============================================================================

/// Format one progress event. Settings events have no CLI display.
pub fn format_event(event: &Event) -> Vec<String> {
    match event {
        Event::Progress { percent, message } => vec![format!("[{percent:>3}%] {message}")],
        Event::PhotoExported {
            source,
            destination,
        } => vec![format!(
            "{}{} -> {}",
            indent(1),
            file_name(source),
            destination.display()
        )],
        Event::PhotoFailed { source, message } => {
            vec![format!("{}{} failed: {}", indent(1), file_name(source), message)]
        }
        Event::SettingsChanged { .. } => Vec::new(),
    }
}

pub fn print_event(event: &Event) {
    for line in format_event(event) {
        println!("{}", line);
    }
}

// ============================================================================
// Export
// ============================================================================

pub fn format_export_report(report: &ExportReport) -> Vec<String> {
    let attempted = report.exported.len() + report.failures.len();
    let mut lines = vec![format!(
        "Exported {} of {} ({})",
        report.exported.len(),
        plural(attempted, "photo"),
        plural(report.workers, "worker")
    )];
    if report.cancelled {
        lines.push(format!("{}Cancelled; files already written were kept", indent(1)));
    }
    if !report.skipped.is_empty() {
        lines.push(format!("{}Skipped {} rejected", indent(1), report.skipped.len()));
    }
    if !report.failures.is_empty() {
        lines.push("Failures".to_string());
        for (i, failure) in report.failures.iter().enumerate() {
            lines.push(format!(
                "{}{} ({})",
                indent(1),
                photo_line(i + 1, &failure.source),
                plural(failure.attempts as usize, "attempt")
            ));
            lines.push(format!("{}{}", indent(2), failure.message));
        }
    }
    lines
}

pub fn print_export_report(report: &ExportReport) {
    for line in format_export_report(report) {
        println!("{}", line);
    }
}
