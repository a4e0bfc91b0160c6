//! Discovery of importable scans.
//!
//! Command-line arguments may name files or directories. Files are taken as
//! given (even with an unknown extension, so the decoder can report why it
//! fails); directories are walked recursively and contribute every file with
//! a supported RAW or raster extension. Hidden entries are skipped.
//!
//! The result is sorted and de-duplicated so a roll always imports in the
//! same order.

use crate::imaging::is_supported;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("cannot walk directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("no such file or directory: {}", .0.display())]
    Missing(PathBuf),
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Supported files below `dir`, sorted.
pub fn scan_dir(dir: &Path) -> Result<Vec<PathBuf>, ScanError> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = entry?;
        if entry.file_type().is_file() && is_supported(entry.path()) {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

/// Expand `inputs` into the list of files to import.
pub fn collect_sources(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, ScanError> {
    let mut sources = Vec::new();
    for input in inputs {
        if input.is_dir() {
            sources.extend(scan_dir(input)?);
        } else if input.is_file() {
            sources.push(input.clone());
        } else {
            return Err(ScanError::Missing(input.clone()));
        }
    }
    sources.sort();
    sources.dedup();
    log::debug!("found {} source files", sources.len());
    Ok(sources)
}
