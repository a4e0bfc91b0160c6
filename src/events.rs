//! Signals for the presentation layer.
//!
//! Long-running operations (import, export) and settings mutations report
//! through an optional `mpsc::Sender<Event>`. The core never assumes anyone is
//! listening: a missing sender or a dropped receiver is fine.

use crate::settings::SettingKey;
use std::path::PathBuf;
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Percentage (0-100) of the current operation, with a short message.
    Progress { percent: u8, message: String },
    /// A setting changed. `global` is true when the shared profile changed;
    /// `index` names the photo for per-photo changes.
    SettingsChanged {
        key: Option<SettingKey>,
        global: bool,
        index: Option<usize>,
    },
    PhotoExported { source: PathBuf, destination: PathBuf },
    PhotoFailed { source: PathBuf, message: String },
}

impl Event {
    /// Progress event for `done` of `total` steps.
    pub fn progress(done: usize, total: usize, message: impl Into<String>) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (done.min(total) * 100 / total) as u8
        };
        Event::Progress {
            percent,
            message: message.into(),
        }
    }
}

/// Send `event` if anyone is listening.
pub fn emit(events: Option<&Sender<Event>>, event: Event) {
    if let Some(tx) = events {
        // A closed channel only means the front end stopped listening.
        let _ = tx.send(event);
    }
}
