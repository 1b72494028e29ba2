//! Crate-level error type.
//!
//! Only store-level and configuration failures end up here. Per-file problems
//! are reported inside [`RunSummary`](crate::organizer::RunSummary) and
//! [`UndoResult`](crate::history::UndoResult) instead.

use crate::config::ConfigError;
use crate::history::HistoryError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("cannot scan {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A file was moved but the move could not be journaled.
    #[error(
        "moved {} but could not record it ({}); run aborted",
        .path.display(),
        rollback_note(.rolled_back)
    )]
    NotRecorded {
        path: PathBuf,
        rolled_back: bool,
        #[source]
        source: HistoryError,
    },

    #[error("filesystem watch failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("failed to start watch thread: {0}")]
    Thread(#[source] io::Error),
}

fn rollback_note(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        "move rolled back"
    } else {
        "rollback failed, the file stays at its new location"
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
