//! dltidy - keep a downloads folder organized
//!
//! This library classifies files by extension and filename keywords, moves
//! them into a category tree without ever overwriting, journals every move in
//! batches that can be undone, and watches a folder so new downloads are
//! organized once they finish writing.

pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod mover;
pub mod organizer;
pub mod output;
pub mod rules;
pub mod watch;

pub use classifier::{Candidate, Classification, ClassifyOptions, classify};
pub use config::{CompiledFilters, Config, ConfigError, Settings};
pub use error::{Error, Result};
pub use history::{BatchId, BatchSummary, HistoryError, HistoryStore, UndoResult};
pub use mover::{MoveError, MovePlan, TransactionalMover};
pub use organizer::{Organizer, RunSummary, ScanReport};
pub use rules::{RuleError, RuleSet};
pub use watch::{DebounceConfig, WatchEvent, WatchHandle, WatchOutcome};

pub use cli::{Command, run_cli};
