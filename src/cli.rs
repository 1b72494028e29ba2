//! Command dispatch for the `dltidy` binary.
//!
//! Each command builds an [`Organizer`] from compiled settings, runs one
//! operation and prints its summary. Errors come back as display strings.

use crate::config::Settings;
use crate::history::BatchId;
use crate::organizer::{FileOutcome, Organizer};
use crate::output::OutputFormatter;
use std::sync::Arc;

/// A CLI command to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Show what would be moved.
    Preview,
    /// Move files and record the batch.
    Organize,
    /// Organize new files as they finish downloading.
    Watch,
    /// Revert a batch, the latest by default.
    Undo { batch: Option<BatchId> },
    /// List past batches.
    History,
}

/// Runs `command` against the configured root.
///
/// # Examples
///
/// ```no_run
/// use dltidy::cli::{run_cli, Command};
/// use dltidy::config::Settings;
///
/// let settings = Settings::for_root("/home/me/Downloads").unwrap();
/// if let Err(e) = run_cli(Command::Preview, settings) {
///     eprintln!("Error: {}", e);
/// }
/// ```
pub fn run_cli(command: Command, settings: Settings) -> Result<(), String> {
    let organizer = Arc::new(Organizer::new(settings));
    match command {
        Command::Preview => preview(&organizer),
        Command::Organize => organize(&organizer),
        Command::Watch => watch(&organizer),
        Command::Undo { batch } => undo(&organizer, batch),
        Command::History => history(&organizer),
    }
}

fn preview(organizer: &Organizer) -> Result<(), String> {
    let root = organizer.root();
    OutputFormatter::dry_run_notice(&format!("Analyzing contents of: {}", root.display()));
    let report = organizer.scan().map_err(|e| e.to_string())?;
    OutputFormatter::preview(&report, root);
    if !report.plans.is_empty() {
        OutputFormatter::plain("\nRun 'dltidy organize' to apply.");
    }
    Ok(())
}

fn organize(organizer: &Organizer) -> Result<(), String> {
    let root = organizer.root();
    OutputFormatter::info(&format!("Organizing contents of: {}", root.display()));

    let report = organizer.scan().map_err(|e| e.to_string())?;
    let pb = OutputFormatter::create_progress_bar(report.plans.len() as u64);
    let mut summary = organizer
        .execute_with_progress(&report.plans, |outcome| {
            if let FileOutcome::Moved(record) = outcome
                && let Some(name) = record.source.file_name()
            {
                pb.set_message(name.to_string_lossy().into_owned());
            }
            pb.inc(1);
        })
        .map_err(|e| e.to_string())?;
    pb.finish_and_clear();

    summary.absorb_scan(report);

    OutputFormatter::run_summary(&summary, root);
    Ok(())
}

fn watch(organizer: &Arc<Organizer>) -> Result<(), String> {
    let handle = organizer.watch().map_err(|e| e.to_string())?;
    let stopper = handle.stopper();
    ctrlc::set_handler(move || stopper.request_stop())
        .map_err(|e| format!("Error installing Ctrl-C handler: {}", e))?;
    OutputFormatter::info(&format!(
        "Watching {} (Ctrl-C to stop)",
        organizer.root().display()
    ));

    // The channel closes once the scheduler has stopped and the worker has
    // drained the files already handed to it.
    for outcome in handle.outcomes() {
        OutputFormatter::watch_outcome(&outcome);
    }

    let stats = handle.stop();
    OutputFormatter::watch_stats(&stats);
    Ok(())
}

fn undo(organizer: &Organizer, batch: Option<BatchId>) -> Result<(), String> {
    let result = match batch {
        Some(id) => organizer.undo_batch(id),
        None => organizer.undo_last(),
    }
    .map_err(|e| e.to_string())?;
    OutputFormatter::undo_result(&result);
    if result.is_complete() {
        Ok(())
    } else {
        Err(format!(
            "{} record(s) of batch #{} could not be restored",
            result.issues.len(),
            result.batch_id
        ))
    }
}

fn history(organizer: &Organizer) -> Result<(), String> {
    let batches = organizer.history().map_err(|e| e.to_string())?;
    OutputFormatter::history(&batches);
    Ok(())
}
