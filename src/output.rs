//! Output formatting and styling module.
//!
//! Provides a centralized interface for all CLI output, including colored output,
//! progress tracking, and formatted tables.

use crate::history::{BatchSummary, UndoIssue, UndoResult};
use crate::mover::MovePlan;
use crate::organizer::{FileFailure, RunSummary, ScanReport};
use crate::watch::{WatchOutcome, WatchStats};
use chrono::Local;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::Path;

/// Manages all CLI output with consistent styling and formatting.
///
/// This struct provides methods for:
/// - Success messages (green with ✓)
/// - Error messages (red with ✗)
/// - Warning messages (yellow with ⚠)
/// - Info messages (cyan)
/// - Progress bars for operations
/// - Summary tables with statistics
pub struct OutputFormatter;

impl OutputFormatter {
    /// Prints a success message in green with a checkmark.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use dltidy::output::OutputFormatter;
    /// OutputFormatter::success("File organized successfully!");
    /// ```
    pub fn success(message: &str) {
        println!("{} {}", "✓".green(), message);
    }

    /// Prints an error message in red with an X mark.
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red(), message);
    }

    /// Prints a warning message in yellow with a warning symbol.
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow(), message);
    }

    /// Prints an info message in cyan.
    pub fn info(message: &str) {
        println!("{}", message.cyan());
    }

    pub fn plain(message: &str) {
        println!("{}", message);
    }

    /// Prints a section header.
    pub fn header(header: &str) {
        println!("\n{}", header.bold());
    }

    /// Creates and returns a progress bar for file operations.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use dltidy::output::OutputFormatter;
    /// let pb = OutputFormatter::create_progress_bar(100);
    /// pb.inc(1);
    /// pb.finish_with_message("Completed!");
    /// ```
    pub fn create_progress_bar(total: u64) -> ProgressBar {
        let pb = ProgressBar::new(total);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("█▓░"));
        }
        pb
    }

    /// Prints a summary table with file counts by category.
    pub fn summary_table(category_counts: &BTreeMap<String, usize>, total_files: usize) {
        Self::header("SUMMARY");

        let max_category_len = category_counts
            .keys()
            .map(|name| display_width(name))
            .max()
            .unwrap_or(0)
            .max(8);

        println!(
            "{} | {}",
            pad("Category", max_category_len).bold(),
            "Files".bold()
        );
        println!("{}", "-".repeat(max_category_len + 10));

        for (category, count) in category_counts {
            println!(
                "{} | {} {}",
                pad(category, max_category_len),
                count.to_string().green(),
                plural(*count, "file")
            );
        }

        println!("{}", "-".repeat(max_category_len + 10));
        println!(
            "{} | {} {}",
            pad("Total", max_category_len).bold(),
            total_files.to_string().green().bold(),
            plural(total_files, "file")
        );
    }

    /// Prints a dry-run notice message.
    pub fn dry_run_notice(message: &str) {
        println!("{}", format!("[PREVIEW] {}", message).yellow());
    }

    /// Lists what a preview would do, grouped by destination label.
    pub fn preview(report: &ScanReport, root: &Path) {
        if report.plans.is_empty() {
            Self::info("Nothing to organize.");
        } else {
            let mut groups: BTreeMap<String, Vec<&MovePlan>> = BTreeMap::new();
            for plan in &report.plans {
                groups
                    .entry(plan.classification.label())
                    .or_default()
                    .push(plan);
            }
            for (label, plans) in &groups {
                Self::header(&format!("{} ({})", label, plans.len()));
                for plan in plans {
                    let rel = plan
                        .destination
                        .strip_prefix(root)
                        .unwrap_or(&plan.destination);
                    let renamed = if plan.is_renamed() {
                        " (renamed)".yellow().to_string()
                    } else {
                        String::new()
                    };
                    println!(
                        "  {} {} {}{}",
                        plan.candidate.name,
                        "→".dimmed(),
                        rel.display(),
                        renamed
                    );
                }
            }
            let counts = groups.iter().map(|(k, v)| (k.clone(), v.len())).collect();
            Self::summary_table(&counts, report.plans.len());
        }

        Self::side_counts(
            report.already_organized.len(),
            report.unclassified.len(),
            report.skipped.len(),
        );
        Self::failures(&report.errors);
    }

    /// End-of-run summary for an organize run.
    pub fn run_summary(summary: &RunSummary, root: &Path) {
        let mut counts = BTreeMap::new();
        for record in &summary.moved {
            let label = record
                .destination
                .parent()
                .and_then(|p| p.strip_prefix(root).ok())
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            *counts.entry(label).or_insert(0) += 1;
        }
        if !counts.is_empty() {
            Self::summary_table(&counts, summary.moved.len());
        }

        match summary.batch_id {
            Some(id) => Self::success(&format!(
                "Moved {} {} as batch #{}. Run 'dltidy undo' to revert.",
                summary.moved.len(),
                plural(summary.moved.len(), "file"),
                id
            )),
            None => Self::info("No files were moved."),
        }
        Self::side_counts(
            summary.already_organized.len(),
            summary.unclassified.len(),
            summary.skipped.len(),
        );
        Self::failures(&summary.failures);
    }

    fn side_counts(already: usize, unclassified: usize, skipped: usize) {
        if already > 0 {
            Self::plain(&format!("{} already organized", already));
        }
        if unclassified > 0 {
            Self::plain(&format!("{} unclassified, left in place", unclassified));
        }
        if skipped > 0 {
            Self::plain(&format!("{} skipped by filters", skipped));
        }
    }

    fn failures(failures: &[FileFailure]) {
        if failures.is_empty() {
            return;
        }
        Self::warning(&format!(
            "{} {} could not be organized:",
            failures.len(),
            plural(failures.len(), "file")
        ));
        for failure in failures {
            Self::error(&format!("{}: {}", failure.path.display(), failure.error));
        }
    }

    /// Summary of an undo.
    pub fn undo_result(result: &UndoResult) {
        if result.already_reverted {
            Self::info(&format!("Batch #{} was already undone.", result.batch_id));
            return;
        }
        if result.is_complete() {
            Self::success(&format!(
                "Undid batch #{}: {} restored{}.",
                result.batch_id,
                result.restored,
                if result.already_restored > 0 {
                    format!(", {} already in place", result.already_restored)
                } else {
                    String::new()
                }
            ));
            return;
        }
        Self::warning(&format!(
            "Batch #{} partially undone: {} restored, {} {} need attention.",
            result.batch_id,
            result.restored,
            result.issues.len(),
            plural(result.issues.len(), "file")
        ));
        for issue in &result.issues {
            let kind = match issue {
                UndoIssue::Conflict { .. } => "conflict",
                UndoIssue::Failed { .. } => "failed",
            };
            Self::error(&format!("[{}] {}", kind, issue));
        }
        Self::plain("Resolve these and run undo again for the same batch.");
    }

    /// Table of past batches, newest first.
    pub fn history(batches: &[BatchSummary]) {
        if batches.is_empty() {
            Self::info("No history yet.");
            return;
        }
        Self::header("HISTORY");
        for batch in batches.iter().rev() {
            let status = if batch.reverted {
                "undone".dimmed()
            } else if !batch.closed {
                "interrupted".yellow()
            } else {
                "active".green()
            };
            println!(
                "#{:<5} {}  {:<6} {:>4} {}  [{}]",
                batch.batch_id,
                batch
                    .created_at
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M"),
                batch.origin,
                batch.moves,
                plural(batch.moves, "file"),
                status
            );
            for dest in &batch.sample {
                println!("        {}", dest.display().to_string().dimmed());
            }
            if batch.moves > batch.sample.len() {
                println!("        … and {} more", batch.moves - batch.sample.len());
            }
        }
    }

    /// One line per watch outcome.
    pub fn watch_outcome(outcome: &WatchOutcome) {
        match outcome {
            WatchOutcome::Organized { batch_id, record } => Self::success(&format!(
                "{} → {} (batch #{})",
                file_name(&record.source),
                record.destination.display(),
                batch_id
            )),
            WatchOutcome::AlreadyOrganized(path) => {
                Self::plain(&format!("{} already organized", path.display()))
            }
            WatchOutcome::Unclassified(path) => {
                Self::plain(&format!("{} unclassified, left in place", file_name(path)))
            }
            WatchOutcome::Skipped(_) => {}
            WatchOutcome::Failed { path, error } => {
                Self::error(&format!("{}: {}", path.display(), error))
            }
        }
    }

    pub fn watch_stats(stats: &WatchStats) {
        Self::header("WATCH SUMMARY");
        println!(
            "organized {}, already organized {}, unclassified {}, failed {}",
            stats.organized.to_string().green(),
            stats.already_organized,
            stats.unclassified,
            stats.failed.to_string().red()
        );
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        word.to_string()
    } else {
        format!("{}s", word)
    }
}

/// Terminal width of `s`, counting CJK characters as two columns.
fn display_width(s: &str) -> usize {
    s.chars()
        .map(|c| if (c as u32) >= 0x1100 { 2 } else { 1 })
        .sum()
}

fn pad(s: &str, width: usize) -> String {
    let fill = width.saturating_sub(display_width(s));
    format!("{}{}", s, " ".repeat(fill))
}
