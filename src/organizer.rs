//! High-level operations: preview, organize, watch, undo and history.
//!
//! An [`Organizer`] owns the compiled [`Settings`] and the [`HistoryStore`]
//! for one root directory.

use crate::classifier::{Candidate, Classification, classify, date_bucket};
use crate::config::{Settings, UnclassifiedPolicy};
use crate::error::{Error, Result};
use crate::history::{
    BatchId, BatchOrigin, BatchSummary, HistoryError, HistoryStore, MoveRecord, UndoResult,
};
use crate::mover::{self, MoveError, MovePlan, Planned, TransactionalMover};
use crate::watch::{StableFileHandler, WatchHandle, WatchOutcome, WatchScheduler};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Why one file could not be handled. Never aborts a run.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("cannot read file: {0}")]
    Read(#[from] io::Error),
    #[error(transparent)]
    Move(#[from] MoveError),
    /// The history journal stores paths as UTF-8 text.
    #[error("file path is not valid UTF-8")]
    NonUtf8Path,
}

#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: FileError,
}

/// Result of planning a run without executing it.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub plans: Vec<MovePlan>,
    pub already_organized: Vec<PathBuf>,
    /// Files excluded by filters.
    pub skipped: Vec<PathBuf>,
    /// Files no rule matched, left in place.
    pub unclassified: Vec<PathBuf>,
    pub errors: Vec<FileFailure>,
}

/// Result of an organize run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// The batch holding this run's moves; `None` if nothing moved. If another
    /// process undid the batch mid-run, later moves went to a new batch and
    /// this is that one.
    pub batch_id: Option<BatchId>,
    pub moved: Vec<MoveRecord>,
    pub already_organized: Vec<PathBuf>,
    pub unclassified: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failures: Vec<FileFailure>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Adds the non-move results of the scan this run executed.
    pub fn absorb_scan(&mut self, report: ScanReport) {
        self.already_organized = report.already_organized;
        self.unclassified = report.unclassified;
        self.skipped = report.skipped;
        let mut failures = report.errors;
        failures.append(&mut self.failures);
        self.failures = failures;
    }
}

/// Progress notification for a single executed plan.
#[derive(Debug)]
pub enum FileOutcome<'a> {
    Moved(&'a MoveRecord),
    Failed(&'a FileFailure),
}

/// Organizes one root directory.
#[derive(Debug)]
pub struct Organizer {
    settings: Settings,
    history: HistoryStore,
}

impl Organizer {
    pub fn new(settings: Settings) -> Self {
        let history = HistoryStore::new(&settings.history_path);
        Self { settings, history }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        &self.settings.root
    }

    pub fn history_store(&self) -> &HistoryStore {
        &self.history
    }

    /// Plans every move for the current contents of the root.
    ///
    /// Nothing on disk changes. The plans carry the candidates' snapshots so
    /// [`execute`](Self::execute) later uses the same destinations.
    ///
    /// # Errors
    ///
    /// Fails only if the root itself cannot be read.
    pub fn scan(&self) -> Result<ScanReport> {
        let root = self.root();
        let mut report = ScanReport::default();
        let mut mover = TransactionalMover::new(root);

        for path in self.enumerate(&mut report)? {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            if !self.settings.filters.should_include(rel) {
                debug!(path = %path.display(), "filtered");
                report.skipped.push(path);
                continue;
            }

            if path.to_str().is_none() {
                warn!(path = %path.display(), "path is not valid UTF-8, left in place");
                report.errors.push(FileFailure {
                    path,
                    error: FileError::NonUtf8Path,
                });
                continue;
            }

            let candidate = match Candidate::from_path(&path) {
                Ok(candidate) => candidate,
                Err(e) => {
                    report.errors.push(FileFailure {
                        path,
                        error: e.into(),
                    });
                    continue;
                }
            };

            let Some(class) = self.classification_for(&candidate) else {
                report.unclassified.push(path);
                continue;
            };

            match mover.plan_move(&candidate, &class) {
                Ok(Planned::Move(plan)) => report.plans.push(plan),
                Ok(Planned::AlreadyOrganized { source, .. }) => {
                    report.already_organized.push(source)
                }
                Err(e) => report.errors.push(FileFailure {
                    path,
                    error: e.into(),
                }),
            }
        }

        debug!(
            root = %root.display(),
            plans = report.plans.len(),
            already = report.already_organized.len(),
            "scan finished"
        );
        Ok(report)
    }

    /// Scans and executes in one go.
    ///
    /// # Errors
    ///
    /// See [`scan`](Self::scan) and [`execute`](Self::execute).
    pub fn organize(&self) -> Result<RunSummary> {
        self.organize_with_progress(|_| {})
    }

    /// [`organize`](Self::organize) with a per-file progress callback.
    ///
    /// # Errors
    ///
    /// See [`scan`](Self::scan) and [`execute`](Self::execute).
    pub fn organize_with_progress(
        &self,
        progress: impl FnMut(&FileOutcome<'_>),
    ) -> Result<RunSummary> {
        let report = self.scan()?;
        let mut summary = self.execute_with_progress(&report.plans, progress)?;
        summary.absorb_scan(report);
        Ok(summary)
    }

    /// Commits previously scanned plans as one batch.
    ///
    /// # Errors
    ///
    /// Per-file failures are collected in the summary. An error is returned
    /// only when a completed move cannot be journaled; that move is rolled
    /// back and the run stops.
    pub fn execute(&self, plans: &[MovePlan]) -> Result<RunSummary> {
        self.execute_with_progress(plans, |_| {})
    }

    /// [`execute`](Self::execute) with a per-file progress callback.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub fn execute_with_progress(
        &self,
        plans: &[MovePlan],
        mut progress: impl FnMut(&FileOutcome<'_>),
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut batch = self.history.begin(BatchOrigin::Scan);

        for plan in plans {
            let done = match mover::commit(plan) {
                Ok(done) => done,
                Err(e) => {
                    warn!(path = %plan.candidate.source.display(), error = %e, "move failed");
                    let failure = FileFailure {
                        path: plan.candidate.source.clone(),
                        error: e.into(),
                    };
                    progress(&FileOutcome::Failed(&failure));
                    summary.failures.push(failure);
                    continue;
                }
            };

            match batch.record(&done) {
                Ok(record) => {
                    progress(&FileOutcome::Moved(&record));
                    summary.moved.push(record);
                }
                Err(source) => return Err(self.abandon(&done, source)),
            }
        }

        summary.batch_id = batch.close()?;
        if self.settings.recursive {
            self.prune_emptied_dirs(&summary.moved);
        }
        if let Some(id) = summary.batch_id {
            info!(
                batch = %id,
                moved = summary.moved.len(),
                failed = summary.failures.len(),
                "organize finished"
            );
        }
        Ok(summary)
    }

    /// Starts watching the root for new files.
    ///
    /// # Errors
    ///
    /// Fails if the filesystem watcher or its threads cannot be started.
    pub fn watch(self: &Arc<Self>) -> Result<WatchHandle> {
        WatchScheduler::watch(
            self.root(),
            self.settings.recursive,
            self.settings.debounce,
            Arc::clone(self),
        )
    }

    /// Starts the watch machinery without a filesystem watcher; events are fed
    /// through [`WatchHandle::inject`].
    ///
    /// # Errors
    ///
    /// Fails if the threads cannot be started.
    pub fn watch_channel(self: &Arc<Self>) -> Result<WatchHandle> {
        WatchScheduler::spawn(self.settings.debounce, Arc::clone(self))
    }

    /// Undoes the most recent batch that is not yet reverted.
    ///
    /// # Errors
    ///
    /// Store-level failures, including [`HistoryError::NothingToUndo`].
    pub fn undo_last(&self) -> Result<UndoResult> {
        Ok(self.history.undo(None)?)
    }

    /// Undoes a specific batch.
    ///
    /// # Errors
    ///
    /// Store-level failures, including [`HistoryError::UnknownBatch`].
    pub fn undo_batch(&self, id: BatchId) -> Result<UndoResult> {
        Ok(self.history.undo(Some(id))?)
    }

    /// All batches, oldest first.
    ///
    /// # Errors
    ///
    /// Fails if the journal is unreadable or corrupted.
    pub fn history(&self) -> Result<Vec<BatchSummary>> {
        Ok(self.history.list_batches()?)
    }

    /// Classification including the unclassified-bucket policy.
    fn classification_for(&self, candidate: &Candidate) -> Option<Classification> {
        let options = self.settings.classify_options();
        classify(candidate, &self.settings.rules, options).or_else(|| {
            match &self.settings.unclassified {
                UnclassifiedPolicy::LeaveInPlace => None,
                UnclassifiedPolicy::Bucket(bucket) => Some(Classification {
                    category: bucket.clone(),
                    subcategory: None,
                    date_bucket: options
                        .archive_by_date
                        .then(|| date_bucket(candidate.modified)),
                }),
            }
        })
    }

    /// Lists candidate files under the root, sorted for a stable order.
    fn enumerate(&self, report: &mut ScanReport) -> Result<Vec<PathBuf>> {
        let root = self.root();
        let scan_err = |source| Error::Scan {
            path: root.to_path_buf(),
            source,
        };
        let meta = fs::metadata(root).map_err(scan_err)?;
        if !meta.is_dir() {
            return Err(scan_err(io::Error::new(
                io::ErrorKind::NotADirectory,
                "not a directory",
            )));
        }

        let mut files = Vec::new();
        if self.settings.recursive {
            let hidden = self.settings.filters.hidden_enabled();
            let walker = WalkDir::new(root)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    !entry.file_type().is_dir() || descend_into(entry.file_name(), hidden)
                });
            for entry in walker {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        files.push(entry.into_path());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let path = e.path().unwrap_or(root).to_path_buf();
                        report.errors.push(FileFailure {
                            path,
                            error: FileError::Read(e.into()),
                        });
                    }
                }
            }
        } else {
            for entry in fs::read_dir(root).map_err(scan_err)? {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        report.errors.push(FileFailure {
                            path: root.to_path_buf(),
                            error: e.into(),
                        });
                        continue;
                    }
                };
                match entry.file_type() {
                    Ok(ft) if ft.is_file() => files.push(entry.path()),
                    Ok(_) => {}
                    Err(e) => report.errors.push(FileFailure {
                        path: entry.path(),
                        error: e.into(),
                    }),
                }
            }
            files.sort();
        }

        files.retain(|p| !self.history.owns(p));
        Ok(files)
    }

    /// Whether a watch notification for `path` concerns a file we organize.
    fn is_watchable(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(self.root()) else {
            return false;
        };
        let parts: Vec<_> = rel.components().collect();
        if parts.is_empty() || parts.iter().any(|c| !matches!(c, Component::Normal(_))) {
            return false;
        }
        if !self.settings.recursive && parts.len() != 1 {
            return false;
        }
        let hidden = self.settings.filters.hidden_enabled();
        let dirs_ok = parts[..parts.len() - 1]
            .iter()
            .all(|c| descend_into(c.as_os_str(), hidden));
        dirs_ok && !self.history.owns(path) && self.settings.filters.should_include(rel)
    }

    /// Handles a completed move that could not be journaled.
    fn abandon(&self, done: &mover::CompletedMove, source: HistoryError) -> Error {
        let rolled_back = match mover::rollback(done) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    path = %done.destination.display(),
                    error = %e,
                    "could not roll back unrecorded move"
                );
                false
            }
        };
        Error::NotRecorded {
            path: done.source.clone(),
            rolled_back,
            source,
        }
    }

    /// Removes source directories emptied by a recursive run, up to the root.
    fn prune_emptied_dirs(&self, moved: &[MoveRecord]) {
        let root = self.root();
        for record in moved {
            let mut chain = Vec::new();
            let mut dir = record.source.parent();
            while let Some(d) = dir {
                if d == root || !d.starts_with(root) {
                    break;
                }
                chain.push(d.to_path_buf());
                dir = d.parent();
            }
            chain.reverse();
            mover::remove_empty_dirs(&chain);
        }
    }
}

fn descend_into(name: &std::ffi::OsStr, hidden_enabled: bool) -> bool {
    let name = name.to_string_lossy();
    !(name.ends_with(".app") || (!hidden_enabled && name.starts_with('.')))
}

impl StableFileHandler for Organizer {
    fn accepts(&self, path: &Path) -> bool {
        self.is_watchable(path)
    }

    fn handle(&self, path: &Path) -> WatchOutcome {
        if path.to_str().is_none() {
            return WatchOutcome::Failed {
                path: path.to_path_buf(),
                error: FileError::NonUtf8Path.to_string(),
            };
        }
        let candidate = match Candidate::from_path(path) {
            Ok(candidate) => candidate,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return WatchOutcome::Skipped(path.to_path_buf());
            }
            Err(e) => {
                return WatchOutcome::Failed {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                };
            }
        };

        let Some(class) = self.classification_for(&candidate) else {
            info!(path = %path.display(), "unclassified, left in place");
            return WatchOutcome::Unclassified(path.to_path_buf());
        };

        let plan = match TransactionalMover::new(self.root()).plan_move(&candidate, &class) {
            Ok(Planned::Move(plan)) => plan,
            Ok(Planned::AlreadyOrganized { destination, .. }) => {
                return WatchOutcome::AlreadyOrganized(destination);
            }
            Err(e) => {
                return WatchOutcome::Failed {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                };
            }
        };

        let done = match mover::commit(&plan) {
            Ok(done) => done,
            Err(MoveError::SourceVanished(p)) => return WatchOutcome::Skipped(p),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "move failed");
                return WatchOutcome::Failed {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                };
            }
        };

        match self
            .history
            .append_batch(BatchOrigin::Watch, std::slice::from_ref(&done))
        {
            Ok(mut records) => match records.pop() {
                Some(record) => WatchOutcome::Organized {
                    batch_id: record.batch_id,
                    record,
                },
                None => WatchOutcome::Failed {
                    path: path.to_path_buf(),
                    error: "move was not journaled".to_string(),
                },
            },
            Err(source) => WatchOutcome::Failed {
                path: path.to_path_buf(),
                error: self.abandon(&done, source).to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn organizer(root: &Path, tweak: impl FnOnce(&mut Config)) -> Organizer {
        let mut config = Config {
            root_path: Some(root.to_path_buf()),
            archive_by_date: false,
            ..Config::default()
        };
        tweak(&mut config);
        Organizer::new(config.compile().unwrap())
    }

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, path.to_string_lossy().as_bytes()).unwrap();
    }

    #[test]
    fn test_scan_reports_every_kind_of_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("paper.pdf"));
        touch(&root.join("movie.mkv.crdownload"));
        touch(&root.join("mystery.zzz"));
        touch(&root.join("nested/deep.pdf"));

        let org = organizer(root, |c| c.leave_unclassified = true);
        let report = org.scan().unwrap();

        assert_eq!(report.plans.len(), 1);
        assert_eq!(report.plans[0].destination, root.join("文档/paper.pdf"));
        assert_eq!(report.skipped, vec![root.join("movie.mkv.crdownload")]);
        assert_eq!(report.unclassified, vec![root.join("mystery.zzz")]);
        assert!(report.errors.is_empty());
        // Preview touches nothing.
        assert!(root.join("paper.pdf").exists());
    }

    #[test]
    fn test_unclassified_bucket_policy() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("mystery.zzz"));

        let org = organizer(root, |_| {});
        let summary = org.organize().unwrap();
        assert_eq!(summary.moved.len(), 1);
        assert!(root.join("其他/mystery.zzz").exists());
    }

    #[test]
    fn test_recursive_scan_skips_hidden_dirs_and_app_bundles() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("sub/report.pdf"));
        touch(&root.join(".git/objects/pack.zip"));
        touch(&root.join("Tool.app/Contents/Info.plist"));

        let org = organizer(root, |c| c.recursive = true);
        let summary = org.organize().unwrap();

        assert_eq!(summary.moved.len(), 1);
        assert!(root.join("文档/report.pdf").exists());
        assert!(root.join(".git/objects/pack.zip").exists());
        assert!(root.join("Tool.app/Contents/Info.plist").exists());
        // The emptied source folder is cleaned up.
        assert!(!root.join("sub").exists());

        let undo = org.undo_last().unwrap();
        assert!(undo.is_complete());
        assert!(root.join("sub/report.pdf").exists());
    }

    #[test]
    fn test_history_journal_is_never_organized() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("a.pdf"));
        let org = organizer(root, |c| c.filters.enable_hidden_files = true);
        org.organize().unwrap();
        touch(&root.join("b.pdf"));

        let report = org.scan().unwrap();
        assert_eq!(report.plans.len(), 1);
        assert_eq!(report.plans[0].candidate.name, "b.pdf");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_name_fails_alone() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let odd = root.join(OsStr::from_bytes(b"caf\xe9.pdf"));
        fs::write(&odd, "latin-1 name").unwrap();
        touch(&root.join("zeta.pdf"));

        let org = organizer(root, |_| {});
        let summary = org.organize().unwrap();

        assert_eq!(summary.moved.len(), 1);
        assert!(root.join("文档/zeta.pdf").exists());
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].path, odd);
        assert!(matches!(summary.failures[0].error, FileError::NonUtf8Path));
        assert!(odd.exists());

        let history = org.history().unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].closed);
        assert!(matches!(org.handle(&odd), WatchOutcome::Failed { .. }));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let org = organizer(&tmp.path().join("nope"), |_| {});
        assert!(matches!(org.scan(), Err(Error::Scan { .. })));
    }

    #[test]
    fn test_watchable_paths() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let flat = organizer(root, |_| {});
        assert!(flat.is_watchable(&root.join("a.pdf")));
        assert!(!flat.is_watchable(&root.join("sub/a.pdf")));
        assert!(!flat.is_watchable(&root.join(".hidden.pdf")));
        assert!(!flat.is_watchable(&root.join("a.pdf.part")));
        assert!(!flat.is_watchable(&root.join(".organize_history.jsonl")));
        assert!(!flat.is_watchable(Path::new("/elsewhere/a.pdf")));

        let deep = organizer(root, |c| c.recursive = true);
        assert!(deep.is_watchable(&root.join("sub/a.pdf")));
        assert!(!deep.is_watchable(&root.join(".cache/a.pdf")));
        assert!(!deep.is_watchable(&root.join("X.app/a.pdf")));
    }

    #[test]
    fn test_watch_handler_forms_single_file_batches() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("Cursor.dmg"));
        touch(&root.join("data.csv"));
        let org = organizer(root, |_| {});

        let first = org.handle(&root.join("Cursor.dmg"));
        let second = org.handle(&root.join("data.csv"));
        assert!(matches!(first, WatchOutcome::Organized { batch_id: BatchId(1), .. }));
        assert!(matches!(second, WatchOutcome::Organized { batch_id: BatchId(2), .. }));

        let history = org.history().unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|b| b.moves == 1 && b.origin == BatchOrigin::Watch));

        assert_eq!(
            org.handle(&root.join("gone.pdf")),
            WatchOutcome::Skipped(root.join("gone.pdf"))
        );
    }
}
