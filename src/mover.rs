//! Move planning and execution.
//!
//! [`TransactionalMover::plan_move`] turns a classified [`Candidate`] into a
//! [`MovePlan`] without touching the filesystem; [`commit`] performs it. Plans
//! never overwrite: an occupied destination gets the lowest free `" (n)"`
//! suffix, and an occupant identical in size and mtime to the candidate means
//! the file was already organized.

use crate::classifier::{Candidate, Classification};
use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Highest disambiguator tried before giving up on a destination.
const MAX_DISAMBIGUATOR: u32 = 9_999;

/// Per-file move failure. Recorded in the run summary; never aborts a run.
#[derive(Debug, Error)]
pub enum MoveError {
    #[error("source vanished before it could be moved: {}", .0.display())]
    SourceVanished(PathBuf),

    #[error("permission denied while trying to {action} {}", .path.display())]
    PermissionDenied { action: &'static str, path: PathBuf },

    #[error("disk full while trying to {action} {}", .path.display())]
    DiskFull { action: &'static str, path: PathBuf },

    #[error("no free name for {} after {MAX_DISAMBIGUATOR} attempts", .0.display())]
    CollisionUnresolvable(PathBuf),

    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MoveError {
    fn from_io(action: &'static str, path: &Path, err: io::Error) -> Self {
        let path = path.to_path_buf();
        match err.kind() {
            io::ErrorKind::PermissionDenied => MoveError::PermissionDenied { action, path },
            io::ErrorKind::StorageFull => MoveError::DiskFull { action, path },
            _ => MoveError::Io {
                action,
                path,
                source: err,
            },
        }
    }
}

/// How a file reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveMethod {
    /// Same-volume atomic rename.
    Rename,
    /// Cross-volume copy, then delete of the source.
    Copy,
}

/// A planned move, computed but not yet performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan {
    pub candidate: Candidate,
    pub classification: Classification,
    /// Destination before any disambiguator was applied.
    pub target: PathBuf,
    /// Destination chosen at planning time.
    pub destination: PathBuf,
}

impl MovePlan {
    /// Whether the planned name differs from the original file name.
    pub fn is_renamed(&self) -> bool {
        self.destination != self.target
    }
}

/// Result of planning a single candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Planned {
    Move(MovePlan),
    /// The file is already where it belongs, or an identical copy is.
    AlreadyOrganized { source: PathBuf, destination: PathBuf },
}

/// A move that has happened on disk but is not yet journaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMove {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub method: MoveMethod,
    /// Directories created for this move, shallowest first.
    pub created_dirs: Vec<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

/// Plans moves under a destination root.
///
/// Destinations claimed by earlier plans from the same mover are treated as
/// occupied, so a preview of many files never hands out the same name twice.
#[derive(Debug)]
pub struct TransactionalMover {
    root: PathBuf,
    claimed: HashSet<PathBuf>,
}

impl TransactionalMover {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            claimed: HashSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Computes where `candidate` should go.
    ///
    /// # Errors
    ///
    /// Returns [`MoveError::CollisionUnresolvable`] when every disambiguator is
    /// taken, or an I/O error if an occupant cannot be inspected.
    pub fn plan_move(
        &mut self,
        candidate: &Candidate,
        classification: &Classification,
    ) -> Result<Planned, MoveError> {
        let target = self
            .root
            .join(classification.relative_dir())
            .join(&candidate.name);

        if target == candidate.source {
            return Ok(Planned::AlreadyOrganized {
                source: candidate.source.clone(),
                destination: target,
            });
        }

        for n in 0..=MAX_DISAMBIGUATOR {
            let path = disambiguate(&target, n);
            if self.claimed.contains(&path) {
                continue;
            }
            match fs::symlink_metadata(&path) {
                Ok(meta) => {
                    if meta.is_file() && matches_snapshot(&meta, candidate) {
                        debug!(
                            source = %candidate.source.display(),
                            destination = %path.display(),
                            "identical file already at destination"
                        );
                        return Ok(Planned::AlreadyOrganized {
                            source: candidate.source.clone(),
                            destination: path,
                        });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.claimed.insert(path.clone());
                    return Ok(Planned::Move(MovePlan {
                        candidate: candidate.clone(),
                        classification: classification.clone(),
                        target,
                        destination: path,
                    }));
                }
                Err(e) => return Err(MoveError::from_io("inspect", &path, e)),
            }
        }

        Err(MoveError::CollisionUnresolvable(target))
    }
}

/// Performs a planned move.
///
/// The destination is re-checked: if something appeared there since planning,
/// the lowest free disambiguator is taken instead. Missing directories are
/// created and reported in [`CompletedMove::created_dirs`]; on failure they are
/// removed again.
///
/// # Errors
///
/// Returns a [`MoveError`] describing why this one file could not be moved.
pub fn commit(plan: &MovePlan) -> Result<CompletedMove, MoveError> {
    let source = &plan.candidate.source;
    match fs::symlink_metadata(source) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(MoveError::SourceVanished(source.clone()));
        }
        Err(e) => return Err(MoveError::from_io("inspect", source, e)),
    }

    let destination = if exists(&plan.destination) {
        let free = lowest_free(&plan.target)?;
        debug!(
            planned = %plan.destination.display(),
            chosen = %free.display(),
            "planned destination taken, re-disambiguated"
        );
        free
    } else {
        plan.destination.clone()
    };

    let parent = destination
        .parent()
        .ok_or_else(|| MoveError::Io {
            action: "resolve parent of",
            path: destination.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"),
        })?
        .to_path_buf();
    let created_dirs = create_missing_dirs(&parent)?;

    match relocate(source, &destination) {
        Ok(method) => {
            info!(
                source = %source.display(),
                destination = %destination.display(),
                ?method,
                "moved"
            );
            Ok(CompletedMove {
                source: source.clone(),
                destination,
                method,
                created_dirs,
                timestamp: Utc::now(),
            })
        }
        Err(e) => {
            remove_empty_dirs(&created_dirs);
            if e.kind() == io::ErrorKind::NotFound && !exists(source) {
                return Err(MoveError::SourceVanished(source.clone()));
            }
            Err(MoveError::from_io("move", source, e))
        }
    }
}

/// Puts a completed move back where it came from.
///
/// Used when a move happened but could not be journaled.
///
/// # Errors
///
/// Returns the I/O error if the file cannot be moved back.
pub fn rollback(done: &CompletedMove) -> io::Result<()> {
    relocate(&done.destination, &done.source)?;
    remove_empty_dirs(&done.created_dirs);
    Ok(())
}

/// Moves `from` to `to` by rename, falling back to copy + delete across volumes.
///
/// `to` must not exist; its parent must.
pub(crate) fn relocate(from: &Path, to: &Path) -> io::Result<MoveMethod> {
    match fs::rename(from, to) {
        Ok(()) => Ok(MoveMethod::Rename),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            warn!(
                from = %from.display(),
                to = %to.display(),
                "cross-filesystem move; copying instead"
            );
            copy_then_remove(from, to)?;
            Ok(MoveMethod::Copy)
        }
        Err(e) => Err(e),
    }
}

fn copy_then_remove(from: &Path, to: &Path) -> io::Result<()> {
    let meta = fs::metadata(from)?;
    let tmp = temp_sibling(to);

    let result = (|| {
        fs::copy(from, &tmp)?;
        fs::File::open(&tmp)?.sync_all()?;
        filetime::set_file_times(
            &tmp,
            FileTime::from_last_access_time(&meta),
            FileTime::from_last_modification_time(&meta),
        )?;
        if exists(to) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} appeared during copy", to.display()),
            ));
        }
        fs::rename(&tmp, to)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::remove_file(from)
}

fn temp_sibling(to: &Path) -> PathBuf {
    let name = to
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    to.with_file_name(format!(".dltidy-{}-{}.partial", std::process::id(), name))
}

/// `name.ext` for `n == 0`, otherwise `name (n).ext`.
///
/// The suffix goes before the last extension only: `a.tar.gz` becomes
/// `a.tar (1).gz`, and `README` becomes `README (1)`.
pub fn disambiguate(path: &Path, n: u32) -> PathBuf {
    if n == 0 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    let mut name = OsString::from(stem);
    name.push(format!(" ({n})"));
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}

fn lowest_free(target: &Path) -> Result<PathBuf, MoveError> {
    (0..=MAX_DISAMBIGUATOR)
        .map(|n| disambiguate(target, n))
        .find(|p| !exists(p))
        .ok_or_else(|| MoveError::CollisionUnresolvable(target.to_path_buf()))
}

fn matches_snapshot(meta: &fs::Metadata, candidate: &Candidate) -> bool {
    meta.len() == candidate.size
        && meta
            .modified()
            .map(|m| m == candidate.modified)
            .unwrap_or(false)
}

pub(crate) fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Creates `dir` and any missing ancestors, returning the ones it created.
pub(crate) fn create_missing_dirs(dir: &Path) -> Result<Vec<PathBuf>, MoveError> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(current) = cursor {
        if current.as_os_str().is_empty() || current.is_dir() {
            break;
        }
        missing.push(current.to_path_buf());
        cursor = current.parent();
    }
    missing.reverse();

    if let Err(e) = fs::create_dir_all(dir) {
        remove_empty_dirs(&missing);
        return Err(MoveError::from_io("create directory", dir, e));
    }
    Ok(missing)
}

/// Removes each directory in `dirs`, deepest first, if it is empty.
pub(crate) fn remove_empty_dirs(dirs: &[PathBuf]) -> usize {
    let mut removed = 0;
    for dir in dirs.iter().rev() {
        let empty = fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty && fs::remove_dir(dir).is_ok() {
            debug!(dir = %dir.display(), "removed empty directory");
            removed += 1;
        }
    }
    removed
}
