//! Durable, batch-structured move history with undo.
//!
//! The journal is a JSON Lines file. Every line is one event:
//!
//! ```text
//! {"event":"batch_opened","batch_id":3,"created_at":"...","origin":"scan"}
//! {"event":"moved","record":{"source":"...","destination":"...","batch_id":3,...}}
//! {"event":"batch_closed","batch_id":3,"at":"..."}
//! {"event":"batch_reverted","batch_id":3,"at":"..."}
//! ```
//!
//! Moves are appended one at a time as they happen, so a run that dies half
//! way leaves an open batch holding every completed move, and that batch can
//! still be undone. Batches are never deleted; undo appends `batch_reverted`.
//!
//! Writers are serialized by an in-process [`RwLock`] and an advisory lock on
//! a `<journal>.lock` sidecar file. Readers share both.

use crate::mover::{self, CompletedMove, MoveMethod};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError, RwLock, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Number of destinations shown per batch in summaries.
const SAMPLE_SIZE: usize = 3;

/// Identifier of a batch; strictly increasing within a journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(BatchId)
    }
}

/// What produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOrigin {
    /// A one-shot organize run.
    Scan,
    /// A single file picked up in watch mode.
    Watch,
}

impl fmt::Display for BatchOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOrigin::Scan => f.write_str("scan"),
            BatchOrigin::Watch => f.write_str("watch"),
        }
    }
}

/// One completed, journaled move. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub batch_id: BatchId,
    pub method: MoveMethod,
    /// Directories the move created, shallowest first.
    #[serde(default)]
    pub created_dirs: Vec<PathBuf>,
}

/// A batch as reconstructed from the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: BatchId,
    pub created_at: DateTime<Utc>,
    pub origin: BatchOrigin,
    pub records: Vec<MoveRecord>,
    /// False for a batch whose run was interrupted before it finished.
    pub closed: bool,
    pub reverted_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn is_reverted(&self) -> bool {
        self.reverted_at.is_some()
    }

    fn summary(&self) -> BatchSummary {
        BatchSummary {
            batch_id: self.id,
            created_at: self.created_at,
            origin: self.origin,
            moves: self.records.len(),
            closed: self.closed,
            reverted: self.is_reverted(),
            sample: self
                .records
                .iter()
                .take(SAMPLE_SIZE)
                .map(|r| r.destination.clone())
                .collect(),
        }
    }
}

/// Listing entry for a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub created_at: DateTime<Utc>,
    pub origin: BatchOrigin,
    pub moves: usize,
    pub closed: bool,
    pub reverted: bool,
    /// First few destinations of the batch.
    pub sample: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JournalEvent {
    BatchOpened {
        batch_id: BatchId,
        created_at: DateTime<Utc>,
        origin: BatchOrigin,
    },
    Moved {
        record: MoveRecord,
    },
    BatchClosed {
        batch_id: BatchId,
        at: DateTime<Utc>,
    },
    BatchReverted {
        batch_id: BatchId,
        at: DateTime<Utc>,
    },
}

/// Store-level failures. Fatal for the operation that hit them.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("history journal {} is corrupted at line {line}: {reason}", .path.display())]
    Corrupted {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("no batch with id {0}")]
    UnknownBatch(BatchId),

    #[error("batch {0} is still being written")]
    BatchInProgress(BatchId),

    #[error("nothing to undo")]
    NothingToUndo,

    /// An event that would make the journal inconsistent; nothing was written.
    #[error("refusing to journal inconsistent event: {0}")]
    Rejected(String),

    #[error("failed to encode history event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why a single record could not be reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UndoConflict {
    #[error("a file now occupies the original location")]
    SourceOccupied,
    #[error("the moved file is no longer at its destination")]
    DestinationMissing,
}

/// A per-record undo problem. The rest of the batch is still attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UndoIssue {
    #[error("{}: {conflict}", .record.destination.display())]
    Conflict {
        record: MoveRecord,
        conflict: UndoConflict,
    },
    #[error("{}: {reason}", .record.destination.display())]
    Failed { record: MoveRecord, reason: String },
}

impl UndoIssue {
    pub fn record(&self) -> &MoveRecord {
        match self {
            UndoIssue::Conflict { record, .. } | UndoIssue::Failed { record, .. } => record,
        }
    }
}

/// Outcome of undoing one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoResult {
    pub batch_id: BatchId,
    /// Files moved back by this call.
    pub restored: usize,
    /// Records whose file was already back at its source.
    pub already_restored: usize,
    /// The batch had been reverted before; nothing was touched.
    pub already_reverted: bool,
    /// Empty directories removed after their records were reversed.
    pub removed_dirs: usize,
    pub issues: Vec<UndoIssue>,
}

impl UndoResult {
    fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            restored: 0,
            already_restored: 0,
            already_reverted: false,
            removed_dirs: 0,
            issues: Vec::new(),
        }
    }

    /// True when the batch is now fully reverted.
    pub fn is_complete(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Corruption {
    line: usize,
    reason: String,
}

#[derive(Debug, Default)]
struct State {
    batches: Vec<Batch>,
    /// Journal length at the last load; `None` forces a reload.
    loaded_len: Option<u64>,
    corruption: Option<Corruption>,
}

impl State {
    fn next_id(&self) -> BatchId {
        BatchId(self.batches.last().map_or(1, |b| b.id.0 + 1))
    }

    fn batch(&self, id: BatchId) -> Option<&Batch> {
        self.batches.iter().find(|b| b.id == id)
    }
}

fn apply_event(batches: &mut Vec<Batch>, event: JournalEvent) -> Result<(), String> {
    match event {
        JournalEvent::BatchOpened {
            batch_id,
            created_at,
            origin,
        } => {
            if let Some(last) = batches.last()
                && batch_id <= last.id
            {
                return Err(format!(
                    "batch id {} does not follow {}",
                    batch_id, last.id
                ));
            }
            batches.push(Batch {
                id: batch_id,
                created_at,
                origin,
                records: Vec::new(),
                closed: false,
                reverted_at: None,
            });
        }
        JournalEvent::Moved { record } => {
            let id = record.batch_id;
            let batch = batches
                .iter_mut()
                .find(|b| b.id == id)
                .ok_or_else(|| format!("move recorded for unknown batch {id}"))?;
            if batch.closed || batch.is_reverted() {
                return Err(format!("move recorded for finished batch {id}"));
            }
            batch.records.push(record);
        }
        JournalEvent::BatchClosed { batch_id, .. } => {
            let batch = batches
                .iter_mut()
                .find(|b| b.id == batch_id)
                .ok_or_else(|| format!("close of unknown batch {batch_id}"))?;
            if batch.closed {
                return Err(format!("batch {batch_id} closed twice"));
            }
            batch.closed = true;
        }
        JournalEvent::BatchReverted { batch_id, at } => {
            let batch = batches
                .iter_mut()
                .find(|b| b.id == batch_id)
                .ok_or_else(|| format!("revert of unknown batch {batch_id}"))?;
            batch.reverted_at.get_or_insert(at);
        }
    }
    Ok(())
}

struct Parsed {
    batches: Vec<Batch>,
    /// Bytes up to and including the last newline.
    valid_len: usize,
    corruption: Option<Corruption>,
}

fn parse_journal(bytes: &[u8]) -> Parsed {
    let valid_len = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    let mut parsed = Parsed {
        batches: Vec::new(),
        valid_len,
        corruption: None,
    };

    let text = match std::str::from_utf8(&bytes[..valid_len]) {
        Ok(text) => text,
        Err(e) => {
            parsed.corruption = Some(Corruption {
                line: 0,
                reason: format!("not valid UTF-8: {e}"),
            });
            return parsed;
        }
    };

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let result = serde_json::from_str::<JournalEvent>(line)
            .map_err(|e| e.to_string())
            .and_then(|event| apply_event(&mut parsed.batches, event));
        if let Err(reason) = result {
            parsed.corruption = Some(Corruption {
                line: idx + 1,
                reason,
            });
            break;
        }
    }
    parsed
}

/// Holds the advisory lock on the sidecar file until dropped.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, exclusive: bool) -> Result<Self, HistoryError> {
        let io_err = |source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        if exclusive {
            fs2::FileExt::lock_exclusive(&file).map_err(io_err)?;
        } else {
            fs2::FileExt::lock_shared(&file).map_err(io_err)?;
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Exclusive access to the journal for one mutation.
struct WriteGuard<'a> {
    store: &'a HistoryStore,
    state: RwLockWriteGuard<'a, State>,
    _lock: FileLock,
}

impl WriteGuard<'_> {
    /// Moves a corrupted journal aside so new runs can start a fresh one.
    fn quarantine_if_corrupted(&mut self) -> Result<(), HistoryError> {
        let Some(corruption) = self.state.corruption.take() else {
            return Ok(());
        };
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let mut aside = self.store.path.as_os_str().to_owned();
        aside.push(format!(".corrupt-{stamp}"));
        let aside = PathBuf::from(aside);
        fs::rename(&self.store.path, &aside).map_err(|source| HistoryError::Io {
            path: self.store.path.clone(),
            source,
        })?;
        warn!(
            journal = %self.store.path.display(),
            moved_to = %aside.display(),
            line = corruption.line,
            reason = %corruption.reason,
            "history journal corrupted; starting a new one"
        );
        self.state.batches.clear();
        self.state.loaded_len = Some(0);
        Ok(())
    }

    fn ensure_readable(&self) -> Result<(), HistoryError> {
        match &self.state.corruption {
            Some(c) => Err(self.store.corrupted(c)),
            None => Ok(()),
        }
    }

    fn append(&mut self, events: Vec<JournalEvent>) -> Result<(), HistoryError> {
        let path = &self.store.path;
        let io_err = |source| HistoryError::Io {
            path: path.clone(),
            source,
        };

        // Validate against a copy first so a rejected event never reaches disk.
        let mut batches = self.state.batches.clone();
        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(&event)?);
            buf.push('\n');
            apply_event(&mut batches, event).map_err(HistoryError::Rejected)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        file.write_all(buf.as_bytes()).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();

        self.state.batches = batches;
        self.state.loaded_len = Some(len);
        Ok(())
    }
}

/// The persisted history of batches.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    lock_path: PathBuf,
    state: RwLock<State>,
    in_flight: Mutex<HashSet<BatchId>>,
}

impl HistoryStore {
    /// Opens (lazily) the journal at `path`. Nothing is read until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            state: RwLock::new(State::default()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Whether `path` is this store's journal, its lock or a quarantined journal.
    pub fn owns(&self, path: &Path) -> bool {
        if path == self.path || path == self.lock_path {
            return true;
        }
        match (path.file_name(), self.path.file_name()) {
            (Some(name), Some(journal)) => {
                path.parent() == self.path.parent()
                    && name
                        .to_string_lossy()
                        .starts_with(&format!("{}.corrupt-", journal.to_string_lossy()))
            }
            _ => false,
        }
    }

    fn corrupted(&self, c: &Corruption) -> HistoryError {
        HistoryError::Corrupted {
            path: self.path.clone(),
            line: c.line,
            reason: c.reason.clone(),
        }
    }

    fn io_err(&self, source: io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Reloads the journal if its length changed since the last load.
    ///
    /// With `exclusive`, a torn final line is truncated away so the next append
    /// starts on a clean line.
    fn refresh(&self, state: &mut State, exclusive: bool) -> Result<(), HistoryError> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(self.io_err(e)),
        };
        if state.loaded_len == Some(len) {
            return Ok(());
        }

        let bytes = if len == 0 {
            Vec::new()
        } else {
            fs::read(&self.path).map_err(|e| self.io_err(e))?
        };
        let parsed = parse_journal(&bytes);
        let mut loaded_len = bytes.len() as u64;

        if parsed.valid_len < bytes.len() {
            warn!(
                journal = %self.path.display(),
                bytes = bytes.len() - parsed.valid_len,
                "ignoring incomplete final history line"
            );
            if exclusive {
                let file = OpenOptions::new()
                    .write(true)
                    .open(&self.path)
                    .map_err(|e| self.io_err(e))?;
                file.set_len(parsed.valid_len as u64)
                    .map_err(|e| self.io_err(e))?;
                loaded_len = parsed.valid_len as u64;
            }
        }

        debug!(
            journal = %self.path.display(),
            batches = parsed.batches.len(),
            "history loaded"
        );
        state.batches = parsed.batches;
        state.corruption = parsed.corruption;
        state.loaded_len = Some(loaded_len);
        Ok(())
    }

    fn write(&self) -> Result<WriteGuard<'_>, HistoryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let lock = FileLock::acquire(&self.lock_path, true)?;
        self.refresh(&mut state, true)?;
        Ok(WriteGuard {
            store: self,
            state,
            _lock: lock,
        })
    }

    /// Runs `f` against an up-to-date snapshot of the history.
    fn read<T>(&self, f: impl FnOnce(&State) -> Result<T, HistoryError>) -> Result<T, HistoryError> {
        if !mover::exists(&self.path) {
            let state = State::default();
            return f(&state);
        }
        // Lock order is always the RwLock first, then the file lock.
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let _lock = FileLock::acquire(&self.lock_path, false)?;
            let len = fs::metadata(&self.path).map_err(|e| self.io_err(e))?.len();
            if state.loaded_len == Some(len) {
                return f(&state);
            }
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let _lock = FileLock::acquire(&self.lock_path, false)?;
        self.refresh(&mut state, false)?;
        f(&state)
    }

    /// Starts a batch that is opened on its first recorded move.
    pub fn begin(&self, origin: BatchOrigin) -> BatchWriter<'_> {
        BatchWriter {
            store: self,
            origin,
            id: None,
            records: 0,
        }
    }

    /// Journals a whole batch at once, opened and closed under one lock.
    ///
    /// Returns the records in move order; they all carry the new batch id. An
    /// empty `moves` writes nothing and returns no records.
    ///
    /// # Errors
    ///
    /// Fails if the journal cannot be written.
    pub fn append_batch(
        &self,
        origin: BatchOrigin,
        moves: &[CompletedMove],
    ) -> Result<Vec<MoveRecord>, HistoryError> {
        if moves.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.write()?;
        guard.quarantine_if_corrupted()?;
        let batch_id = guard.state.next_id();
        let now = Utc::now();

        let mut events = vec![JournalEvent::BatchOpened {
            batch_id,
            created_at: now,
            origin,
        }];
        let records: Vec<MoveRecord> = moves.iter().map(|done| to_record(done, batch_id)).collect();
        events.extend(records.iter().map(|record| JournalEvent::Moved {
            record: record.clone(),
        }));
        events.push(JournalEvent::BatchClosed { batch_id, at: now });
        guard.append(events)?;

        info!(batch = %batch_id, moves = moves.len(), %origin, "batch recorded");
        Ok(records)
    }

    /// Lists all batches, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Corrupted`] if the journal is inconsistent.
    pub fn list_batches(&self) -> Result<Vec<BatchSummary>, HistoryError> {
        self.read(|state| match &state.corruption {
            Some(c) => Err(self.corrupted(c)),
            None => Ok(state.batches.iter().map(Batch::summary).collect()),
        })
    }

    /// Full contents of one batch.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::UnknownBatch`] if there is no such batch.
    pub fn batch(&self, id: BatchId) -> Result<Batch, HistoryError> {
        self.read(|state| {
            if let Some(c) = &state.corruption {
                return Err(self.corrupted(c));
            }
            state
                .batch(id)
                .cloned()
                .ok_or(HistoryError::UnknownBatch(id))
        })
    }

    /// Undoes `target`, or the most recent batch that is not yet reverted.
    ///
    /// Records are reversed last-first. Each problem is reported in
    /// [`UndoResult::issues`] without stopping the others. The batch is marked
    /// reverted only if every record is back at its source.
    ///
    /// # Errors
    ///
    /// Store-level failures only: corruption, an unknown id, nothing left to
    /// undo, or a batch that is still being written by this process.
    pub fn undo(&self, target: Option<BatchId>) -> Result<UndoResult, HistoryError> {
        let mut guard = self.write()?;
        guard.ensure_readable()?;

        let batch = match target {
            Some(id) => guard
                .state
                .batch(id)
                .cloned()
                .ok_or(HistoryError::UnknownBatch(id))?,
            None => guard
                .state
                .batches
                .iter()
                .rev()
                .find(|b| !b.is_reverted() && !b.records.is_empty())
                .cloned()
                .ok_or(HistoryError::NothingToUndo)?,
        };

        if self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&batch.id)
        {
            return Err(HistoryError::BatchInProgress(batch.id));
        }

        let mut result = UndoResult::new(batch.id);
        if batch.is_reverted() {
            debug!(batch = %batch.id, "batch already reverted");
            result.already_reverted = true;
            return Ok(result);
        }

        for record in batch.records.iter().rev() {
            reverse_record(record, &mut result);
        }

        if result.is_complete() {
            guard.append(vec![JournalEvent::BatchReverted {
                batch_id: batch.id,
                at: Utc::now(),
            }])?;
            info!(
                batch = %batch.id,
                restored = result.restored,
                already_restored = result.already_restored,
                "batch reverted"
            );
        } else {
            warn!(
                batch = %batch.id,
                restored = result.restored,
                issues = result.issues.len(),
                "batch partially reverted"
            );
        }
        Ok(result)
    }
}

fn reverse_record(record: &MoveRecord, result: &mut UndoResult) {
    let source_present = mover::exists(&record.source);
    if !mover::exists(&record.destination) {
        if source_present {
            result.already_restored += 1;
            result.removed_dirs += mover::remove_empty_dirs(&record.created_dirs);
        } else {
            result.issues.push(UndoIssue::Conflict {
                record: record.clone(),
                conflict: UndoConflict::DestinationMissing,
            });
        }
        return;
    }
    if source_present {
        result.issues.push(UndoIssue::Conflict {
            record: record.clone(),
            conflict: UndoConflict::SourceOccupied,
        });
        return;
    }

    if let Some(parent) = record.source.parent()
        && let Err(e) = mover::create_missing_dirs(parent)
    {
        result.issues.push(UndoIssue::Failed {
            record: record.clone(),
            reason: e.to_string(),
        });
        return;
    }

    match mover::relocate(&record.destination, &record.source) {
        Ok(_) => {
            debug!(
                from = %record.destination.display(),
                to = %record.source.display(),
                "restored"
            );
            result.restored += 1;
            result.removed_dirs += mover::remove_empty_dirs(&record.created_dirs);
        }
        Err(e) => result.issues.push(UndoIssue::Failed {
            record: record.clone(),
            reason: e.to_string(),
        }),
    }
}

fn to_record(done: &CompletedMove, batch_id: BatchId) -> MoveRecord {
    MoveRecord {
        source: done.source.clone(),
        destination: done.destination.clone(),
        timestamp: done.timestamp,
        batch_id,
        method: done.method,
        created_dirs: done.created_dirs.clone(),
    }
}

fn lock_path_for(journal: &Path) -> PathBuf {
    let mut name = journal.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Journals the moves of one run as they happen.
///
/// The batch is opened on the first [`record`](Self::record) call, so a run
/// without moves leaves nothing behind. Dropping the writer without
/// [`close`](Self::close) leaves the batch open; it is still undoable.
pub struct BatchWriter<'a> {
    store: &'a HistoryStore,
    origin: BatchOrigin,
    id: Option<BatchId>,
    records: usize,
}

impl BatchWriter<'_> {
    /// The batch id, once the first move was recorded.
    pub fn id(&self) -> Option<BatchId> {
        self.id
    }

    /// Appends a completed move to the batch.
    ///
    /// # Errors
    ///
    /// Fails if the journal cannot be written; the caller should roll the
    /// move back since it will not be undoable.
    pub fn record(&mut self, done: &CompletedMove) -> Result<MoveRecord, HistoryError> {
        let mut guard = self.store.write()?;
        let mut events = Vec::with_capacity(2);

        // Another process may have undone (or quarantined) the open batch since
        // the last move. Later moves then go into a fresh batch.
        if let Some(id) = self.id
            && guard
                .state
                .batch(id)
                .is_none_or(|b| b.closed || b.is_reverted())
        {
            warn!(batch = %id, "open batch was finished elsewhere; starting a new one");
            self.release();
            self.records = 0;
        }

        let batch_id = match self.id {
            Some(id) => id,
            None => {
                guard.quarantine_if_corrupted()?;
                let id = guard.state.next_id();
                events.push(JournalEvent::BatchOpened {
                    batch_id: id,
                    created_at: Utc::now(),
                    origin: self.origin,
                });
                id
            }
        };

        let record = to_record(done, batch_id);
        events.push(JournalEvent::Moved {
            record: record.clone(),
        });
        guard.append(events)?;

        if self.id.is_none() {
            self.id = Some(batch_id);
            self.store
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(batch_id);
            debug!(batch = %batch_id, origin = %self.origin, "batch opened");
        }
        self.records += 1;
        Ok(record)
    }

    /// Marks the batch complete. Returns its id, or `None` if nothing moved.
    ///
    /// # Errors
    ///
    /// Fails if the journal cannot be written.
    pub fn close(mut self) -> Result<Option<BatchId>, HistoryError> {
        let Some(batch_id) = self.id else {
            return Ok(None);
        };
        let mut guard = self.store.write()?;
        if guard.state.batch(batch_id).is_some_and(|b| !b.closed) {
            guard.append(vec![JournalEvent::BatchClosed {
                batch_id,
                at: Utc::now(),
            }])?;
        }
        drop(guard);
        self.release();
        info!(batch = %batch_id, moves = self.records, origin = %self.origin, "batch recorded");
        Ok(Some(batch_id))
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.store
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        }
    }
}

impl Drop for BatchWriter<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            warn!(batch = %id, moves = self.records, "batch left open");
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Setup {
        dir: TempDir,
        store: HistoryStore,
    }

    fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path().join(".organize_history.jsonl"));
        Setup { dir, store }
    }

    /// Moves `name` from the root into `sub/` for real and returns the move.
    fn do_move(root: &Path, name: &str, sub: &str) -> CompletedMove {
        let source = root.join(name);
        fs::write(&source, name).unwrap();
        let dir = root.join(sub);
        let created_dirs = mover::create_missing_dirs(&dir).unwrap();
        let destination = dir.join(name);
        fs::rename(&source, &destination).unwrap();
        CompletedMove {
            source,
            destination,
            method: MoveMethod::Rename,
            created_dirs,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_empty_store_lists_nothing() {
        let s = setup();
        assert!(s.store.list_batches().unwrap().is_empty());
        assert!(matches!(s.store.undo(None), Err(HistoryError::NothingToUndo)));
        assert!(!s.store.path().exists());
    }

    #[test]
    fn test_writer_without_moves_leaves_no_batch() {
        let s = setup();
        let writer = s.store.begin(BatchOrigin::Scan);
        assert_eq!(writer.close().unwrap(), None);
        assert!(s.store.list_batches().unwrap().is_empty());
    }

    #[test]
    fn test_batches_survive_reopen() {
        let s = setup();
        let root = s.dir.path();
        let mut writer = s.store.begin(BatchOrigin::Scan);
        writer.record(&do_move(root, "a.pdf", "文档")).unwrap();
        writer.record(&do_move(root, "b.pdf", "文档")).unwrap();
        assert_eq!(writer.close().unwrap(), Some(BatchId(1)));

        let second = s
            .store
            .append_batch(BatchOrigin::Watch, &[do_move(root, "c.csv", "数据分析")])
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].batch_id, BatchId(2));

        let reopened = HistoryStore::new(s.store.path());
        let batches = reopened.list_batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].moves, 2);
        assert!(batches[0].closed);
        assert_eq!(batches[1].origin, BatchOrigin::Watch);
        assert_eq!(batches[1].sample, vec![root.join("数据分析/c.csv")]);
    }

    #[test]
    fn test_undo_reverses_and_removes_created_dirs() {
        let s = setup();
        let root = s.dir.path();
        let mut writer = s.store.begin(BatchOrigin::Scan);
        writer.record(&do_move(root, "a.pdf", "文档/论文")).unwrap();
        writer.record(&do_move(root, "b.pdf", "文档/论文")).unwrap();
        writer.close().unwrap();

        let result = s.store.undo(None).unwrap();
        assert_eq!(result.batch_id, BatchId(1));
        assert_eq!(result.restored, 2);
        assert!(result.is_complete());
        assert_eq!(result.removed_dirs, 2);
        assert!(root.join("a.pdf").exists());
        assert!(root.join("b.pdf").exists());
        assert!(!root.join("文档").exists());

        let again = s.store.undo(Some(BatchId(1))).unwrap();
        assert!(again.already_reverted);
        assert_eq!(again.restored, 0);
        assert!(matches!(s.store.undo(None), Err(HistoryError::NothingToUndo)));
    }

    #[test]
    fn test_undo_conflicts_are_per_record() {
        let s = setup();
        let root = s.dir.path();
        let moved = [
            do_move(root, "a.pdf", "文档"),
            do_move(root, "b.pdf", "文档"),
            do_move(root, "c.pdf", "文档"),
        ];
        s.store.append_batch(BatchOrigin::Scan, &moved).unwrap();

        fs::write(root.join("a.pdf"), "squatter").unwrap();
        fs::remove_file(root.join("文档/b.pdf")).unwrap();

        let result = s.store.undo(None).unwrap();
        assert_eq!(result.restored, 1);
        assert_eq!(result.issues.len(), 2);
        let conflicts: Vec<_> = result
            .issues
            .iter()
            .map(|i| match i {
                UndoIssue::Conflict { conflict, .. } => *conflict,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        // Reverse order: b is seen before a.
        assert_eq!(
            conflicts,
            vec![UndoConflict::DestinationMissing, UndoConflict::SourceOccupied]
        );
        assert_eq!(fs::read_to_string(root.join("a.pdf")).unwrap(), "squatter");
        assert!(!s.store.list_batches().unwrap()[0].reverted);

        // Resolve the conflicts and finish the undo.
        fs::remove_file(root.join("a.pdf")).unwrap();
        fs::write(root.join("b.pdf"), "b.pdf").unwrap();
        let finish = s.store.undo(Some(BatchId(1))).unwrap();
        assert!(finish.is_complete());
        assert_eq!(finish.restored, 1);
        assert_eq!(finish.already_restored, 2);
        assert!(s.store.list_batches().unwrap()[0].reverted);
    }

    #[test]
    fn test_unknown_batch() {
        let s = setup();
        assert!(matches!(
            s.store.undo(Some(BatchId(42))),
            Err(HistoryError::UnknownBatch(BatchId(42)))
        ));
    }

    #[test]
    fn test_interrupted_batch_is_undoable() {
        let s = setup();
        let root = s.dir.path();
        {
            let mut writer = s.store.begin(BatchOrigin::Scan);
            writer.record(&do_move(root, "a.pdf", "文档")).unwrap();
            // Dropped without close, as if the run died here.
        }

        let reopened = HistoryStore::new(s.store.path());
        let batches = reopened.list_batches().unwrap();
        assert!(!batches[0].closed);
        let result = reopened.undo(None).unwrap();
        assert!(result.is_complete());
        assert!(root.join("a.pdf").exists());
    }

    #[test]
    fn test_open_batch_cannot_be_undone_in_process() {
        let s = setup();
        let root = s.dir.path();
        let mut writer = s.store.begin(BatchOrigin::Watch);
        writer.record(&do_move(root, "a.pdf", "文档")).unwrap();
        assert!(matches!(
            s.store.undo(None),
            Err(HistoryError::BatchInProgress(BatchId(1)))
        ));
        writer.close().unwrap();
        assert!(s.store.undo(None).unwrap().is_complete());
    }

    #[test]
    fn test_torn_final_line_is_ignored_and_truncated() {
        let s = setup();
        let root = s.dir.path();
        s.store
            .append_batch(BatchOrigin::Scan, &[do_move(root, "a.pdf", "文档")])
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(s.store.path()).unwrap();
        file.write_all(b"{\"event\":\"batch_op").unwrap();
        drop(file);

        let reopened = HistoryStore::new(s.store.path());
        assert_eq!(reopened.list_batches().unwrap().len(), 1);

        let next = reopened
            .append_batch(BatchOrigin::Scan, &[do_move(root, "b.pdf", "文档")])
            .unwrap();
        assert_eq!(next[0].batch_id, BatchId(2));
        let text = fs::read_to_string(s.store.path()).unwrap();
        assert!(!text.contains("batch_op\""));
        assert_eq!(HistoryStore::new(s.store.path()).list_batches().unwrap().len(), 2);
    }

    #[test]
    fn test_corruption_blocks_undo_but_not_new_batches() {
        let s = setup();
        let root = s.dir.path();
        fs::write(s.store.path(), "this is not json\n").unwrap();

        assert!(matches!(
            s.store.list_batches(),
            Err(HistoryError::Corrupted { line: 1, .. })
        ));
        assert!(matches!(s.store.undo(None), Err(HistoryError::Corrupted { .. })));

        let id = s
            .store
            .append_batch(BatchOrigin::Scan, &[do_move(root, "a.pdf", "文档")])
            .unwrap();
        assert_eq!(id[0].batch_id, BatchId(1));
        assert_eq!(s.store.list_batches().unwrap().len(), 1);

        let quarantined: Vec<_> = fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| s.store.owns(p) && *p != s.store.path() && *p != s.store.lock_path())
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn test_non_increasing_batch_ids_are_corruption() {
        let s = setup();
        let now = Utc::now().to_rfc3339();
        let journal = format!(
            "{{\"event\":\"batch_opened\",\"batch_id\":2,\"created_at\":\"{now}\",\"origin\":\"scan\"}}\n\
             {{\"event\":\"batch_opened\",\"batch_id\":2,\"created_at\":\"{now}\",\"origin\":\"scan\"}}\n"
        );
        fs::write(s.store.path(), journal).unwrap();
        assert!(matches!(
            s.store.list_batches(),
            Err(HistoryError::Corrupted { line: 2, .. })
        ));
    }

    #[test]
    fn test_other_handle_appends_are_seen() {
        let s = setup();
        let root = s.dir.path();
        let other = HistoryStore::new(s.store.path());
        assert!(s.store.list_batches().unwrap().is_empty());

        other
            .append_batch(BatchOrigin::Scan, &[do_move(root, "a.pdf", "文档")])
            .unwrap();
        assert_eq!(s.store.list_batches().unwrap().len(), 1);

        let mine = s
            .store
            .append_batch(BatchOrigin::Scan, &[do_move(root, "b.pdf", "文档")])
            .unwrap();
        assert_eq!(mine[0].batch_id, BatchId(2));
    }

    #[test]
    fn test_batch_undone_by_other_handle_while_open() {
        let s = setup();
        let root = s.dir.path();
        let other = HistoryStore::new(s.store.path());

        let mut writer = s.store.begin(BatchOrigin::Scan);
        writer.record(&do_move(root, "a.pdf", "文档")).unwrap();

        // A second process reverts the batch that is still being written.
        let undone = other.undo(None).unwrap();
        assert_eq!(undone.batch_id, BatchId(1));
        assert_eq!(undone.restored, 1);

        let record = writer.record(&do_move(root, "b.pdf", "文档")).unwrap();
        assert_eq!(record.batch_id, BatchId(2));
        assert_eq!(writer.close().unwrap(), Some(BatchId(2)));

        let batches = other.list_batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches[0].reverted);
        assert_eq!(batches[1].moves, 1);
        assert!(batches[1].closed);
        assert!(HistoryStore::new(s.store.path()).list_batches().is_ok());
    }

    #[test]
    fn test_inconsistent_event_is_not_written() {
        let s = setup();
        let root = s.dir.path();
        s.store
            .append_batch(BatchOrigin::Scan, &[do_move(root, "a.pdf", "文档")])
            .unwrap();
        let before = fs::read(s.store.path()).unwrap();

        let stray = to_record(&do_move(root, "b.pdf", "文档"), BatchId(1));
        let mut guard = s.store.write().unwrap();
        let err = guard
            .append(vec![JournalEvent::Moved { record: stray }])
            .unwrap_err();
        drop(guard);

        assert!(matches!(err, HistoryError::Rejected(_)));
        assert_eq!(fs::read(s.store.path()).unwrap(), before);
        assert_eq!(s.store.list_batches().unwrap()[0].moves, 1);
    }

    #[test]
    fn test_concurrent_undo_is_serialized() {
        let s = setup();
        let root = s.dir.path();
        let moved: Vec<_> = ["a.pdf", "b.pdf", "c.pdf", "d.pdf"]
            .iter()
            .map(|name| do_move(root, name, "文档"))
            .collect();
        s.store.append_batch(BatchOrigin::Scan, &moved).unwrap();

        let store = &s.store;
        let results: Vec<UndoResult> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| scope.spawn(move || store.undo(Some(BatchId(1))).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let full = results.iter().filter(|r| r.restored == moved.len()).count();
        let noop = results.iter().filter(|r| r.already_reverted).count();
        assert_eq!((full, noop), (1, 1));
        let text = fs::read_to_string(store.path()).unwrap();
        assert_eq!(text.matches("\"batch_reverted\"").count(), 1);
    }

    #[test]
    fn test_batch_id_parsing() {
        assert_eq!("7".parse::<BatchId>().unwrap(), BatchId(7));
        assert_eq!("#12".parse::<BatchId>().unwrap(), BatchId(12));
        assert!("x".parse::<BatchId>().is_err());
    }
}
