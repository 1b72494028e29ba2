//! Watch mode: debounce filesystem notifications until files are stable.
//!
//! Each watched path moves through `Pending -> Stable -> Processed`. A path
//! becomes stable once no notification arrived for the quiet period and two
//! size probes `recheck_interval` apart agree. Stable paths are handed to a
//! worker thread one at a time while the scheduler keeps tracking the rest.
//!
//! [`Debouncer`] is the pure state machine; time and the size probe are passed
//! in so it can be driven deterministically. [`WatchScheduler`] runs it on a
//! thread fed by a channel of [`WatchEvent`]s, which come from `notify` or
//! from [`WatchHandle::inject`].

use crate::error::Error;
use crate::history::{BatchId, MoveRecord};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Debounce timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Time without notifications before the first size probe.
    pub quiet_period: Duration,
    /// Gap between size probes.
    pub recheck_interval: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(2000),
            recheck_interval: Duration::from_millis(500),
        }
    }
}

/// A filesystem change relevant to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Created or written to.
    Changed(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// Observable phase of a tracked path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Stable,
    Processed,
}

#[derive(Debug, Clone)]
enum Entry {
    Pending {
        first_seen: Instant,
        last_event: Instant,
        due: Instant,
        last_size: Option<u64>,
    },
    /// Handed to the worker. `cancelled` records a removal seen meanwhile.
    Stable { cancelled: bool },
    Processed,
}

/// Per-path debounce state machine.
#[derive(Debug)]
pub struct Debouncer {
    config: DebounceConfig,
    entries: HashMap<PathBuf, Entry>,
}

impl Debouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Records a change notification for `path` at `now`.
    ///
    /// New and processed paths enter `Pending`; a pending path restarts its
    /// quiet timer and forgets its last probed size. Stable paths are being
    /// handled and ignore notifications.
    pub fn observe(&mut self, path: &Path, now: Instant) {
        let due = now + self.config.quiet_period;
        match self.entries.get_mut(path) {
            Some(Entry::Pending {
                last_event,
                due: entry_due,
                last_size,
                ..
            }) => {
                *last_event = now;
                *entry_due = due;
                *last_size = None;
            }
            Some(Entry::Stable { .. }) => {}
            Some(Entry::Processed) | None => {
                trace!(path = %path.display(), "pending");
                self.entries.insert(
                    path.to_path_buf(),
                    Entry::Pending {
                        first_seen: now,
                        last_event: now,
                        due,
                        last_size: None,
                    },
                );
            }
        }
    }

    /// Drops a pending or processed path. Returns true if it was pending.
    ///
    /// A stable path is still being handled; it is dropped once
    /// [`mark_processed`](Self::mark_processed) reports it done.
    pub fn cancel(&mut self, path: &Path) -> bool {
        match self.entries.get_mut(path) {
            Some(Entry::Pending { .. }) => {
                self.entries.remove(path);
                debug!(path = %path.display(), "pending path cancelled");
                true
            }
            Some(Entry::Processed) => {
                self.entries.remove(path);
                false
            }
            Some(Entry::Stable { cancelled }) => {
                *cancelled = true;
                false
            }
            None => false,
        }
    }

    /// Probes every pending path whose timer expired and returns those that
    /// just became stable.
    ///
    /// `probe` returns the current size, or `None` if the path is gone or is
    /// not a regular file, in which case the entry is dropped.
    pub fn poll(
        &mut self,
        now: Instant,
        mut probe: impl FnMut(&Path) -> Option<u64>,
    ) -> Vec<PathBuf> {
        let mut stable = Vec::new();
        let mut vanished = Vec::new();

        for (path, entry) in self.entries.iter_mut() {
            let Entry::Pending {
                first_seen,
                due,
                last_size,
                ..
            } = entry
            else {
                continue;
            };
            if *due > now {
                continue;
            }
            match probe(path) {
                None => vanished.push(path.clone()),
                Some(size) if *last_size == Some(size) => {
                    debug!(
                        path = %path.display(),
                        size,
                        waited_ms = now.duration_since(*first_seen).as_millis() as u64,
                        "stable"
                    );
                    stable.push(path.clone());
                    *entry = Entry::Stable { cancelled: false };
                }
                Some(size) => {
                    trace!(path = %path.display(), size, "size probe");
                    *last_size = Some(size);
                    *due = now + self.config.recheck_interval;
                }
            }
        }

        for path in vanished {
            trace!(path = %path.display(), "vanished while pending");
            self.entries.remove(&path);
        }
        stable.sort();
        stable
    }

    /// Moves a stable path to `Processed`, or forgets it if it was cancelled
    /// while being handled.
    pub fn mark_processed(&mut self, path: &Path) {
        match self.entries.get(path) {
            Some(Entry::Stable { cancelled: true }) => {
                self.entries.remove(path);
            }
            Some(Entry::Stable { cancelled: false }) => {
                self.entries.insert(path.to_path_buf(), Entry::Processed);
            }
            _ => {}
        }
    }

    /// Number of paths in any phase.
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Pending { due, .. } => Some(*due),
                _ => None,
            })
            .min()
    }

    pub fn phase(&self, path: &Path) -> Option<Phase> {
        self.entries.get(path).map(|entry| match entry {
            Entry::Pending { .. } => Phase::Pending,
            Entry::Stable { .. } => Phase::Stable,
            Entry::Processed => Phase::Processed,
        })
    }

    /// Last notification time of a pending path.
    pub fn last_event(&self, path: &Path) -> Option<Instant> {
        match self.entries.get(path) {
            Some(Entry::Pending { last_event, .. }) => Some(*last_event),
            _ => None,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Pending { .. }))
            .count()
    }
}

/// What happened to one stable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Moved and journaled as its own batch.
    Organized { batch_id: BatchId, record: MoveRecord },
    AlreadyOrganized(PathBuf),
    /// No rule matched and unclassified files are left in place.
    Unclassified(PathBuf),
    /// Filtered out or gone by the time it was handled.
    Skipped(PathBuf),
    Failed { path: PathBuf, error: String },
}

/// Counters returned when a watch stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub organized: usize,
    pub already_organized: usize,
    pub unclassified: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl WatchStats {
    fn count(&mut self, outcome: &WatchOutcome) {
        match outcome {
            WatchOutcome::Organized { .. } => self.organized += 1,
            WatchOutcome::AlreadyOrganized(_) => self.already_organized += 1,
            WatchOutcome::Unclassified(_) => self.unclassified += 1,
            WatchOutcome::Skipped(_) => self.skipped += 1,
            WatchOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Receives stable files from the scheduler.
pub trait StableFileHandler: Send + Sync + 'static {
    /// Whether notifications for `path` should be tracked at all.
    fn accepts(&self, _path: &Path) -> bool {
        true
    }

    /// Organizes one stable file.
    fn handle(&self, path: &Path) -> WatchOutcome;
}

#[derive(Debug)]
enum Signal {
    Fs(WatchEvent),
    Processed(PathBuf),
    Shutdown,
}

/// Cloneable way to request a stop from another thread (e.g. a signal handler).
#[derive(Debug, Clone)]
pub struct WatchStopper {
    signals: Sender<Signal>,
}

impl WatchStopper {
    pub fn request_stop(&self) {
        let _ = self.signals.send(Signal::Shutdown);
    }
}

/// A running watch.
pub struct WatchHandle {
    signals: Sender<Signal>,
    outcomes: Receiver<WatchOutcome>,
    watcher: Option<RecommendedWatcher>,
    scheduler: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<WatchStats>>,
}

impl WatchHandle {
    /// Per-file results, in processing order.
    pub fn outcomes(&self) -> &Receiver<WatchOutcome> {
        &self.outcomes
    }

    /// Feeds an event as if it came from the filesystem.
    pub fn inject(&self, event: WatchEvent) {
        let _ = self.signals.send(Signal::Fs(event));
    }

    pub fn stopper(&self) -> WatchStopper {
        WatchStopper {
            signals: self.signals.clone(),
        }
    }

    /// Stops accepting notifications, lets the file in flight finish and
    /// joins both threads.
    pub fn stop(mut self) -> WatchStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> WatchStats {
        // Dropping the watcher stops new notifications.
        self.watcher.take();
        let _ = self.signals.send(Signal::Shutdown);
        if let Some(scheduler) = self.scheduler.take()
            && scheduler.join().is_err()
        {
            warn!("watch scheduler thread panicked");
        }
        let stats = match self.worker.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                warn!("watch worker thread panicked");
                WatchStats::default()
            }
            None => WatchStats::default(),
        };
        info!(
            organized = stats.organized,
            failed = stats.failed,
            "watch stopped"
        );
        stats
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if self.scheduler.is_some() {
            self.shutdown();
        }
    }
}

/// Runs a [`Debouncer`] on a background thread and forwards stable files to
/// a [`StableFileHandler`] on a worker thread.
pub struct WatchScheduler;

impl WatchScheduler {
    /// Starts the scheduler without attaching a filesystem watcher.
    ///
    /// # Errors
    ///
    /// Fails if a thread cannot be spawned.
    pub fn spawn<H: StableFileHandler>(
        config: DebounceConfig,
        handler: Arc<H>,
    ) -> Result<WatchHandle, Error> {
        let (signal_tx, signal_rx) = mpsc::channel::<Signal>();
        let (work_tx, work_rx) = mpsc::channel::<PathBuf>();
        let (outcome_tx, outcome_rx) = mpsc::channel::<WatchOutcome>();

        let worker_handler = Arc::clone(&handler);
        let processed_tx = signal_tx.clone();
        let worker = thread::Builder::new()
            .name("dltidy-worker".into())
            .spawn(move || {
                let mut stats = WatchStats::default();
                for path in work_rx {
                    let outcome = worker_handler.handle(&path);
                    stats.count(&outcome);
                    let _ = processed_tx.send(Signal::Processed(path));
                    let _ = outcome_tx.send(outcome);
                }
                stats
            })
            .map_err(Error::Thread)?;

        let scheduler = thread::Builder::new()
            .name("dltidy-debounce".into())
            .spawn(move || run_scheduler(config, handler, signal_rx, work_tx))
            .map_err(Error::Thread)?;

        Ok(WatchHandle {
            signals: signal_tx,
            outcomes: outcome_rx,
            watcher: None,
            scheduler: Some(scheduler),
            worker: Some(worker),
        })
    }

    /// Starts the scheduler and a `notify` watcher on `root`.
    ///
    /// # Errors
    ///
    /// Fails if the watcher cannot be created or `root` cannot be watched.
    pub fn watch<H: StableFileHandler>(
        root: &Path,
        recursive: bool,
        config: DebounceConfig,
        handler: Arc<H>,
    ) -> Result<WatchHandle, Error> {
        let mut handle = Self::spawn(config, handler)?;
        let tx = handle.signals.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for change in translate(event) {
                        if tx.send(Signal::Fs(change)).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => warn!(error = %err, "filesystem watch error"),
            },
            notify::Config::default(),
        )?;
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode)?;
        info!(root = %root.display(), recursive, "watching");
        handle.watcher = Some(watcher);
        Ok(handle)
    }
}

fn run_scheduler<H: StableFileHandler>(
    config: DebounceConfig,
    handler: Arc<H>,
    signals: Receiver<Signal>,
    work: Sender<PathBuf>,
) {
    let mut debouncer = Debouncer::new(config);
    loop {
        let received = match debouncer.next_deadline() {
            Some(deadline) => {
                signals.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => signals.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Signal::Fs(event)) => apply_event(&mut debouncer, handler.as_ref(), event),
            Ok(Signal::Processed(path)) => {
                debouncer.mark_processed(&path);
                // Organized files are usually gone by now.
                if probe_size(&path).is_none() {
                    debouncer.cancel(&path);
                }
            }
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        for path in debouncer.poll(Instant::now(), probe_size) {
            if work.send(path).is_err() {
                return;
            }
        }
    }
    debug!(pending = debouncer.pending_count(), "scheduler exiting");
}

fn apply_event<H: StableFileHandler + ?Sized>(
    debouncer: &mut Debouncer,
    handler: &H,
    event: WatchEvent,
) {
    let now = Instant::now();
    match event {
        WatchEvent::Changed(path) => {
            if handler.accepts(&path) && !path.is_dir() {
                debouncer.observe(&path, now);
            }
        }
        WatchEvent::Removed(path) => {
            debouncer.cancel(&path);
        }
        WatchEvent::Renamed { from, to } => {
            debouncer.cancel(&from);
            if handler.accepts(&to) && !to.is_dir() {
                debouncer.observe(&to, now);
            }
        }
    }
}

fn probe_size(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}

/// Maps a `notify` event onto zero or more [`WatchEvent`]s.
pub fn translate(event: Event) -> Vec<WatchEvent> {
    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Metadata(_) | ModifyKind::Any)
        | EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            paths.into_iter().map(WatchEvent::Changed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut iter = paths.into_iter();
            match (iter.next(), iter.next()) {
                (Some(from), Some(to)) => vec![WatchEvent::Renamed { from, to }],
                (Some(from), None) => vec![WatchEvent::Removed(from)],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(WatchEvent::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.into_iter().map(WatchEvent::Changed).collect()
        }
        // Platforms that cannot tell the two ends of a rename apart.
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .into_iter()
            .map(|p| {
                if p.exists() {
                    WatchEvent::Changed(p)
                } else {
                    WatchEvent::Removed(p)
                }
            })
            .collect(),
        EventKind::Remove(_) => paths.into_iter().map(WatchEvent::Removed).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::cell::Cell;
    use std::sync::Mutex;

    fn config() -> DebounceConfig {
        DebounceConfig {
            quiet_period: Duration::from_millis(2000),
            recheck_interval: Duration::from_millis(500),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_stable_after_quiet_period_and_two_equal_probes() {
        let mut d = Debouncer::new(config());
        let t0 = Instant::now();
        let p = Path::new("/dl/a.pdf");
        d.observe(p, t0);
        assert_eq!(d.phase(p), Some(Phase::Pending));
        assert_eq!(d.next_deadline(), Some(t0 + ms(2000)));

        // Quiet period not over yet.
        assert!(d.poll(t0 + ms(1999), |_| Some(10)).is_empty());
        // First probe only records the size.
        assert!(d.poll(t0 + ms(2000), |_| Some(10)).is_empty());
        assert_eq!(d.next_deadline(), Some(t0 + ms(2500)));
        // Second probe agrees.
        assert_eq!(d.poll(t0 + ms(2500), |_| Some(10)), vec![p.to_path_buf()]);
        assert_eq!(d.phase(p), Some(Phase::Stable));
        assert_eq!(d.next_deadline(), None);

        d.mark_processed(p);
        assert_eq!(d.phase(p), Some(Phase::Processed));
    }

    #[test]
    fn test_growing_file_stays_pending() {
        let mut d = Debouncer::new(config());
        let t0 = Instant::now();
        let p = Path::new("/dl/big.iso");
        d.observe(p, t0);

        let size = Cell::new(100);
        let probe = |_: &Path| {
            let s = size.get();
            size.set(s + 100);
            Some(s)
        };
        assert!(d.poll(t0 + ms(2000), probe).is_empty());
        assert!(d.poll(t0 + ms(2500), probe).is_empty());
        assert!(d.poll(t0 + ms(3000), probe).is_empty());
        assert_eq!(d.phase(p), Some(Phase::Pending));

        // Growth stops.
        assert!(d.poll(t0 + ms(3500), |_| Some(999)).is_empty());
        assert_eq!(d.poll(t0 + ms(4000), |_| Some(999)).len(), 1);
    }

    #[test]
    fn test_chunked_download_classified_once_after_last_chunk() {
        let mut d = Debouncer::new(config());
        let t0 = Instant::now();
        let p = Path::new("/dl/movie.mp4");
        let mut stable_at = Vec::new();

        // Three chunks, one notification each, 1.5s apart.
        let chunks = [(0, 1_000), (1500, 2_000), (3000, 3_000)];
        let mut current = 0;
        let mut now = t0;
        let mut next_chunk = 0;
        while now <= t0 + ms(10_000) {
            if next_chunk < chunks.len() && now >= t0 + ms(chunks[next_chunk].0) {
                current = chunks[next_chunk].1;
                d.observe(p, now);
                next_chunk += 1;
            }
            for path in d.poll(now, |_| Some(current)) {
                stable_at.push((path, now, current));
                d.mark_processed(p);
            }
            now += ms(100);
        }

        assert_eq!(stable_at.len(), 1);
        let (_, when, size) = &stable_at[0];
        assert_eq!(*size, 3_000);
        assert!(*when >= t0 + ms(3000 + 2000 + 500));
    }

    #[test]
    fn test_notification_resets_timer_and_size() {
        let mut d = Debouncer::new(config());
        let t0 = Instant::now();
        let p = Path::new("/dl/a.zip");
        d.observe(p, t0);
        assert!(d.poll(t0 + ms(2000), |_| Some(5)).is_empty());

        d.observe(p, t0 + ms(2100));
        assert_eq!(d.last_event(p), Some(t0 + ms(2100)));
        // Same size as before, but the earlier probe was forgotten.
        assert!(d.poll(t0 + ms(4100), |_| Some(5)).is_empty());
        assert_eq!(d.poll(t0 + ms(4600), |_| Some(5)).len(), 1);
    }

    #[test]
    fn test_independent_timers_per_path() {
        let mut d = Debouncer::new(config());
        let t0 = Instant::now();
        let slow = Path::new("/dl/slow.bin");
        let quick = Path::new("/dl/quick.txt");
        d.observe(slow, t0);
        d.observe(quick, t0);

        let mut slow_size = 0;
        let mut ready = Vec::new();
        let mut now = t0;
        while now <= t0 + ms(3000) {
            if now < t0 + ms(2800) {
                slow_size += 1;
            }
            ready.extend(d.poll(now, |p| Some(if p == slow { slow_size } else { 1 })));
            now += ms(250);
        }
        assert_eq!(ready, vec![quick.to_path_buf()]);
        assert_eq!(d.phase(slow), Some(Phase::Pending));
    }

    #[test]
    fn test_cancel_and_vanish() {
        let mut d = Debouncer::new(config());
        let t0 = Instant::now();
        let a = Path::new("/dl/a");
        let b = Path::new("/dl/b");
        d.observe(a, t0);
        d.observe(b, t0);

        assert!(d.cancel(a));
        assert_eq!(d.phase(a), None);
        assert!(!d.cancel(a));

        assert!(d.poll(t0 + ms(2000), |_| None).is_empty());
        assert_eq!(d.phase(b), None);
        assert_eq!(d.next_deadline(), None);
    }

    #[test]
    fn test_stable_path_ignores_events_until_processed() {
        let mut d = Debouncer::new(config());
        let t0 = Instant::now();
        let p = Path::new("/dl/a.pdf");
        d.observe(p, t0);
        d.poll(t0 + ms(2000), |_| Some(1));
        d.poll(t0 + ms(2500), |_| Some(1));

        d.observe(p, t0 + ms(2600));
        assert!(!d.cancel(p));
        assert_eq!(d.phase(p), Some(Phase::Stable));

        d.mark_processed(p);
        // A new file with the same name starts over.
        d.observe(p, t0 + ms(3000));
        assert_eq!(d.phase(p), Some(Phase::Pending));
    }

    #[test]
    fn test_files_moved_away_while_handled_are_forgotten() {
        let mut d = Debouncer::new(config());
        let t0 = Instant::now();
        let paths: Vec<PathBuf> = (0..1000)
            .map(|i| PathBuf::from(format!("/dl/file-{i}.pdf")))
            .collect();
        for p in &paths {
            d.observe(p, t0);
        }
        d.poll(t0 + ms(2000), |_| Some(1));
        assert_eq!(d.poll(t0 + ms(2500), |_| Some(1)).len(), paths.len());

        // The worker moves each file, so its removal shows up before it is
        // reported done.
        for p in &paths {
            assert!(!d.cancel(p));
            d.mark_processed(p);
        }
        assert_eq!(d.tracked_count(), 0);

        // Removal reported after processing also forgets the path.
        let late = Path::new("/dl/late.pdf");
        d.observe(late, t0);
        d.poll(t0 + ms(2000), |_| Some(1));
        d.poll(t0 + ms(2500), |_| Some(1));
        d.mark_processed(late);
        assert_eq!(d.phase(late), Some(Phase::Processed));
        d.cancel(late);
        assert_eq!(d.tracked_count(), 0);
    }

    #[test]
    fn test_translate_notify_events() {
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path("/r/a".into());
        assert_eq!(translate(created), vec![WatchEvent::Changed("/r/a".into())]);

        let written = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("/r/a".into());
        assert_eq!(translate(written), vec![WatchEvent::Changed("/r/a".into())]);

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/r/a.part".into())
            .add_path("/r/a.zip".into());
        assert_eq!(
            translate(renamed),
            vec![WatchEvent::Renamed {
                from: "/r/a.part".into(),
                to: "/r/a.zip".into()
            }]
        );

        let moved_out = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path("/r/a".into());
        assert_eq!(translate(moved_out), vec![WatchEvent::Removed("/r/a".into())]);

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path("/r/a".into());
        assert_eq!(translate(removed), vec![WatchEvent::Removed("/r/a".into())]);

        let read = Event::new(EventKind::Access(AccessKind::Read)).add_path("/r/a".into());
        assert!(translate(read).is_empty());
    }

    struct Recorder {
        seen: Mutex<Vec<PathBuf>>,
    }

    impl StableFileHandler for Recorder {
        fn accepts(&self, path: &Path) -> bool {
            path.extension().is_some_and(|e| e == "txt")
        }

        fn handle(&self, path: &Path) -> WatchOutcome {
            self.seen.lock().unwrap().push(path.to_path_buf());
            WatchOutcome::Skipped(path.to_path_buf())
        }
    }

    #[test]
    fn test_scheduler_delivers_stable_files_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let txt = dir.path().join("note.txt");
        let other = dir.path().join("ignored.bin");
        fs::write(&txt, "hello").unwrap();
        fs::write(&other, "x").unwrap();

        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let handle = WatchScheduler::spawn(
            DebounceConfig {
                quiet_period: ms(30),
                recheck_interval: ms(20),
            },
            Arc::clone(&handler),
        )
        .unwrap();

        handle.inject(WatchEvent::Changed(txt.clone()));
        handle.inject(WatchEvent::Changed(other.clone()));
        handle.inject(WatchEvent::Changed(txt.clone()));

        let outcome = handle.outcomes().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, WatchOutcome::Skipped(txt.clone()));
        assert!(
            handle
                .outcomes()
                .recv_timeout(Duration::from_millis(200))
                .is_err()
        );

        let stats = handle.stop();
        assert_eq!(stats.skipped, 1);
        assert_eq!(*handler.seen.lock().unwrap(), vec![txt]);
    }
}
