use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use common::{DuplicateEntry, ScanError};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::events::{EventNotifier, ScanEventKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    NotScheduled,
    Scheduled,
    InProgress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Counters and findings of one scan run.
#[derive(Clone, Debug, Serialize)]
pub struct ScanStats {
    pub start_time: SystemTime,
    pub stop_time: Option<SystemTime>,
    pub files_to_scan: usize,
    pub processed_files: usize,
    pub additions: usize,
    pub updates: usize,
    pub deletions: usize,
    pub skips: usize,
    pub skipped_directories: usize,
    pub errors: Vec<ScanError>,
    pub duplicates: Vec<DuplicateEntry>,
    /// `None` while the run is still going.
    pub outcome: Option<ScanOutcome>,
}

impl ScanStats {
    pub fn new(start_time: SystemTime) -> Self {
        Self {
            start_time,
            stop_time: None,
            files_to_scan: 0,
            processed_files: 0,
            additions: 0,
            updates: 0,
            deletions: 0,
            skips: 0,
            skipped_directories: 0,
            errors: Vec::new(),
            duplicates: Vec::new(),
            outcome: None,
        }
    }

    pub fn progress(&self) -> f64 {
        if self.files_to_scan == 0 {
            return 0.0;
        }
        (self.processed_files as f64 / self.files_to_scan as f64).clamp(0.0, 1.0)
    }

    /// Files present in the catalog once the run is over.
    pub fn nb_files(&self) -> usize {
        self.skips + self.additions + self.updates
    }

    pub fn elapsed(&self) -> Duration {
        let end = self.stop_time.unwrap_or_else(SystemTime::now);
        end.duration_since(self.start_time).unwrap_or_default()
    }
}

/// Read-only snapshot handed to status readers and event subscribers.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ScanStatus {
    pub state: ScanState,
    pub next_scheduled: Option<SystemTime>,
    pub in_progress: Option<Arc<ScanStats>>,
    pub last_complete: Option<Arc<ScanStats>>,
}

impl ScanStatus {
    pub fn last_outcome(&self) -> Option<ScanOutcome> {
        self.last_complete
            .as_ref()
            .and_then(|stats| stats.outcome.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    Added,
    Updated,
    Unchanged,
    Failed(ScanError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanRejected {
    AlreadyRunning,
    ShuttingDown,
}

impl std::fmt::Display for ScanRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanRejected::AlreadyRunning => write!(f, "a scan is already in progress"),
            ScanRejected::ShuttingDown => write!(f, "the scanner is shutting down"),
        }
    }
}

impl std::error::Error for ScanRejected {}

struct Inner {
    state: ScanState,
    next_scheduled: Option<SystemTime>,
    in_progress: Option<Arc<ScanStats>>,
    last_complete: Option<Arc<ScanStats>>,
    last_progress: Option<Instant>,
}

impl Inner {
    fn snapshot(&self) -> ScanStatus {
        ScanStatus {
            state: self.state,
            next_scheduled: self.next_scheduled,
            in_progress: self.in_progress.clone(),
            last_complete: self.last_complete.clone(),
        }
    }
}

/// Scan state machine. The engine is the only writer; every mutation publishes
/// a fresh stats snapshot so readers never see a half-applied update.
pub struct ScanLifecycle {
    inner: RwLock<Inner>,
    notifier: EventNotifier,
    progress_interval: Duration,
}

impl ScanLifecycle {
    pub fn new(notifier: EventNotifier, progress_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: ScanState::NotScheduled,
                next_scheduled: None,
                in_progress: None,
                last_complete: None,
                last_progress: None,
            }),
            notifier,
            progress_interval,
        }
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    pub fn status(&self) -> ScanStatus {
        self.inner.read().snapshot()
    }

    pub fn state(&self) -> ScanState {
        self.inner.read().state
    }

    pub fn next_scheduled(&self) -> Option<SystemTime> {
        self.inner.read().next_scheduled
    }

    pub fn last_complete(&self) -> Option<Arc<ScanStats>> {
        self.inner.read().last_complete.clone()
    }

    /// Arms the next run. Ignored while a scan is running; completion re-arms it.
    pub fn schedule_at(&self, at: SystemTime) -> bool {
        let status = {
            let mut guard = self.inner.write();
            if guard.state == ScanState::InProgress {
                return false;
            }
            guard.state = ScanState::Scheduled;
            guard.next_scheduled = Some(at);
            guard.snapshot()
        };
        debug!("Scan scheduled at {:?}", at);
        self.notifier.emit(ScanEventKind::Scheduled, status);
        true
    }

    pub fn begin(&self) -> Result<(), ScanRejected> {
        let status = {
            let mut guard = self.inner.write();
            if guard.state == ScanState::InProgress {
                return Err(ScanRejected::AlreadyRunning);
            }
            guard.state = ScanState::InProgress;
            guard.next_scheduled = None;
            guard.in_progress = Some(Arc::new(ScanStats::new(SystemTime::now())));
            guard.last_progress = None;
            guard.snapshot()
        };
        info!("Scan started");
        self.notifier.emit(ScanEventKind::Started, status);
        Ok(())
    }

    pub fn set_files_to_scan(&self, count: usize) {
        self.update(|stats| stats.files_to_scan = count.max(stats.processed_files));
    }

    pub fn file_processed(&self, outcome: FileOutcome) {
        let status = {
            let mut guard = self.inner.write();
            let stats = match guard.in_progress.as_mut() {
                Some(stats) => Arc::make_mut(stats),
                None => return,
            };
            stats.processed_files += 1;
            if stats.processed_files > stats.files_to_scan {
                stats.files_to_scan = stats.processed_files;
            }
            match outcome {
                FileOutcome::Added => stats.additions += 1,
                FileOutcome::Updated => stats.updates += 1,
                FileOutcome::Unchanged => stats.skips += 1,
                FileOutcome::Failed(error) => stats.errors.push(error),
            }
            let last_file = stats.processed_files == stats.files_to_scan;

            let now = Instant::now();
            let due = guard
                .last_progress
                .map(|at| now.duration_since(at) >= self.progress_interval)
                .unwrap_or(true);
            if !(due || last_file) {
                return;
            }
            guard.last_progress = Some(now);
            guard.snapshot()
        };
        self.notifier.emit(ScanEventKind::Progress, status);
    }

    pub fn skipped_directory(&self) {
        self.update(|stats| stats.skipped_directories += 1);
    }

    pub fn record_duplicates(&self, duplicates: Vec<DuplicateEntry>) {
        self.update(|stats| stats.duplicates = duplicates);
    }

    pub fn record_deletions(&self, count: usize) {
        self.update(|stats| stats.deletions += count);
    }

    /// Ends the run, keeping its stats as the last complete scan. A failed run
    /// never re-arms the schedule.
    pub fn complete(
        &self,
        outcome: ScanOutcome,
        next: Option<SystemTime>,
    ) -> Option<Arc<ScanStats>> {
        let (status, finished) = {
            let mut guard = self.inner.write();
            if guard.state != ScanState::InProgress {
                return None;
            }
            let mut stats = guard
                .in_progress
                .take()
                .unwrap_or_else(|| Arc::new(ScanStats::new(SystemTime::now())));
            {
                let stats = Arc::make_mut(&mut stats);
                stats.stop_time = Some(SystemTime::now());
                stats.outcome = Some(outcome.clone());
            }
            let next = match outcome {
                ScanOutcome::Failed(_) => None,
                _ => next,
            };
            guard.state = if next.is_some() {
                ScanState::Scheduled
            } else {
                ScanState::NotScheduled
            };
            guard.next_scheduled = next;
            guard.last_complete = Some(Arc::clone(&stats));
            (guard.snapshot(), stats)
        };
        info!(
            "Scan finished ({:?}): {} files, {} errors, {} duplicates",
            outcome,
            finished.nb_files(),
            finished.errors.len(),
            finished.duplicates.len()
        );
        self.notifier.emit(ScanEventKind::Completed, status);
        Some(finished)
    }

    fn update<F>(&self, apply: F)
    where
        F: FnOnce(&mut ScanStats),
    {
        let mut guard = self.inner.write();
        if let Some(stats) = guard.in_progress.as_mut() {
            apply(Arc::make_mut(stats));
        }
    }
}
