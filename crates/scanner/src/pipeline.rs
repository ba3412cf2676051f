use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{path_key, Fingerprint, ScanError, ScanErrorKind};
use library::{
    classify, find_duplicates_where, fingerprint_file, Catalog, FileChange, LibraryError,
    WalkEntry, Walker,
};
use metadata::TrackMetadata;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::config::ScanSettings;
use crate::state::{FileOutcome, ScanLifecycle, ScanOutcome};

const WALK_BUFFER: usize = 256;

/// Blocking threads one service may hold for file probes, counting probes
/// abandoned after a timeout. Files beyond the limit fail without being read.
pub(crate) const MAX_PROBE_THREADS: usize = 4;

/// Everything one run needs, detached from the service.
pub(crate) struct ScanJob {
    pub catalog: Catalog,
    pub settings: ScanSettings,
    pub lifecycle: Arc<ScanLifecycle>,
    pub cancel: Arc<AtomicBool>,
    pub probes: Arc<Semaphore>,
}

#[derive(Debug)]
pub enum EngineError {
    Catalog(LibraryError),
    Join(JoinError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Catalog(err) => write!(f, "catalog error: {}", err),
            EngineError::Join(err) => write!(f, "worker error: {}", err),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LibraryError> for EngineError {
    fn from(err: LibraryError) -> Self {
        EngineError::Catalog(err)
    }
}

impl From<JoinError> for EngineError {
    fn from(err: JoinError) -> Self {
        EngineError::Join(err)
    }
}

enum Probe {
    Unchanged,
    Extracted {
        fingerprint: Fingerprint,
        metadata: TrackMetadata,
    },
    Failed(ScanError),
}

pub(crate) async fn run_scan(job: &ScanJob) -> ScanOutcome {
    match scan(job).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!("Scan failed: {}", err);
            ScanOutcome::Failed(err.to_string())
        }
    }
}

async fn scan(job: &ScanJob) -> Result<ScanOutcome, EngineError> {
    let settings = &job.settings;
    let walker = Walker::new(&settings.roots, &settings.extensions, settings.recursive);

    let counter = walker.clone();
    let total = tokio::task::spawn_blocking(move || counter.count_files()).await?;
    job.lifecycle.set_files_to_scan(total);
    info!(
        "Scanning {} files under {} roots",
        total,
        walker.roots().len()
    );

    let (tx, mut rx) = mpsc::channel::<WalkEntry>(WALK_BUFFER);
    let walk_cancel = Arc::clone(&job.cancel);
    let producer = tokio::task::spawn_blocking(move || {
        for entry in walker.entries() {
            if walk_cancel.load(Ordering::Relaxed) {
                break;
            }
            if tx.blocking_send(entry).is_err() {
                break;
            }
        }
    });

    let mut observed: HashSet<String> = HashSet::new();
    while let Some(entry) = rx.recv().await {
        if job.cancel.load(Ordering::Relaxed) {
            break;
        }
        match entry {
            WalkEntry::Skipped { path, error } => {
                debug!("Skipped {:?}: {}", path, error);
                job.lifecycle.skipped_directory();
            }
            WalkEntry::File(path) => {
                let key = path_key(&path);
                observed.insert(key.clone());
                let outcome = process_file(job, path, key).await?;
                job.lifecycle.file_processed(outcome);
            }
        }
    }
    drop(rx);
    producer.await?;

    if job.cancel.load(Ordering::Relaxed) {
        info!("Scan cancelled after {} files", observed.len());
        return Ok(ScanOutcome::Cancelled);
    }

    // Rows of files gone since the last run are still cataloged during the sweep.
    let observed = Arc::new(observed);
    let catalog = job.catalog.clone();
    let seen = Arc::clone(&observed);
    let duplicates = tokio::task::spawn_blocking(move || {
        find_duplicates_where(&catalog, |path| seen.contains(path))
    })
    .await??;
    job.lifecycle.record_duplicates(duplicates);

    let catalog = job.catalog.clone();
    let removed = tokio::task::spawn_blocking(move || catalog.remove_missing(&observed)).await??;
    job.lifecycle.record_deletions(removed);

    Ok(ScanOutcome::Completed)
}

async fn process_file(
    job: &ScanJob,
    path: PathBuf,
    key: String,
) -> Result<FileOutcome, EngineError> {
    let probe = match Arc::clone(&job.probes).try_acquire_owned() {
        Ok(permit) => {
            let catalog = job.catalog.clone();
            let probe_key = key.clone();
            let probe_path = path.clone();
            let probe = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                probe_file(&catalog, &probe_path, &probe_key)
            });

            let timeout = job.settings.file_timeout;
            match tokio::time::timeout(timeout, probe).await {
                Ok(joined) => settle_probe(joined, &key)?,
                Err(_) => {
                    warn!("Gave up on {:?} after {}s", path, timeout.as_secs());
                    Probe::Failed(read_error(
                        &key,
                        format!("timed out after {}s", timeout.as_secs()),
                    ))
                }
            }
        }
        Err(_) => {
            warn!("No probe thread free for {:?}", path);
            Probe::Failed(read_error(&key, "too many stalled reads".to_string()))
        }
    };

    let catalog = job.catalog.clone();
    match probe {
        Probe::Unchanged => Ok(FileOutcome::Unchanged),
        Probe::Extracted {
            fingerprint,
            metadata,
        } => {
            let outcome = tokio::task::spawn_blocking(move || {
                catalog.upsert_track(&key, &fingerprint, &metadata)
            })
            .await??;
            Ok(match outcome {
                library::UpsertOutcome::Added => FileOutcome::Added,
                library::UpsertOutcome::Updated => FileOutcome::Updated,
            })
        }
        Probe::Failed(error) => {
            warn!("{} - {}", error.path, error.kind);
            // A failed file must not keep a stale row.
            tokio::task::spawn_blocking(move || catalog.remove_track(&key)).await??;
            Ok(FileOutcome::Failed(error))
        }
    }
}

/// A panicking probe fails its file only. Catalog errors still end the run.
fn settle_probe(
    joined: Result<Result<Probe, LibraryError>, JoinError>,
    key: &str,
) -> Result<Probe, EngineError> {
    match joined {
        Ok(probe) => Ok(probe?),
        Err(err) if err.is_panic() => {
            let detail = panic_message(err);
            warn!("Probe of {} panicked: {}", key, detail);
            Ok(Probe::Failed(ScanError {
                path: key.to_string(),
                kind: ScanErrorKind::CannotParseFile,
                system_error: Some(detail),
            }))
        }
        Err(err) => Err(err.into()),
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = match err.try_into_panic() {
        Ok(payload) => payload,
        Err(err) => return err.to_string(),
    };
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("panicked: {}", message);
    }
    match payload.downcast_ref::<String>() {
        Some(message) => format!("panicked: {}", message),
        None => "panicked".to_string(),
    }
}

fn read_error(key: &str, detail: String) -> ScanError {
    ScanError {
        path: key.to_string(),
        kind: ScanErrorKind::CannotReadFile,
        system_error: Some(detail),
    }
}

/// Read-only: fingerprint, compare with the catalog, extract tags when needed.
fn probe_file(catalog: &Catalog, path: &Path, key: &str) -> Result<Probe, LibraryError> {
    let fingerprint = match fingerprint_file(path) {
        Ok(fingerprint) => fingerprint,
        Err(err) => return Ok(Probe::Failed(read_error(key, err.to_string()))),
    };

    let stored = catalog.stored_fingerprint(key)?;
    let change = classify(stored.as_ref(), &fingerprint);
    if change == FileChange::Unchanged {
        return Ok(Probe::Unchanged);
    }
    debug!("{:?} {}", change, key);

    match metadata::extract(path) {
        Ok(metadata) => Ok(Probe::Extracted {
            fingerprint,
            metadata,
        }),
        Err(err) => Ok(Probe::Failed(ScanError {
            path: key.to_string(),
            kind: err.kind,
            system_error: err.system_error,
        })),
    }
}
