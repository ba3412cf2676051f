use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use library::Catalog;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ScanSettings;
use crate::events::{EventNotifier, ScanEvent, ScanEventKind};
use crate::pipeline::{run_scan, ScanJob, MAX_PROBE_THREADS};
use crate::report::render_report;
use crate::state::{ScanLifecycle, ScanRejected, ScanState, ScanStats, ScanStatus};

/// Background scanner: owns the lifecycle, the timer and the running scan.
#[derive(Clone)]
pub struct ScanService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    catalog: Catalog,
    settings: ScanSettings,
    lifecycle: Arc<ScanLifecycle>,
    cancel: Arc<AtomicBool>,
    probes: Arc<Semaphore>,
    shutting_down: AtomicBool,
    wake: Notify,
    running: Mutex<Option<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ScanService {
    /// Spawns the timer task. With periodic scanning on, the first run is armed
    /// one interval from now. Must be called from within a tokio runtime.
    pub fn start(catalog: Catalog, settings: ScanSettings) -> Self {
        let lifecycle = Arc::new(ScanLifecycle::new(
            EventNotifier::default(),
            settings.progress_interval,
        ));
        let inner = Arc::new(ServiceInner {
            catalog,
            settings,
            lifecycle,
            cancel: Arc::new(AtomicBool::new(false)),
            probes: Arc::new(Semaphore::new(MAX_PROBE_THREADS)),
            shutting_down: AtomicBool::new(false),
            wake: Notify::new(),
            running: Mutex::new(None),
            timer: Mutex::new(None),
        });

        if let Some(interval) = inner.settings.scan_interval {
            inner.lifecycle.schedule_at(SystemTime::now() + interval);
        }
        let timer_inner = Arc::clone(&inner);
        let timer = tokio::spawn(async move {
            timer_loop(timer_inner).await;
        });
        *inner.timer.lock() = Some(timer);

        Self { inner }
    }

    pub fn start_now(&self) -> Result<(), ScanRejected> {
        launch(&self.inner)
    }

    pub fn schedule_at(&self, at: SystemTime) -> bool {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let armed = self.inner.lifecycle.schedule_at(at);
        self.inner.wake.notify_one();
        armed
    }

    /// Asks the running scan to stop after the current file.
    pub fn cancel(&self) -> bool {
        if self.inner.lifecycle.state() != ScanState::InProgress {
            return false;
        }
        info!("Cancelling scan");
        self.inner.cancel.store(true, Ordering::SeqCst);
        true
    }

    pub fn status(&self) -> ScanStatus {
        self.inner.lifecycle.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.inner.lifecycle.notifier().subscribe()
    }

    pub fn last_complete(&self) -> Option<Arc<ScanStats>> {
        self.inner.lifecycle.last_complete()
    }

    pub fn last_report(&self) -> Option<String> {
        self.last_complete().map(|stats| render_report(&stats))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// Resolves once no scan is in progress.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        loop {
            if self.inner.lifecycle.state() != ScanState::InProgress {
                return;
            }
            match rx.recv().await {
                Ok(event) if event.kind == ScanEventKind::Completed => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Stops the timer, cancels any running scan and waits for it to finish.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
        self.cancel();
        let running = self.inner.running.lock().take();
        if let Some(running) = running {
            let _ = running.await;
        }
        info!("Scanner stopped");
    }
}

fn launch(inner: &Arc<ServiceInner>) -> Result<(), ScanRejected> {
    if inner.shutting_down.load(Ordering::SeqCst) {
        return Err(ScanRejected::ShuttingDown);
    }
    inner.lifecycle.begin()?;
    inner.cancel.store(false, Ordering::SeqCst);

    let job = ScanJob {
        catalog: inner.catalog.clone(),
        settings: inner.settings.clone(),
        lifecycle: Arc::clone(&inner.lifecycle),
        cancel: Arc::clone(&inner.cancel),
        probes: Arc::clone(&inner.probes),
    };
    let run_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        let outcome = run_scan(&job).await;
        let next = match run_inner.settings.scan_interval {
            Some(_) if run_inner.shutting_down.load(Ordering::SeqCst) => None,
            Some(interval) => Some(SystemTime::now() + interval),
            None => None,
        };
        run_inner.lifecycle.complete(outcome, next);
        run_inner.wake.notify_one();
    });
    *inner.running.lock() = Some(handle);
    Ok(())
}

async fn timer_loop(inner: Arc<ServiceInner>) {
    loop {
        if inner.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        let next = match inner.lifecycle.state() {
            ScanState::Scheduled => inner.lifecycle.next_scheduled(),
            _ => None,
        };
        let at = match next {
            Some(at) => at,
            None => {
                inner.wake.notified().await;
                continue;
            }
        };

        let wait = at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                // Only fire if nobody moved the schedule meanwhile.
                if inner.lifecycle.next_scheduled() != Some(at) {
                    continue;
                }
                match launch(&inner) {
                    Ok(()) => debug!("Scheduled scan started"),
                    Err(err) => debug!("Scheduled scan not started: {}", err),
                }
            }
            _ = inner.wake.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ScanService;
    use crate::config::ScanSettings;
    use crate::events::ScanEventKind;
    use crate::state::{ScanOutcome, ScanRejected, ScanState, ScanStats};
    use common::{path_key, DuplicateReason, ScanErrorKind};
    use library::{Catalog, CatalogOptions};
    use metadata::testing::{write_wav, write_wav_with_tags, WavTags};
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tokio::sync::broadcast::error::RecvError;

    fn service_for(root: &Path, index: &Path) -> ScanService {
        let catalog = Catalog::open(index, CatalogOptions::default()).unwrap();
        let mut settings = ScanSettings::for_roots(vec![root.to_path_buf()]);
        settings.progress_interval = Duration::ZERO;
        ScanService::start(catalog, settings)
    }

    async fn scan_once(service: &ScanService) -> Arc<ScanStats> {
        service.start_now().unwrap();
        service.wait_idle().await;
        service.last_complete().unwrap()
    }

    fn tagged<'a>(artist: &'a str, release: &'a str, genre: &'a str) -> WavTags<'a> {
        WavTags {
            artist: Some(artist),
            release: Some(release),
            genre: Some(genre),
            track_number: Some(1),
            ..WavTags::default()
        }
    }

    #[tokio::test]
    async fn second_scan_of_unchanged_tree_writes_nothing() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_wav_with_tags(&music.path().join("a/1.wav"), 8000, 1, &tagged("Low", "Lp", "Rock"));
        write_wav(&music.path().join("a/2.wav"), 8000, 2);
        write_wav(&music.path().join("b/3.wav"), 8000, 3);
        let service = service_for(music.path(), &data.path().join("catalog.redb"));

        let first = scan_once(&service).await;
        assert_eq!(first.outcome, Some(ScanOutcome::Completed));
        assert_eq!(first.additions, 3);
        let revision = service.catalog().revision().unwrap();
        let tracks = service.catalog().list_tracks().unwrap();

        let second = scan_once(&service).await;
        assert_eq!(second.skips, 3);
        assert_eq!(second.additions + second.updates + second.deletions, 0);
        assert_eq!(service.catalog().revision().unwrap(), revision);
        assert_eq!(service.catalog().list_tracks().unwrap(), tracks);
        assert!(tracks.iter().all(|track| Path::new(&track.path).is_absolute()));
    }

    #[tokio::test]
    async fn content_change_with_same_mtime_is_reprocessed() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let path = music.path().join("song.wav");
        write_wav(&path, 8000, 10);
        let service = service_for(music.path(), &data.path().join("catalog.redb"));
        scan_once(&service).await;

        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        write_wav(&path, 8000, 11);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let stats = scan_once(&service).await;
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.skips, 0);
        let track = service
            .catalog()
            .track_by_path(&path_key(&path))
            .unwrap()
            .unwrap();
        assert_eq!(track.checksum, common::checksum_file(&path).unwrap());
    }

    #[tokio::test]
    async fn identical_files_are_reported_as_duplicates() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_wav(&music.path().join("one/take.wav"), 4000, 7);
        write_wav(&music.path().join("two/take.wav"), 4000, 7);
        write_wav(&music.path().join("two/other.wav"), 4000, 8);
        let service = service_for(music.path(), &data.path().join("catalog.redb"));

        let stats = scan_once(&service).await;
        let found: Vec<(String, DuplicateReason)> = stats
            .duplicates
            .iter()
            .map(|entry| (entry.path.clone(), entry.reason))
            .collect();
        assert_eq!(
            found,
            vec![
                (path_key(&music.path().join("one/take.wav")), DuplicateReason::SameHash),
                (path_key(&music.path().join("two/take.wav")), DuplicateReason::SameHash),
            ]
        );
        assert_eq!(service.catalog().counts().unwrap().tracks, 3);
    }

    #[tokio::test]
    async fn deleted_copy_is_not_reported_as_duplicate() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let kept = music.path().join("a.wav");
        let copy = music.path().join("b.wav");
        write_wav(&kept, 4000, 5);
        write_wav(&copy, 4000, 5);
        let service = service_for(music.path(), &data.path().join("catalog.redb"));
        assert_eq!(scan_once(&service).await.duplicates.len(), 2);

        fs::remove_file(&copy).unwrap();
        let stats = scan_once(&service).await;

        assert!(stats.duplicates.is_empty());
        assert_eq!(stats.deletions, 1);
        assert_eq!(service.catalog().track_paths().unwrap(), vec![path_key(&kept)]);
    }

    #[tokio::test]
    async fn deleted_file_is_removed_with_its_artist() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let gone = music.path().join("gone.wav");
        write_wav_with_tags(&gone, 8000, 1, &tagged("Solo", "Single", "Noise"));
        write_wav_with_tags(
            &music.path().join("kept.wav"),
            8000,
            2,
            &tagged("Band", "Album", "Rock"),
        );
        let service = service_for(music.path(), &data.path().join("catalog.redb"));
        scan_once(&service).await;
        assert!(service.catalog().artist_by_name("Solo").unwrap().is_some());

        fs::remove_file(&gone).unwrap();
        let stats = scan_once(&service).await;

        assert_eq!(stats.deletions, 1);
        let catalog = service.catalog();
        assert!(catalog.track_by_path(&path_key(&gone)).unwrap().is_none());
        assert!(catalog.artist_by_name("Solo").unwrap().is_none());
        assert!(catalog.release_by_name("Single").unwrap().is_none());
        assert!(catalog.genre_by_name("Noise").unwrap().is_none());
        assert!(catalog.artist_by_name("Band").unwrap().is_some());
    }

    #[tokio::test]
    async fn one_corrupt_file_does_not_stop_the_run() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        for i in 0..100u32 {
            let dir = music.path().join(format!("album{:02}", i / 10));
            write_wav(&dir.join(format!("{:03}.wav", i)), 800, i as u8);
        }
        let corrupt = music.path().join("album05/zz_broken.flac");
        fs::write(&corrupt, b"definitely not a flac stream").unwrap();
        let service = service_for(music.path(), &data.path().join("catalog.redb"));

        let stats = scan_once(&service).await;

        assert_eq!(stats.outcome, Some(ScanOutcome::Completed));
        assert_eq!(stats.files_to_scan, 101);
        assert_eq!(stats.processed_files, 101);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.errors[0].path, path_key(&corrupt));
        assert_eq!(stats.errors[0].kind, ScanErrorKind::CannotParseFile);
        assert_eq!(stats.additions, 100);
        assert_eq!(service.catalog().counts().unwrap().tracks, 100);
        assert!(service.catalog().track_by_path(&path_key(&corrupt)).unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_never_runs_backwards() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        for i in 0..20u8 {
            write_wav(&music.path().join(format!("{:02}.wav", i)), 400, i);
        }
        let service = service_for(music.path(), &data.path().join("catalog.redb"));
        let mut rx = service.subscribe();

        scan_once(&service).await;

        let mut last = 0usize;
        let mut seen = 0usize;
        while let Ok(event) = rx.try_recv() {
            if event.kind != ScanEventKind::Progress {
                continue;
            }
            let stats = event.status.in_progress.unwrap();
            assert!(stats.processed_files >= last);
            assert!(stats.processed_files <= stats.files_to_scan);
            assert!((0.0..=1.0).contains(&stats.progress()));
            last = stats.processed_files;
            seen += 1;
        }
        assert!(seen > 0);
        assert_eq!(last, 20);
    }

    #[tokio::test]
    async fn start_is_rejected_while_running() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_wav(&music.path().join("a.wav"), 8000, 1);
        let service = service_for(music.path(), &data.path().join("catalog.redb"));

        service.start_now().unwrap();
        assert_eq!(service.start_now(), Err(ScanRejected::AlreadyRunning));
        assert_eq!(service.status().state, ScanState::InProgress);
        service.wait_idle().await;
        assert_eq!(service.status().state, ScanState::NotScheduled);
    }

    #[tokio::test]
    async fn cancelled_run_keeps_catalog_untouched() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        for i in 0..5u8 {
            write_wav(&music.path().join(format!("{}.wav", i)), 800, i);
        }
        let service = service_for(music.path(), &data.path().join("catalog.redb"));

        service.start_now().unwrap();
        assert!(service.cancel());
        service.wait_idle().await;

        let status = service.status();
        assert_eq!(status.last_outcome(), Some(ScanOutcome::Cancelled));
        assert_eq!(status.state, ScanState::NotScheduled);
        assert_eq!(service.catalog().counts().unwrap().tracks, 0);
        assert!(!service.cancel());
    }

    #[tokio::test]
    async fn cancel_mid_run_keeps_processed_files() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        for i in 0..40u8 {
            write_wav(&music.path().join(format!("{:02}.wav", i)), 800, i);
        }
        let service = service_for(music.path(), &data.path().join("catalog.redb"));
        let mut rx = service.subscribe();

        service.start_now().unwrap();
        loop {
            match rx.recv().await {
                Ok(event) if event.kind == ScanEventKind::Progress => {
                    let processed = event
                        .status
                        .in_progress
                        .map(|stats| stats.processed_files)
                        .unwrap_or(0);
                    if processed >= 5 {
                        assert!(service.cancel());
                        break;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
        service.wait_idle().await;

        let stats = service.last_complete().unwrap();
        assert_eq!(stats.outcome, Some(ScanOutcome::Cancelled));
        assert!(stats.processed_files >= 5);
        assert!(stats.processed_files < 40);
        assert_eq!(stats.additions, stats.processed_files);
        assert_eq!(stats.deletions, 0);
        assert_eq!(
            service.catalog().counts().unwrap().tracks,
            stats.processed_files
        );
    }

    #[tokio::test]
    async fn catalog_failure_ends_the_run() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        for (i, name) in ["a.wav", "b.wav", "c.wav"].iter().enumerate() {
            write_wav(&music.path().join(name), 800, i as u8);
        }
        let catalog =
            Catalog::open(&data.path().join("catalog.redb"), CatalogOptions::default()).unwrap();
        let mut settings = ScanSettings::for_roots(vec![music.path().to_path_buf()]);
        settings.scan_interval = Some(Duration::from_secs(3600));
        let service = ScanService::start(catalog, settings);
        assert_eq!(scan_once(&service).await.additions, 3);

        library::testing::corrupt_track_row(
            service.catalog(),
            &path_key(&music.path().join("b.wav")),
        );
        let stats = scan_once(&service).await;

        assert!(matches!(stats.outcome, Some(ScanOutcome::Failed(_))));
        assert_eq!(stats.processed_files, 1);
        assert_eq!(stats.skips, 1);
        let status = service.status();
        assert_eq!(status.state, ScanState::NotScheduled);
        assert_eq!(status.next_scheduled, None);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn unreadable_root_is_counted_and_skipped() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_wav(&music.path().join("a.wav"), 8000, 1);
        let catalog =
            Catalog::open(&data.path().join("catalog.redb"), CatalogOptions::default()).unwrap();
        let settings =
            ScanSettings::for_roots(vec![music.path().join("missing"), music.path().to_path_buf()]);
        let service = ScanService::start(catalog, settings);

        let stats = scan_once(&service).await;
        assert_eq!(stats.skipped_directories, 1);
        assert_eq!(stats.additions, 1);
        assert!(stats.errors.is_empty());
    }

    #[tokio::test]
    async fn periodic_scan_rearms_after_completion() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let catalog =
            Catalog::open(&data.path().join("catalog.redb"), CatalogOptions::default()).unwrap();
        let mut settings = ScanSettings::for_roots(vec![music.path().to_path_buf()]);
        settings.scan_interval = Some(Duration::from_secs(3600));
        let service = ScanService::start(catalog, settings);
        assert_eq!(service.status().state, ScanState::Scheduled);

        scan_once(&service).await;
        let status = service.status();
        assert_eq!(status.state, ScanState::Scheduled);
        let next = status.next_scheduled.unwrap();
        assert!(next > SystemTime::now() + Duration::from_secs(3000));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn timer_starts_a_scheduled_scan() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_wav(&music.path().join("a.wav"), 8000, 1);
        let service = service_for(music.path(), &data.path().join("catalog.redb"));
        let mut rx = service.subscribe();

        assert!(service.schedule_at(SystemTime::now() + Duration::from_millis(20)));
        let completed = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if let Ok(event) = rx.recv().await {
                    if event.kind == ScanEventKind::Completed {
                        return event;
                    }
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(completed.status.state, ScanState::NotScheduled);
        assert_eq!(service.last_complete().unwrap().additions, 1);
        assert!(service.last_report().unwrap().starts_with("Errors: 0\n"));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_scans() {
        let music = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let service = service_for(music.path(), &data.path().join("catalog.redb"));
        service.shutdown().await;
        assert_eq!(service.start_now(), Err(ScanRejected::ShuttingDown));
        assert!(!service.schedule_at(SystemTime::now()));
    }
}
