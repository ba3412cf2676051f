use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use library::{Catalog, CatalogOptions};
use scanner::config::{config_path_from_env, load_or_create_config, resolve_path};
use scanner::{
    render_report, status_line, summary_line, ScanEvent, ScanEventKind, ScanService, ScanSettings,
    ScanStats,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

const REPORT_FILE: &str = "last_scan_report.txt";
const STATS_FILE: &str = "last_scan.json";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }
    if config.roots.is_empty() {
        warn!("No music roots configured; add some to {:?}", config_path);
    }

    let index_path = resolve_path(&config_path, &config.index_path);
    let catalog = Catalog::open(
        &index_path,
        CatalogOptions {
            prune_genres: config.prune_genres,
        },
    )?;
    let counts = catalog.counts()?;
    info!(
        "Catalog has {} artists, {} releases, {} genres, {} tracks",
        counts.artists, counts.releases, counts.genres, counts.tracks
    );

    let output_dir = index_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let settings = ScanSettings::from_config(&config_path, &config);
    let service = ScanService::start(catalog, settings);
    let watcher = tokio::spawn(follow_events(service.subscribe(), output_dir));

    if config.scan_on_startup {
        if let Err(err) = service.start_now() {
            warn!("Startup scan not started: {}", err);
        }
    } else {
        info!("{}", status_line(&service.status()));
    }

    shutdown_signal().await;
    service.shutdown().await;
    drop(service);
    // The watcher ends once the event channel closes, after the last report is written.
    if tokio::time::timeout(DRAIN_TIMEOUT, watcher).await.is_err() {
        warn!("Scan event watcher did not finish in time");
    }
    Ok(())
}

async fn follow_events(mut rx: broadcast::Receiver<ScanEvent>, output_dir: PathBuf) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                debug!("Skipped {} scan events", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event.kind {
            ScanEventKind::Scheduled | ScanEventKind::Started => {
                info!("{}", status_line(&event.status));
            }
            ScanEventKind::Progress => debug!("{}", status_line(&event.status)),
            ScanEventKind::Completed => {
                let stats = match &event.status.last_complete {
                    Some(stats) => stats,
                    None => continue,
                };
                info!("Last scan: {}", summary_line(stats));
                if let Err(err) = write_outputs(&output_dir, stats) {
                    warn!("Failed to write scan report: {}", err);
                }
                info!("{}", status_line(&event.status));
            }
        }
    }
}

fn write_outputs(dir: &Path, stats: &ScanStats) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(REPORT_FILE), render_report(stats))?;
    fs::write(dir.join(STATS_FILE), serde_json::to_string_pretty(stats)?)?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
