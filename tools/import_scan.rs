use std::env;
use std::path::PathBuf;

use library::{Catalog, CatalogOptions};
use scanner::{render_report, summary_line, ScanService, ScanSettings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let music_root = args
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or("MUSIC_ROOT not set and no path argument")?;
    let index_path = args
        .next()
        .or_else(|| env::var("INDEX_PATH").ok())
        .unwrap_or_else(|| "data/catalog.redb".to_string());

    let catalog = Catalog::open(&PathBuf::from(&index_path), CatalogOptions::default())?;
    let settings = ScanSettings::for_roots(vec![PathBuf::from(&music_root)]);
    let service = ScanService::start(catalog, settings);
    service.start_now()?;
    service.wait_idle().await;
    service.shutdown().await;

    let stats = service.last_complete().ok_or("scan did not complete")?;
    let counts = service.catalog().counts()?;
    println!("{}", summary_line(&stats));
    println!(
        "Catalog: {} artists, {} releases, {} genres, {} tracks",
        counts.artists, counts.releases, counts.genres, counts.tracks
    );
    println!();
    print!("{}", render_report(&stats));

    Ok(())
}
