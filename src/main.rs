use anyhow::{Context, Result};
use arenascan::{
    config::Config,
    db::Database,
    metrics,
    scanner::{
        lookup::ScryfallClient, ocr::TesseractOcr, replay::DirectoryFrameSource,
        terminal::TerminalCalibration, IdentificationCascade, ScanSession,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arenascan=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting arenascan");

    let config = Config::load()?;
    info!("Configuration loaded");
    metrics::init_metrics();

    std::fs::create_dir_all(&config.paths.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.paths.data_dir.display())
    })?;

    let db = Database::new(&config.database.url).await?;
    info!("Database initialized");

    let Some(frames_dir) = config.paths.frames_dir.clone() else {
        info!("No frames directory configured; exporting the stored collection only");
        let count = db.write_collection_csv(&config.paths.collection_csv).await?;
        info!("Wrote {} cards to {}", count, config.paths.collection_csv.display());
        db.close().await;
        return Ok(());
    };

    let screen = Arc::new(DirectoryFrameSource::open(&frames_dir)?);
    let ocr = Arc::new(TesseractOcr::new(config.identification.tesseract_path.clone()));
    let lookup = Arc::new(ScryfallClient::new(
        &config.identification.lookup_base_url,
        Duration::from_secs(config.identification.lookup_timeout_secs),
    ));
    if config.identification.secondary_capture {
        warn!("Hover previews need a live pointer; replayed frames skip that stage");
    }
    let cascade = IdentificationCascade::new(
        db.clone(),
        ocr,
        lookup,
        config.identification.max_hash_distance,
    );

    let recalibrate = config.scan.recalibrate;
    let metrics_file = config.paths.metrics_file.clone();
    let csv_path = config.paths.collection_csv.clone();
    let session = ScanSession::new(config, db.clone(), cascade, screen.clone(), screen);
    let mut handler = session.retry_policy();

    let tiles = session
        .prepare_layout(&mut TerminalCalibration::stdio(), recalibrate)
        .await?;
    let stats = session.run(&tiles, &mut handler).await?;
    info!(
        "Scanned {} pages: {} tiles identified, {} unidentified",
        stats.pages, stats.tiles_identified, stats.tiles_unidentified
    );

    db.write_collection_csv(&csv_path).await?;
    tokio::fs::write(&metrics_file, metrics::render())
        .await
        .with_context(|| format!("Failed to write metrics to {}", metrics_file.display()))?;

    db.close().await;
    info!("Done");
    Ok(())
}
