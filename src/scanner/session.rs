use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::box_detector::BoxDetector;
use super::calibration::{CalibrationInput, LayoutCalibrator};
use super::collaborators::{FrameSource, PageTurner};
use super::geometry::Rect;
use super::identification::IdentificationCascade;
use super::pips::PipCounter;
use super::tile::{Tile, TileSet};
use super::verifier::{
    LayoutState, LayoutVerifier, ObstructionHandler, ObstructionMonitor, RetryPolicy,
};
use crate::config::Config;
use crate::db::Database;
use crate::metrics;
use crate::models::{PageSummary, ScanStats};

const SIGNATURE_SIZE: (u32, u32) = (64, 16);
const SIGNATURE_HEX_LEN: usize = 16;
const CARD_BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TITLE_BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Walks the collection page by page: verify the grid, identify every tile,
/// record what was found, turn the page. Stops once the view wraps back to
/// the first page.
pub struct ScanSession {
    config: Config,
    db: Database,
    calibrator: LayoutCalibrator,
    verifier: LayoutVerifier,
    cascade: IdentificationCascade,
    pips: PipCounter,
    frames: Arc<dyn FrameSource>,
    pages: Arc<dyn PageTurner>,
}

impl ScanSession {
    pub fn new(
        config: Config,
        db: Database,
        cascade: IdentificationCascade,
        frames: Arc<dyn FrameSource>,
        pages: Arc<dyn PageTurner>,
    ) -> Self {
        let detector = BoxDetector::new(config.detection.clone());
        Self {
            calibrator: LayoutCalibrator::new(detector.clone(), config.calibration.clone()),
            verifier: LayoutVerifier::new(detector, config.verification.clone()),
            pips: PipCounter::new(config.pips.clone()),
            config,
            db,
            cascade,
            frames,
            pages,
        }
    }

    /// Obstruction policy for this session's frame source. A still source
    /// gets a bounded number of retries even when the config sets none.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config
                .scan
                .obstruction_retry_limit(self.frames.is_live()),
        )
    }

    /// Reuses the saved calibration unless `recalibrate` is set or the file
    /// is unusable. A new tile set is only written once calibration succeeds.
    pub async fn prepare_layout<I: CalibrationInput>(
        &self,
        input: &mut I,
        recalibrate: bool,
    ) -> Result<TileSet> {
        let path = &self.config.paths.calibration_file;
        if !recalibrate && path.exists() {
            match TileSet::load(path) {
                Ok(tiles) => {
                    info!("Loaded {} tiles from {}", tiles.len(), path.display());
                    return Ok(tiles);
                }
                Err(e) => warn!("Ignoring calibration file {}: {}", path.display(), e),
            }
        }

        let frame = self.capture().await?;
        let tiles = self.calibrator.calibrate(&frame, input)?;
        tiles.save(path)?;
        Ok(tiles)
    }

    pub async fn run<H: ObstructionHandler>(
        &self,
        tiles: &TileSet,
        handler: &mut H,
    ) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        let mut first_signature: Option<String> = None;
        let settle = Duration::from_millis(self.config.scan.page_settle_ms);

        while stats.pages < self.config.scan.max_pages {
            let Some(frame) = self.wait_for_layout(tiles, handler).await? else {
                warn!("Scan aborted on page {}: card grid stayed obstructed", stats.pages + 1);
                break;
            };

            let signature = page_signature(&frame, tiles);
            if stats.pages > 0 && signature.is_some() && signature == first_signature {
                info!("Back on the first page after {} pages", stats.pages);
                break;
            }
            if first_signature.is_none() {
                first_signature = signature;
            }

            if let Some(dir) = &self.config.paths.annotated_frames_dir {
                if let Err(e) = save_annotated_page(dir, stats.pages, &frame, tiles).await {
                    warn!("Failed to save annotated page {}: {}", stats.pages, e);
                }
            }

            let summary = self.process_page(&frame, tiles).await?;
            stats.pages += 1;
            stats.tiles_identified += summary.identified;
            stats.tiles_unidentified += summary.unidentified;
            metrics::record_page_scanned();
            info!(
                "Page {}: {} identified, {} unidentified",
                stats.pages, summary.identified, summary.unidentified
            );

            self.db
                .write_collection_csv(&self.config.paths.collection_csv)
                .await?;

            let pages = Arc::clone(&self.pages);
            tokio::task::spawn_blocking(move || pages.next_page())
                .await?
                .context("Failed to turn page")?;
            tokio::time::sleep(settle).await;
        }

        info!(
            "Scan finished: {} pages, {} tiles identified, {} unidentified",
            stats.pages, stats.tiles_identified, stats.tiles_unidentified
        );
        Ok(stats)
    }

    /// Captures until the calibrated grid is visible. `None` means the
    /// handler gave up.
    async fn wait_for_layout<H: ObstructionHandler>(
        &self,
        tiles: &TileSet,
        handler: &mut H,
    ) -> Result<Option<RgbImage>> {
        let retry = Duration::from_millis(self.config.scan.obstruction_retry_ms);
        let mut monitor = ObstructionMonitor::default();

        loop {
            let frame = self.capture().await?;
            let report = self.verifier.verify(&frame, tiles);
            match monitor.observe(&report, handler) {
                LayoutState::Verified => return Ok(Some(frame)),
                LayoutState::Obstructed { .. } => {
                    metrics::record_obstruction();
                    tokio::time::sleep(retry).await;
                }
                LayoutState::Aborted => {
                    metrics::record_obstruction();
                    return Ok(None);
                }
            }
        }
    }

    async fn process_page(&self, frame: &RgbImage, tiles: &TileSet) -> Result<PageSummary> {
        let mut summary = PageSummary::default();
        let allow_secondary = self.config.identification.secondary_capture;

        for (index, tile) in tiles.iter().enumerate() {
            let owned = self.pips.count(&tile.dots.crop(frame));
            match self.cascade.identify(frame, tile, allow_secondary).await {
                Some(identity) => {
                    debug!("Tile {}: {} x{}", index, identity.name, owned);
                    self.db
                        .upsert_collection(&identity.name, owned, Some(&identity))
                        .await?;
                    summary.identified += 1;
                }
                None => {
                    warn!("Tile {} could not be identified ({} owned)", index, owned);
                    summary.unidentified += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn capture(&self) -> Result<RgbImage> {
        let frames = Arc::clone(&self.frames);
        tokio::task::spawn_blocking(move || frames.capture())
            .await?
            .context("Failed to capture frame")
    }
}

/// Copy of `frame` with every card box in green and every title box in red,
/// two pixels wide.
pub fn annotate_page(frame: &RgbImage, tiles: &TileSet) -> RgbImage {
    let mut canvas = frame.clone();
    for tile in tiles {
        outline(&mut canvas, &tile.card, CARD_BOX_COLOR);
        outline(&mut canvas, &tile.title, TITLE_BOX_COLOR);
    }
    canvas
}

fn outline(canvas: &mut RgbImage, rect: &Rect, color: Rgb<u8>) {
    for inset in 0..2u32 {
        if rect.width <= 2 * inset || rect.height <= 2 * inset {
            break;
        }
        draw_hollow_rect_mut(
            canvas,
            imageproc::rect::Rect::at((rect.x + inset) as i32, (rect.y + inset) as i32)
                .of_size(rect.width - 2 * inset, rect.height - 2 * inset),
            color,
        );
    }
}

/// Writes `page_NNNN.png` under `dir`.
async fn save_annotated_page(
    dir: &Path,
    index: usize,
    frame: &RgbImage,
    tiles: &TileSet,
) -> Result<()> {
    let annotated = annotate_page(frame, tiles);
    let path = dir.join(format!("page_{:04}.png", index));
    tokio::fs::create_dir_all(dir).await?;
    tokio::task::spawn_blocking(move || {
        annotated
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))
    })
    .await??;
    Ok(())
}

/// Short fingerprint of a page: SHA-256 over the first tile's title,
/// downscaled so capture noise does not change it.
pub fn page_signature(frame: &RgbImage, tiles: &TileSet) -> Option<String> {
    let first: &Tile = tiles.get(0)?;
    let title = image::imageops::grayscale(&first.title.crop(frame));
    let small = image::imageops::resize(
        &title,
        SIGNATURE_SIZE.0,
        SIGNATURE_SIZE.1,
        FilterType::Triangle,
    );

    let digest = Sha256::digest(small.as_raw());
    let mut signature = hex::encode(digest);
    signature.truncate(SIGNATURE_HEX_LEN);
    Some(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{identity, scratch_db};
    use crate::error::CalibrationError;
    use crate::models::CardIdentity;
    use crate::scanner::box_detector::tests::{blank_frame, grid_cards, grid_frame};
    use crate::scanner::calibration::tests::ScriptedInput;
    use crate::scanner::calibration::CalibrationEvent;
    use crate::scanner::collaborators::{CardLookup, OcrEngine};
    use crate::scanner::verifier::RetryPolicy;
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::rect::Rect as DrawRect;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory page carousel.
    struct Screen {
        pages: Vec<RgbImage>,
        current: AtomicUsize,
        turns: AtomicUsize,
        live: bool,
    }

    impl Screen {
        fn new(pages: Vec<RgbImage>) -> Arc<Self> {
            Arc::new(Self {
                pages,
                current: AtomicUsize::new(0),
                turns: AtomicUsize::new(0),
                live: true,
            })
        }

        fn still(pages: Vec<RgbImage>) -> Arc<Self> {
            Arc::new(Self {
                pages,
                current: AtomicUsize::new(0),
                turns: AtomicUsize::new(0),
                live: false,
            })
        }
    }

    impl FrameSource for Screen {
        fn capture(&self) -> Result<RgbImage> {
            Ok(self.pages[self.current.load(Ordering::SeqCst)].clone())
        }

        fn is_live(&self) -> bool {
            self.live
        }
    }

    impl PageTurner for Screen {
        fn next_page(&self) -> Result<()> {
            self.turns.fetch_add(1, Ordering::SeqCst);
            let next = (self.current.load(Ordering::SeqCst) + 1) % self.pages.len();
            self.current.store(next, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NamedOcr(&'static str);

    impl OcrEngine for NamedOcr {
        fn read(&self, _image: &RgbImage) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct OneCard(CardIdentity);

    impl CardLookup for OneCard {
        fn lookup(&self, text: &str) -> Option<CardIdentity> {
            (text == self.0.name).then(|| self.0.clone())
        }
    }

    /// Reads the colour of the mark in the middle of a title as its name.
    struct MarkerOcr;

    impl OcrEngine for MarkerOcr {
        fn read(&self, image: &RgbImage) -> Result<String> {
            let mark = image.get_pixel(image.width() / 2, image.height() / 2);
            Ok(format!("Card {}", mark[0]))
        }
    }

    struct AnyCard;

    impl CardLookup for AnyCard {
        fn lookup(&self, text: &str) -> Option<CardIdentity> {
            Some(identity(text, "any"))
        }
    }

    /// Grid page with a page-specific mark in the first title and `pips`
    /// dots above it.
    fn page(shade: u8, pips: u32) -> RgbImage {
        let mut frame = grid_frame();
        let first = grid_cards()[0];
        let tile = Tile::from_card(first).unwrap();
        draw_filled_rect_mut(
            &mut frame,
            DrawRect::at(tile.title.x as i32 + 20, tile.title.y as i32 + 6).of_size(60, 18),
            Rgb([shade, shade / 2, 40]),
        );
        for i in 0..pips {
            let cx = tile.dots.x as i32 + 20 + i as i32 * 16;
            let cy = tile.dots.y as i32 + tile.dots.height as i32 / 2;
            draw_filled_circle_mut(&mut frame, (cx, cy), 3, Rgb([10, 10, 10]));
        }
        frame
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.paths.calibration_file = dir.join("calibration.json");
        config.paths.collection_csv = dir.join("collection.csv");
        config.scan.page_settle_ms = 0;
        config.scan.obstruction_retry_ms = 0;
        config.paths.annotated_frames_dir = None;
        config
    }

    fn session(
        config: Config,
        db: Database,
        ocr: &'static str,
        card: CardIdentity,
        screen: Arc<Screen>,
    ) -> ScanSession {
        let cascade = IdentificationCascade::new(
            db.clone(),
            Arc::new(NamedOcr(ocr)),
            Arc::new(OneCard(card)),
            config.identification.max_hash_distance,
        );
        ScanSession::new(config, db, cascade, screen.clone(), screen)
    }

    #[test]
    fn signature_tracks_first_title_only() {
        let tiles = TileSet::from_cards(&grid_cards()).unwrap();
        let a = page_signature(&page(200, 0), &tiles).unwrap();
        let b = page_signature(&page(90, 0), &tiles).unwrap();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);

        let mut same_title = page(200, 0);
        draw_filled_rect_mut(
            &mut same_title,
            DrawRect::at(1000, 500).of_size(20, 20),
            Rgb([0, 0, 0]),
        );
        assert_eq!(page_signature(&same_title, &tiles).unwrap(), a);
    }

    #[tokio::test]
    async fn scan_stops_when_pages_wrap_around() {
        let (db, dir) = scratch_db().await;
        let config = test_config(dir.path());
        let csv_path = config.paths.collection_csv.clone();
        let elves = identity("Llanowar Elves", "abc");
        let screen = Screen::new(vec![page(200, 2), page(150, 2), page(90, 2)]);
        let session = session(config, db.clone(), "Llanowar Elves", elves, screen.clone());

        let mut input = ScriptedInput::new(None, Vec::new());
        let tiles = session.prepare_layout(&mut input, false).await.unwrap();
        assert_eq!(tiles.len(), 12);
        assert!(input.offered_default.is_none());
        assert!(dir.path().join("calibration.json").exists());

        let stats = session
            .run(&tiles, &mut RetryPolicy::new(Some(3)))
            .await
            .unwrap();
        assert_eq!(
            stats,
            ScanStats {
                pages: 3,
                tiles_identified: 36,
                tiles_unidentified: 0,
            }
        );
        assert_eq!(screen.turns.load(Ordering::SeqCst), 3);

        let csv = std::fs::read_to_string(csv_path).unwrap();
        assert!(csv.contains("Llanowar Elves"));
        assert_eq!(db.export_collection().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn page_limit_caps_the_scan() {
        let (db, dir) = scratch_db().await;
        let mut config = test_config(dir.path());
        config.scan.max_pages = 2;
        let screen = Screen::new(vec![page(200, 1), page(150, 1), page(90, 1)]);
        let session = session(config, db, "", identity("Unused", "u"), screen);

        let tiles = TileSet::from_cards(&grid_cards()).unwrap();
        let stats = session.run(&tiles, &mut RetryPolicy::default()).await.unwrap();
        assert_eq!(stats.pages, 2);
        assert_eq!(stats.tiles_identified, 0);
        assert_eq!(stats.tiles_unidentified, 24);
    }

    #[tokio::test]
    async fn saved_calibration_is_reused() {
        let (db, dir) = scratch_db().await;
        let config = test_config(dir.path());
        let saved = TileSet::from_cards(&grid_cards()[..6]).unwrap();
        saved.save(&config.paths.calibration_file).unwrap();

        let screen = Screen::new(vec![blank_frame()]);
        let session = session(config, db, "", identity("Unused", "u"), screen);
        let mut input = ScriptedInput::new(None, Vec::new());
        assert_eq!(session.prepare_layout(&mut input, false).await.unwrap(), saved);
    }

    #[tokio::test]
    async fn zero_area_manual_mark_persists_nothing() {
        let (db, dir) = scratch_db().await;
        let config = test_config(dir.path());
        let calibration_file = config.paths.calibration_file.clone();
        let screen = Screen::new(vec![blank_frame()]);
        let session = session(config, db, "", identity("Unused", "u"), screen);

        let mut input = ScriptedInput::new(
            Some(1),
            vec![
                CalibrationEvent::Point { x: 400, y: 300 },
                CalibrationEvent::Point { x: 400, y: 300 },
                CalibrationEvent::Confirm,
            ],
        );
        let err = session.prepare_layout(&mut input, true).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CalibrationError>(),
            Some(CalibrationError::DegenerateRegion { index: 0 })
        ));
        assert!(!calibration_file.exists());
    }

    #[tokio::test]
    async fn persistent_obstruction_aborts_the_scan() {
        let (db, dir) = scratch_db().await;
        let config = test_config(dir.path());
        let screen = Screen::new(vec![blank_frame()]);
        let session = session(config, db, "", identity("Unused", "u"), screen.clone());

        let tiles = TileSet::from_cards(&grid_cards()).unwrap();
        let stats = session
            .run(&tiles, &mut RetryPolicy::new(Some(2)))
            .await
            .unwrap();
        assert_eq!(stats, ScanStats::default());
        assert_eq!(screen.turns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn obstructed_still_frame_gives_up_with_default_limits() {
        let (db, dir) = scratch_db().await;
        let mut config = test_config(dir.path());
        assert_eq!(config.scan.max_obstruction_retries, None);
        config.scan.obstruction_retry_ms = 10;
        let screen = Screen::still(vec![blank_frame()]);
        let session = session(config, db, "", identity("Unused", "u"), screen.clone());

        let tiles = TileSet::from_cards(&grid_cards()).unwrap();
        let mut policy = session.retry_policy();
        let stats = tokio::time::timeout(Duration::from_secs(10), session.run(&tiles, &mut policy))
            .await
            .expect("scan of a still frame should give up")
            .unwrap();
        assert_eq!(stats, ScanStats::default());
        assert_eq!(screen.turns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pip_count_becomes_owned_count() {
        let (db, dir) = scratch_db().await;
        let config = test_config(dir.path());
        let tiles = TileSet::from_cards(&grid_cards()).unwrap();

        let mut frame = grid_frame();
        for (i, tile) in tiles.iter().enumerate() {
            draw_filled_rect_mut(
                &mut frame,
                DrawRect::at(tile.title.x as i32 + 50, tile.title.y as i32 + 8).of_size(60, 16),
                Rgb([40 + 15 * i as u8, 60, 90]),
            );
            for pip in 0..(i as i32 % 4) + 1 {
                let cx = tile.dots.x as i32 + 20 + pip * 16;
                let cy = tile.dots.y as i32 + tile.dots.height as i32 / 2;
                draw_filled_circle_mut(&mut frame, (cx, cy), 3, Rgb([10, 10, 10]));
            }
        }

        let cascade = IdentificationCascade::new(
            db.clone(),
            Arc::new(MarkerOcr),
            Arc::new(AnyCard),
            config.identification.max_hash_distance,
        );
        let screen = Screen::new(vec![frame]);
        let session = ScanSession::new(config, db.clone(), cascade, screen.clone(), screen);

        let stats = session.run(&tiles, &mut RetryPolicy::default()).await.unwrap();
        assert_eq!(stats.pages, 1);
        assert_eq!(stats.tiles_identified, 12);

        let records = db.export_collection().await.unwrap();
        assert_eq!(records.len(), 12);
        for i in 0..12u8 {
            let name = format!("Card {}", 40 + 15 * i);
            let record = records.iter().find(|r| r.name == name).unwrap();
            assert_eq!(record.owned_count, (i as i64 % 4) + 1, "{}", name);
        }
    }

    #[tokio::test]
    async fn each_page_is_saved_with_boxes_drawn() {
        let (db, dir) = scratch_db().await;
        let mut config = test_config(dir.path());
        let frames_dir = dir.path().join("frames");
        config.paths.annotated_frames_dir = Some(frames_dir.clone());
        let screen = Screen::new(vec![page(200, 1)]);
        let session = session(config, db, "", identity("Unused", "u"), screen);

        let tiles = TileSet::from_cards(&grid_cards()).unwrap();
        let stats = session.run(&tiles, &mut RetryPolicy::default()).await.unwrap();
        assert_eq!(stats.pages, 1);

        let saved = frames_dir.join("page_0000.png");
        assert!(saved.exists());
        assert!(!frames_dir.join("page_0001.png").exists());

        let annotated = image::open(&saved).unwrap().to_rgb8();
        let tile = tiles.get(0).unwrap();
        let card = tile.card;
        let title = tile.title;
        assert_eq!(annotated.get_pixel(card.x, card.y + card.height / 2), &CARD_BOX_COLOR);
        assert_eq!(annotated.get_pixel(card.x + 1, card.y + card.height / 2), &CARD_BOX_COLOR);
        assert_eq!(annotated.get_pixel(title.x, title.y + title.height / 2), &TITLE_BOX_COLOR);
        assert_eq!(
            annotated.get_pixel(card.x + card.width / 2, card.y + card.height / 2),
            &Rgb([210, 200, 180])
        );
    }
}
