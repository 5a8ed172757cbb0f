use image::RgbImage;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::art_hash::{self, ArtHash};
use super::collaborators::{CardLookup, OcrEngine, SecondaryCapture};
use super::tile::Tile;
use crate::db::Database;
use crate::metrics;
use crate::models::CardIdentity;

/// Canonical form of OCR output used both for lookups and as the OCR cache key.
pub fn normalize_ocr_text(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            '\r' | '\n' => ' ',
            other => other,
        })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentificationStage {
    OcrCache,
    PrimaryOcr,
    SecondaryOcr,
    ArtMatch,
}

impl IdentificationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OcrCache => "ocr_cache",
            Self::PrimaryOcr => "primary_ocr",
            Self::SecondaryOcr => "secondary_ocr",
            Self::ArtMatch => "art_match",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub identity: CardIdentity,
    pub stage: IdentificationStage,
}

/// Title OCR, then hover-preview OCR, then the nearest entry in the art
/// cache. Only art matches write to the art cache, so OCR hits never seed it.
/// Every failure falls through to the next stage; the cascade itself never
/// errors.
pub struct IdentificationCascade {
    db: Database,
    ocr: Arc<dyn OcrEngine>,
    lookup: Arc<dyn CardLookup>,
    secondary: Option<Arc<dyn SecondaryCapture>>,
    max_hash_distance: u32,
}

impl IdentificationCascade {
    pub fn new(
        db: Database,
        ocr: Arc<dyn OcrEngine>,
        lookup: Arc<dyn CardLookup>,
        max_hash_distance: u32,
    ) -> Self {
        Self {
            db,
            ocr,
            lookup,
            secondary: None,
            max_hash_distance,
        }
    }

    pub fn with_secondary_capture(mut self, capture: Arc<dyn SecondaryCapture>) -> Self {
        self.secondary = Some(capture);
        self
    }

    pub async fn identify(
        &self,
        frame: &RgbImage,
        tile: &Tile,
        allow_secondary: bool,
    ) -> Option<CardIdentity> {
        self.resolve(frame, tile, allow_secondary)
            .await
            .map(|found| found.identity)
    }

    /// Like [`identify`](Self::identify), but also reports which stage matched
    /// and records the outcome in metrics.
    pub async fn resolve(
        &self,
        frame: &RgbImage,
        tile: &Tile,
        allow_secondary: bool,
    ) -> Option<Identification> {
        let title = tile.title.crop(frame);
        let mut found = self
            .identify_by_text(title, IdentificationStage::PrimaryOcr)
            .await;

        if found.is_none() && allow_secondary {
            found = self.identify_by_hover(tile).await;
        }

        if found.is_none() {
            found = self.identify_by_art(tile.card.crop(frame)).await;
        }

        match &found {
            Some(hit) => {
                debug!("Tile at {:?} is {} via {}", tile.card, hit.identity.name, hit.stage.as_str());
                metrics::record_identified(hit.stage.as_str());
            }
            None => metrics::record_unidentified(),
        }
        found
    }

    async fn identify_by_text(
        &self,
        image: RgbImage,
        stage: IdentificationStage,
    ) -> Option<Identification> {
        let ocr = Arc::clone(&self.ocr);
        let raw = match tokio::task::spawn_blocking(move || ocr.read(&image)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!("OCR failed: {}", e);
                return None;
            }
            Err(e) => {
                warn!("OCR task panicked: {}", e);
                return None;
            }
        };

        let text = normalize_ocr_text(&raw);
        if text.is_empty() {
            return None;
        }

        match self.db.lookup_ocr_cache(&text).await {
            Ok(Some(identity)) => {
                return Some(Identification {
                    identity,
                    stage: IdentificationStage::OcrCache,
                })
            }
            Ok(None) => {}
            Err(e) => warn!("OCR cache read failed for {:?}: {}", text, e),
        }

        let lookup = Arc::clone(&self.lookup);
        let query = text.clone();
        let identity = match tokio::task::spawn_blocking(move || lookup.lookup(&query)).await {
            Ok(identity) => identity?,
            Err(e) => {
                warn!("Lookup task panicked: {}", e);
                return None;
            }
        };

        if let Err(e) = self.db.cache_ocr_identity(&text, &identity).await {
            warn!("Failed to cache OCR result for {:?}: {}", text, e);
        }
        info!("Read {:?} as {}", text, identity.name);
        Some(Identification { identity, stage })
    }

    async fn identify_by_hover(&self, tile: &Tile) -> Option<Identification> {
        let capture = Arc::clone(self.secondary.as_ref()?);
        let (x, y) = tile.card.center();
        let preview = match tokio::task::spawn_blocking(move || capture.capture_at(x, y)).await {
            Ok(Ok(preview)) => preview,
            Ok(Err(e)) => {
                warn!("Hover capture at ({}, {}) failed: {}", x, y, e);
                return None;
            }
            Err(e) => {
                warn!("Hover capture task panicked: {}", e);
                return None;
            }
        };
        self.identify_by_text(preview, IdentificationStage::SecondaryOcr)
            .await
    }

    async fn identify_by_art(&self, card: RgbImage) -> Option<Identification> {
        let hash = ArtHash::compute(&card)?;
        let entries = match self.db.art_cache_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Art cache read failed: {}", e);
                return None;
            }
        };

        let (identity, distance) = art_hash::nearest(&hash, &entries)?;
        if distance > self.max_hash_distance {
            debug!("Closest art for {} is {} bits away", hash, distance);
            return None;
        }
        let identity = identity.clone();

        if let Err(e) = self.db.cache_art_identity(&hash, &identity).await {
            warn!("Failed to cache art hash {}: {}", hash, e);
        }
        Some(Identification {
            identity,
            stage: IdentificationStage::ArtMatch,
        })
    }
}
