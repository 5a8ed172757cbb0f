use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::geometry::Rect;
use crate::error::{CalibrationError, TileSetError};

/// Upper bound on tiles per page: two rows of six.
pub const MAX_TILES: usize = 12;

// Proportions of the title and pip bands, in percent.
const TITLE_BAND_PCT: u32 = 16;
const TITLE_INSET_PCT: u32 = 6;
const TITLE_TOP_TRIM_PCT: u32 = 10;
const TITLE_HEIGHT_TRIM_PCT: u32 = 20;
const DOTS_HEIGHT_PCT: u32 = 6;
const DOTS_MIN_HEIGHT: u32 = 12;
const DOTS_GAP: u32 = 2;

fn pct(value: u32, percent: u32) -> u32 {
    (value as u64 * percent as u64 / 100) as u32
}

/// One card slot on the collection page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub card: Rect,
    pub title: Rect,
    pub dots: Rect,
}

impl Tile {
    /// Derives the title band (bottom 16% of the card, inset 6% per side) and
    /// the pip band sitting just above it.
    pub fn from_card(card: Rect) -> Result<Self, CalibrationError> {
        let too_small = || CalibrationError::CardTooSmall(card);

        let title_band = pct(card.height, TITLE_BAND_PCT);
        let title = Rect::new(
            card.x + pct(card.width, TITLE_INSET_PCT),
            card.bottom() - title_band + pct(title_band, TITLE_TOP_TRIM_PCT),
            card.width - pct(card.width, 2 * TITLE_INSET_PCT),
            title_band - pct(title_band, TITLE_HEIGHT_TRIM_PCT),
        )
        .ok_or_else(too_small)?;

        let dots_height = pct(card.height, DOTS_HEIGHT_PCT).max(DOTS_MIN_HEIGHT);
        let dots_top = card
            .bottom()
            .checked_sub(title_band + dots_height + DOTS_GAP)
            .ok_or_else(too_small)?;
        let dots = Rect::new(
            card.x + pct(card.width, 25),
            dots_top,
            pct(card.width, 50),
            dots_height,
        )
        .ok_or_else(too_small)?;

        let tile = Self { card, title, dots };
        if !tile.is_consistent() {
            return Err(too_small());
        }
        Ok(tile)
    }

    pub fn is_consistent(&self) -> bool {
        !self.title.is_degenerate()
            && !self.dots.is_degenerate()
            && self.card.contains(&self.title)
            && self.card.contains(&self.dots)
    }
}

/// Calibrated tiles for one scan, in row-major order. Index 0 is the top-left
/// card and that position is the tile's identity for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSet {
    tiles: Vec<Tile>,
}

impl TileSet {
    pub fn new(tiles: Vec<Tile>) -> Result<Self, CalibrationError> {
        if tiles.is_empty() || tiles.len() > MAX_TILES {
            return Err(CalibrationError::InvalidTileCount {
                count: tiles.len(),
                max: MAX_TILES,
            });
        }
        Ok(Self { tiles })
    }

    /// Builds tiles from card rectangles that are already in grid order.
    pub fn from_cards(cards: &[Rect]) -> Result<Self, CalibrationError> {
        let tiles = cards
            .iter()
            .map(|card| Tile::from_card(*card))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(tiles)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Tile> {
        self.tiles.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tile> {
        self.tiles.iter()
    }

    pub fn cards(&self) -> impl Iterator<Item = &Rect> {
        self.tiles.iter().map(|t| &t.card)
    }

    pub fn save(&self, path: &Path) -> Result<(), TileSetError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Saved calibration ({} tiles) to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, TileSetError> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: TileSet = serde_json::from_str(&raw)?;
        for (index, tile) in parsed.tiles.iter().enumerate() {
            if [tile.card, tile.title, tile.dots]
                .iter()
                .any(|rect| !rect.is_addressable())
            {
                return Err(TileSetError::InvalidTile {
                    index,
                    reason: "region extends past the coordinate range",
                });
            }
            if tile.card.is_degenerate() {
                return Err(TileSetError::InvalidTile {
                    index,
                    reason: "card region has zero area",
                });
            }
            if !tile.is_consistent() {
                return Err(TileSetError::InvalidTile {
                    index,
                    reason: "title or pip band falls outside the card",
                });
            }
        }
        Ok(Self::new(parsed.tiles)?)
    }
}

impl<'a> IntoIterator for &'a TileSet {
    type Item = &'a Tile;
    type IntoIter = std::slice::Iter<'a, Tile>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.iter()
    }
}
