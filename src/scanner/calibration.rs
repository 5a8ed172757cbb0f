use image::RgbImage;
use tracing::{info, warn};

use super::box_detector::BoxDetector;
use super::geometry::Rect;
use super::tile::{TileSet, MAX_TILES};
use crate::config::CalibrationConfig;
use crate::error::CalibrationError;

/// Turns detected card boxes into an ordered tile set, falling back to manual
/// marking when too few cards are found.
#[derive(Debug, Clone, Default)]
pub struct LayoutCalibrator {
    detector: BoxDetector,
    config: CalibrationConfig,
}

#[derive(Debug)]
pub enum AutoCalibration {
    Calibrated(TileSet),
    /// Not enough boxes for a grid; carries whatever was found.
    NeedsManual { detected: Vec<Rect> },
}

impl LayoutCalibrator {
    pub fn new(detector: BoxDetector, config: CalibrationConfig) -> Self {
        Self { detector, config }
    }

    pub fn calibrate_automatic(&self, frame: &RgbImage) -> Result<AutoCalibration, CalibrationError> {
        let boxes = self.detector.detect(frame);
        if boxes.len() < self.config.min_auto_boxes {
            warn!(
                "Automatic calibration found {} card boxes, need {}",
                boxes.len(),
                self.config.min_auto_boxes
            );
            return Ok(AutoCalibration::NeedsManual { detected: boxes });
        }

        let cards = arrange_grid(&boxes, self.config.tiles_per_row);
        info!("Automatic calibration produced {} tiles", cards.len());
        Ok(AutoCalibration::Calibrated(TileSet::from_cards(&cards)?))
    }

    /// Automatic calibration with the manual path as fallback.
    pub fn calibrate<I: CalibrationInput>(
        &self,
        frame: &RgbImage,
        input: &mut I,
    ) -> Result<TileSet, CalibrationError> {
        match self.calibrate_automatic(frame)? {
            AutoCalibration::Calibrated(tiles) => Ok(tiles),
            AutoCalibration::NeedsManual { detected } => run_manual(input, detected.len()),
        }
    }
}

/// Splits boxes into two rows around the median top edge and orders each row
/// left to right, keeping at most `per_row` boxes per row.
pub fn arrange_grid(boxes: &[Rect], per_row: usize) -> Vec<Rect> {
    if boxes.is_empty() {
        return Vec::new();
    }

    let mut sorted = boxes.to_vec();
    sorted.sort_by_key(|r| (r.y, r.x));

    let split = median_top(&sorted);
    let mut upper: Vec<Rect> = sorted.iter().copied().filter(|r| (r.y as f64) < split).collect();
    let mut lower: Vec<Rect> = sorted.iter().copied().filter(|r| (r.y as f64) >= split).collect();
    upper.sort_by_key(|r| r.x);
    lower.sort_by_key(|r| r.x);
    upper.truncate(per_row);
    lower.truncate(per_row);

    upper.into_iter().chain(lower).collect()
}

// Input must be sorted by y.
fn median_top(sorted: &[Rect]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1].y as f64 + sorted[mid].y as f64) / 2.0
    } else {
        sorted[mid].y as f64
    }
}

/// Card count offered to the user when automatic calibration gives up.
pub fn default_card_count(detected: usize) -> usize {
    if detected == 0 {
        6
    } else {
        detected.clamp(6, MAX_TILES)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationEvent {
    Point { x: u32, y: u32 },
    Undo,
    Reset,
    Abort,
    Confirm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualState {
    AwaitingPoint,
    ReadyToConfirm,
    Aborted,
    Confirmed,
}

/// Point collection for manual calibration. Each card is marked by its
/// top-right corner followed by its bottom-left corner.
#[derive(Debug, Clone)]
pub struct ManualCalibration {
    card_count: usize,
    points: Vec<(u32, u32)>,
    state: ManualState,
    tiles: Option<TileSet>,
}

impl ManualCalibration {
    pub fn new(card_count: usize) -> Self {
        Self {
            card_count: card_count.clamp(1, MAX_TILES),
            points: Vec::new(),
            state: ManualState::AwaitingPoint,
            tiles: None,
        }
    }

    pub fn card_count(&self) -> usize {
        self.card_count
    }

    pub fn points(&self) -> &[(u32, u32)] {
        &self.points
    }

    pub fn state(&self) -> ManualState {
        self.state
    }

    fn required_points(&self) -> usize {
        self.card_count * 2
    }

    /// Instruction for the next user action.
    pub fn prompt(&self) -> String {
        match self.state {
            ManualState::AwaitingPoint => {
                let next = self.points.len();
                let card = next / 2 + 1;
                let corner = if next % 2 == 0 { "top-right" } else { "bottom-left" };
                format!("Card {}/{}: mark the {} corner", card, self.card_count, corner)
            }
            ManualState::ReadyToConfirm => "All cards marked. Confirm to save.".to_string(),
            ManualState::Aborted => "Calibration aborted.".to_string(),
            ManualState::Confirmed => "Calibration complete.".to_string(),
        }
    }

    /// Applies one input event. Abort and a zero-area card are fatal.
    pub fn handle(&mut self, event: CalibrationEvent) -> Result<ManualState, CalibrationError> {
        match self.state {
            ManualState::Aborted => return Err(CalibrationError::Aborted),
            ManualState::Confirmed => return Ok(self.state),
            ManualState::AwaitingPoint | ManualState::ReadyToConfirm => {}
        }

        match event {
            CalibrationEvent::Point { x, y } => {
                if self.points.len() < self.required_points() {
                    self.points.push((x, y));
                }
            }
            CalibrationEvent::Undo => {
                self.points.pop();
            }
            CalibrationEvent::Reset => self.points.clear(),
            CalibrationEvent::Abort => {
                self.state = ManualState::Aborted;
                return Err(CalibrationError::Aborted);
            }
            CalibrationEvent::Confirm => {
                if self.points.len() == self.required_points() {
                    return match self.build_tiles() {
                        Ok(tiles) => {
                            self.tiles = Some(tiles);
                            self.state = ManualState::Confirmed;
                            Ok(self.state)
                        }
                        Err(e) => {
                            self.state = ManualState::Aborted;
                            Err(e)
                        }
                    };
                }
            }
        }

        self.state = if self.points.len() == self.required_points() {
            ManualState::ReadyToConfirm
        } else {
            ManualState::AwaitingPoint
        };
        Ok(self.state)
    }

    fn build_tiles(&self) -> Result<TileSet, CalibrationError> {
        let mut cards = Vec::with_capacity(self.card_count);
        for (index, pair) in self.points.chunks_exact(2).enumerate() {
            let card = Rect::from_corners(pair[0], pair[1])
                .ok_or(CalibrationError::DegenerateRegion { index })?;
            cards.push(card);
        }
        cards.sort_by_key(|r| (r.y, r.x));
        TileSet::from_cards(&cards)
    }

    /// The calibrated tiles, once confirmed.
    pub fn into_tile_set(self) -> Result<TileSet, CalibrationError> {
        self.tiles.ok_or(CalibrationError::Incomplete {
            marked: self.points.len(),
            expected: self.card_count * 2,
        })
    }
}

/// Source of user decisions during manual calibration.
pub trait CalibrationInput {
    /// Number of cards the user wants to mark; `default` is the suggestion.
    fn card_count(&mut self, default: usize) -> usize;

    fn next_event(&mut self, session: &ManualCalibration) -> CalibrationEvent;
}

/// Drives a manual calibration session to completion.
pub fn run_manual<I: CalibrationInput>(
    input: &mut I,
    detected: usize,
) -> Result<TileSet, CalibrationError> {
    let card_count = input.card_count(default_card_count(detected));
    let mut session = ManualCalibration::new(card_count);
    info!("Manual calibration started for {} cards", session.card_count());

    loop {
        let event = input.next_event(&session);
        if session.handle(event)? == ManualState::Confirmed {
            info!("Manual calibration confirmed");
            return session.into_tile_set();
        }
    }
}
