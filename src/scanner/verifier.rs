use image::RgbImage;
use tracing::{debug, warn};

use super::box_detector::BoxDetector;
use super::geometry::Rect;
use super::tile::TileSet;
use crate::config::VerificationConfig;

/// Checks that a calibrated grid is still on screen.
#[derive(Debug, Clone, Default)]
pub struct LayoutVerifier {
    detector: BoxDetector,
    config: VerificationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutReport {
    pub candidates: usize,
    pub matched: usize,
    pub required: usize,
}

impl LayoutReport {
    pub fn is_match(&self) -> bool {
        self.candidates > 0 && self.matched >= self.required
    }
}

impl LayoutVerifier {
    pub fn new(detector: BoxDetector, config: VerificationConfig) -> Self {
        Self { detector, config }
    }

    pub fn verify(&self, frame: &RgbImage, tiles: &TileSet) -> LayoutReport {
        let candidates = self.detector.detect(frame);
        let matched = if candidates.is_empty() {
            0
        } else {
            count_matched(&candidates, tiles, self.config.iou_threshold)
        };
        let report = LayoutReport {
            candidates: candidates.len(),
            matched,
            required: tiles.len().min(self.config.min_matches),
        };
        debug!(
            "Layout check: {}/{} tiles matched ({} candidates)",
            report.matched, report.required, report.candidates
        );
        report
    }

    pub fn matches(&self, frame: &RgbImage, tiles: &TileSet) -> bool {
        self.verify(frame, tiles).is_match()
    }
}

/// Tiles whose card rectangle overlaps some candidate by at least `min_iou`.
pub fn count_matched(candidates: &[Rect], tiles: &TileSet, min_iou: f32) -> usize {
    tiles
        .cards()
        .filter(|card| candidates.iter().any(|c| c.iou(card) >= min_iou))
        .count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutState {
    Verified,
    Obstructed { attempts: u32 },
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort,
}

/// Decides what to do while the grid is hidden, e.g. behind a tooltip.
pub trait ObstructionHandler {
    fn on_obstructed(&mut self, attempts: u32, report: &LayoutReport) -> RetryDecision;
}

/// Tracks consecutive failed layout checks.
#[derive(Debug, Clone)]
pub struct ObstructionMonitor {
    state: LayoutState,
}

impl Default for ObstructionMonitor {
    fn default() -> Self {
        Self {
            state: LayoutState::Verified,
        }
    }
}

impl ObstructionMonitor {
    pub fn state(&self) -> LayoutState {
        self.state
    }

    pub fn observe<H: ObstructionHandler>(
        &mut self,
        report: &LayoutReport,
        handler: &mut H,
    ) -> LayoutState {
        if self.state == LayoutState::Aborted {
            return self.state;
        }
        if report.is_match() {
            self.state = LayoutState::Verified;
            return self.state;
        }

        let attempts = match self.state {
            LayoutState::Obstructed { attempts } => attempts + 1,
            _ => 1,
        };
        self.state = match handler.on_obstructed(attempts, report) {
            RetryDecision::Retry => LayoutState::Obstructed { attempts },
            RetryDecision::Abort => LayoutState::Aborted,
        };
        self.state
    }
}

/// Retries until `max_attempts` consecutive failures, or forever when unset.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(max_attempts: Option<u32>) -> Self {
        Self { max_attempts }
    }
}

impl ObstructionHandler for RetryPolicy {
    fn on_obstructed(&mut self, attempts: u32, report: &LayoutReport) -> RetryDecision {
        warn!(
            "Card grid obstructed ({}/{} tiles visible), attempt {}; clear the screen to continue",
            report.matched, report.required, attempts
        );
        match self.max_attempts {
            Some(max) if attempts >= max => RetryDecision::Abort,
            _ => RetryDecision::Retry,
        }
    }
}
