//! Seams to the outside world: screen, OCR, card lookup and pointer.
//!
//! All of these block; the scan pipeline calls them through
//! `tokio::task::spawn_blocking`.

use anyhow::Result;
use image::RgbImage;

use crate::models::CardIdentity;

/// Produces a full-resolution image of the current screen state.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> Result<RgbImage>;

    /// Whether repeated captures can show something new without a page turn.
    fn is_live(&self) -> bool {
        true
    }
}

/// Advances the collection view to its next page.
pub trait PageTurner: Send + Sync {
    fn next_page(&self) -> Result<()>;
}

/// Best-effort text recognition; may return empty or garbled text.
pub trait OcrEngine: Send + Sync {
    fn read(&self, image: &RgbImage) -> Result<String>;
}

/// Fuzzy card-name resolution. Implementations swallow their own transport
/// and parse failures and report them as `None`.
pub trait CardLookup: Send + Sync {
    fn lookup(&self, text: &str) -> Option<CardIdentity>;
}

/// Captures an enlarged preview of the card under a screen point.
pub trait SecondaryCapture: Send + Sync {
    fn capture_at(&self, x: u32, y: u32) -> Result<RgbImage>;
}

pub trait PointerControl: Send + Sync {
    fn position(&self) -> Result<(i32, i32)>;
    fn move_to(&self, x: i32, y: i32) -> Result<()>;
}
