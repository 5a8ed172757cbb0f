use anyhow::Result;
use image::RgbImage;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::collaborators::{FrameSource, PointerControl, SecondaryCapture};
use crate::config::IdentificationConfig;

/// Hovers the pointer over a card so the client shows its enlarged preview,
/// then grabs a frame. The pointer goes back where it was afterwards, even
/// when the capture fails.
pub struct HoverCapture<P, F> {
    pointer: P,
    frames: F,
    settle: Duration,
}

impl<P: PointerControl, F: FrameSource> HoverCapture<P, F> {
    pub fn new(pointer: P, frames: F, settle: Duration) -> Self {
        Self {
            pointer,
            frames,
            settle,
        }
    }

    /// Waits `hover_delay_ms` for the preview to appear before capturing.
    pub fn from_config(pointer: P, frames: F, config: &IdentificationConfig) -> Self {
        Self::new(pointer, frames, Duration::from_millis(config.hover_delay_ms))
    }
}

struct RestorePointer<'a, P: PointerControl> {
    pointer: &'a P,
    position: (i32, i32),
}

impl<P: PointerControl> Drop for RestorePointer<'_, P> {
    fn drop(&mut self) {
        let (x, y) = self.position;
        if let Err(e) = self.pointer.move_to(x, y) {
            warn!("Failed to restore pointer to ({}, {}): {}", x, y, e);
        }
    }
}

impl<P: PointerControl, F: FrameSource> SecondaryCapture for HoverCapture<P, F> {
    fn capture_at(&self, x: u32, y: u32) -> Result<RgbImage> {
        let _restore = RestorePointer {
            pointer: &self.pointer,
            position: self.pointer.position()?,
        };

        debug!("Hovering card at ({}, {})", x, y);
        self.pointer.move_to(x as i32, y as i32)?;
        thread::sleep(self.settle);
        self.frames.capture()
    }
}
