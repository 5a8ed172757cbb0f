use thiserror::Error;

use crate::scanner::geometry::Rect;

/// Failures that end a calibration attempt. None of them leave a tile set behind.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("manual calibration aborted by user")]
    Aborted,

    #[error("manual calibration incomplete: {marked} of {expected} corner points marked")]
    Incomplete { marked: usize, expected: usize },

    #[error("card {index} was marked with a zero-area region; please retry calibration")]
    DegenerateRegion { index: usize },

    #[error("card region {0:?} is too small to hold title and pip bands")]
    CardTooSmall(Rect),

    #[error("a tile set needs between 1 and {max} tiles, got {count}")]
    InvalidTileCount { count: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum TileSetError {
    #[error("calibration file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("calibration file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tile {index} is inconsistent: {reason}")]
    InvalidTile { index: usize, reason: &'static str },

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}
