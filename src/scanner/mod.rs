pub mod art_hash;
pub mod box_detector;
pub mod calibration;
pub mod collaborators;
pub mod geometry;
pub mod hover;
pub mod identification;
pub mod lookup;
pub mod ocr;
pub mod pips;
pub mod replay;
pub mod session;
pub mod terminal;
pub mod tile;
pub mod verifier;

pub use calibration::{CalibrationEvent, CalibrationInput, LayoutCalibrator, ManualCalibration};
pub use identification::IdentificationCascade;
pub use session::ScanSession;
pub use tile::{Tile, TileSet};
pub use verifier::{LayoutVerifier, RetryPolicy};
