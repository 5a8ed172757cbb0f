use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Runtime configuration.
///
/// Every detection threshold is tuned for a 1080p-class capture of the
/// collection screen with the default card skin. Other resolutions need their
/// own values; nothing here is rescaled from the frame size.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub paths: PathsConfig,
    pub detection: DetectionConfig,
    pub calibration: CalibrationConfig,
    pub verification: VerificationConfig,
    pub identification: IdentificationConfig,
    pub pips: PipsConfig,
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub calibration_file: PathBuf,
    pub collection_csv: PathBuf,
    pub metrics_file: PathBuf,
    /// Directory of page screenshots to replay. Nothing is scanned without it.
    pub frames_dir: Option<PathBuf>,
    /// Where each scanned page is saved with its card and title boxes drawn.
    pub annotated_frames_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub blur_sigma: f32,
    pub canny_low: f32,
    pub canny_high: f32,
    /// Chebyshev radius of the dilation; 2 is a 5x5 square.
    pub dilate_radius: u8,
    pub min_area: u64,
    pub max_area: u64,
    pub min_aspect: f32,
    pub max_aspect: f32,
    /// Allowed band for a box's top edge, as fractions of frame height.
    pub min_top_fraction: f32,
    pub max_top_fraction: f32,
    pub nms_iou: f32,
    pub max_boxes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub min_auto_boxes: usize,
    pub tiles_per_row: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub iou_threshold: f32,
    pub min_matches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentificationConfig {
    pub max_hash_distance: u32,
    pub lookup_base_url: String,
    pub lookup_timeout_secs: u64,
    pub tesseract_path: PathBuf,
    /// Settle time between moving the pointer and capturing the hover preview.
    pub hover_delay_ms: u64,
    pub secondary_capture: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipsConfig {
    pub dark_threshold: u8,
    pub min_area: u32,
    pub max_area: u32,
    pub min_aspect: f32,
    pub max_aspect: f32,
    pub max_pips: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub recalibrate: bool,
    pub max_pages: usize,
    pub page_settle_ms: u64,
    pub obstruction_retry_ms: u64,
    /// `None` keeps waiting for an obstruction to clear forever on a live
    /// screen. Replayed frames never change, so they fall back to
    /// [`REPLAY_OBSTRUCTION_RETRIES`].
    pub max_obstruction_retries: Option<u32>,
}

pub const REPLAY_OBSTRUCTION_RETRIES: u32 = 3;

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/cache.sqlite3".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            calibration_file: data_dir.join("calibration.json"),
            collection_csv: data_dir.join("collection.csv"),
            metrics_file: data_dir.join("metrics.prom"),
            frames_dir: None,
            annotated_frames_dir: Some(data_dir.join("frames")),
            data_dir,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            blur_sigma: 1.1,
            canny_low: 70.0,
            canny_high: 170.0,
            dilate_radius: 2,
            min_area: 40_000,
            max_area: 300_000,
            min_aspect: 0.6,
            max_aspect: 0.9,
            min_top_fraction: 0.12,
            max_top_fraction: 0.92,
            nms_iou: 0.2,
            max_boxes: 12,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_auto_boxes: 10,
            tiles_per_row: 6,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.55,
            min_matches: 10,
        }
    }
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        Self {
            max_hash_distance: 5,
            lookup_base_url: "https://api.scryfall.com".to_string(),
            lookup_timeout_secs: 10,
            tesseract_path: PathBuf::from("tesseract"),
            hover_delay_ms: 250,
            secondary_capture: false,
        }
    }
}

impl Default for PipsConfig {
    fn default() -> Self {
        Self {
            dark_threshold: 60,
            min_area: 10,
            max_area: 300,
            min_aspect: 0.6,
            max_aspect: 1.6,
            max_pips: 4,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            recalibrate: false,
            max_pages: 500,
            page_settle_ms: 400,
            obstruction_retry_ms: 1000,
            max_obstruction_retries: None,
        }
    }
}

impl ScanConfig {
    /// Retry cap for a frame source; only a live screen may wait forever.
    pub fn obstruction_retry_limit(&self, live: bool) -> Option<u32> {
        match self.max_obstruction_retries {
            Some(max) => Some(max),
            None if live => None,
            None => Some(REPLAY_OBSTRUCTION_RETRIES),
        }
    }
}

impl Config {
    /// Defaults, then `arenascan.toml` if present, then `ARENASCAN__*`
    /// environment variables (e.g. `ARENASCAN__SCAN__MAX_PAGES=20`).
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::with_name("arenascan").required(false))
            .add_source(
                config::Environment::with_prefix("ARENASCAN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
