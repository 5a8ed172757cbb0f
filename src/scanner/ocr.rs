use anyhow::{bail, Context, Result};
use image::{ImageFormat, RgbImage};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

use super::collaborators::OcrEngine;

/// Single-line OCR through the `tesseract` command-line tool.
pub struct TesseractOcr {
    binary: PathBuf,
}

impl TesseractOcr {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl OcrEngine for TesseractOcr {
    fn read(&self, image: &RgbImage) -> Result<String> {
        let input = tempfile::Builder::new()
            .prefix("arenascan-ocr-")
            .suffix(".png")
            .tempfile()?;
        image
            .save_with_format(input.path(), ImageFormat::Png)
            .context("Failed to write OCR input")?;

        let output = Command::new(&self.binary)
            .arg(input.path())
            .arg("stdout")
            .args(["--psm", "7", "-l", "eng"])
            .output()
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            bail!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!("OCR read {:?}", text.trim());
        Ok(text)
    }
}
