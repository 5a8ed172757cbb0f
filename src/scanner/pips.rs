use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::HashMap;

use crate::config::PipsConfig;

/// Counts the dark ownership pips in a tile's dot band.
#[derive(Debug, Clone, Default)]
pub struct PipCounter {
    config: PipsConfig,
}

#[derive(Debug, Clone, Copy)]
struct Blob {
    area: u32,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl Blob {
    fn new(x: u32, y: u32) -> Self {
        Self {
            area: 0,
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.area += 1;
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    fn aspect_ratio(&self) -> f32 {
        (self.max_x - self.min_x + 1) as f32 / (self.max_y - self.min_y + 1) as f32
    }
}

impl PipCounter {
    pub fn new(config: PipsConfig) -> Self {
        Self { config }
    }

    pub fn count(&self, dots: &RgbImage) -> u32 {
        if dots.width() == 0 || dots.height() == 0 {
            return 0;
        }

        let mask = self.dark_mask(dots);
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

        let mut blobs: HashMap<u32, Blob> = HashMap::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label.0[0];
            if label == 0 {
                continue;
            }
            blobs.entry(label).or_insert_with(|| Blob::new(x, y)).add(x, y);
        }

        let round = blobs
            .values()
            .filter(|b| b.area >= self.config.min_area && b.area <= self.config.max_area)
            .filter(|b| {
                let ratio = b.aspect_ratio();
                ratio > self.config.min_aspect && ratio < self.config.max_aspect
            })
            .count() as u32;

        round.min(self.config.max_pips)
    }

    /// Dark pixels become foreground; speckle is removed by a median filter
    /// and a morphological opening.
    fn dark_mask(&self, dots: &RgbImage) -> GrayImage {
        let gray = image::imageops::grayscale(dots);
        let smoothed = imageproc::filter::median_filter(&gray, 1, 1);
        let threshold = self.config.dark_threshold;
        let binary = GrayImage::from_fn(smoothed.width(), smoothed.height(), |x, y| {
            if smoothed.get_pixel(x, y).0[0] > threshold {
                Luma([0])
            } else {
                Luma([255])
            }
        });
        imageproc::morphology::open(&binary, Norm::L1, 1)
    }
}
