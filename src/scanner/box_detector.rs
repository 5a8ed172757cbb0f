use image::{GrayImage, RgbImage};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::distance_transform::Norm;
use tracing::debug;

use super::geometry::Rect;
use crate::config::DetectionConfig;

/// Finds card-shaped rectangles in a frame from edge contours.
#[derive(Debug, Clone, Default)]
pub struct BoxDetector {
    config: DetectionConfig,
}

impl BoxDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// Candidate card boxes ordered by descending area, at most `max_boxes`.
    /// An empty result just means nothing card-like was visible.
    pub fn detect(&self, frame: &RgbImage) -> Vec<Rect> {
        let edges = self.edge_map(frame);
        let frame_height = frame.height();

        let candidates: Vec<Rect> = find_contours::<u32>(&edges)
            .iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
            .filter_map(bounding_rect)
            .filter(|rect| self.is_candidate(rect, frame_height))
            .collect();

        debug!("Box detector kept {} card-shaped contours", candidates.len());

        suppress_overlaps(candidates, self.config.nms_iou, self.config.max_boxes)
    }

    /// Grayscale, blur, Canny, then dilate to close gaps along card borders.
    fn edge_map(&self, frame: &RgbImage) -> GrayImage {
        let gray = image::imageops::grayscale(frame);
        let blurred = imageproc::filter::gaussian_blur_f32(&gray, self.config.blur_sigma);
        let edges =
            imageproc::edges::canny(&blurred, self.config.canny_low, self.config.canny_high);
        imageproc::morphology::dilate(&edges, Norm::LInf, self.config.dilate_radius)
    }

    fn is_candidate(&self, rect: &Rect, frame_height: u32) -> bool {
        let area = rect.area();
        if area < self.config.min_area || area > self.config.max_area {
            return false;
        }

        let aspect_ratio = rect.aspect_ratio();
        if aspect_ratio <= self.config.min_aspect || aspect_ratio >= self.config.max_aspect {
            return false;
        }

        // Skip header and footer chrome.
        let top = rect.y as f32;
        let height = frame_height as f32;
        top > height * self.config.min_top_fraction && top < height * self.config.max_top_fraction
    }
}

fn bounding_rect(contour: &Contour<u32>) -> Option<Rect> {
    let first = contour.points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for point in &contour.points {
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }
    Rect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}

/// Greedy non-maximum suppression: largest first, a box is kept only while
/// its IoU with every kept box stays below `max_iou`.
pub fn suppress_overlaps(mut boxes: Vec<Rect>, max_iou: f32, limit: usize) -> Vec<Rect> {
    boxes.sort_by(|a, b| {
        b.area()
            .cmp(&a.area())
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });

    let mut kept: Vec<Rect> = Vec::with_capacity(limit);
    for candidate in boxes {
        if kept.len() >= limit {
            break;
        }
        if kept.iter().all(|k| candidate.iou(k) < max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect as DrawRect;

    pub const CARD_W: u32 = 180;
    pub const CARD_H: u32 = 250;

    /// Known card positions on the synthetic 1300x720 page, row-major.
    pub fn grid_cards() -> Vec<Rect> {
        (0..12u32)
            .map(|i| Rect::new(30 + (i % 6) * 210, 100 + (i / 6) * 290, CARD_W, CARD_H).unwrap())
            .collect()
    }

    pub fn blank_frame() -> RgbImage {
        RgbImage::from_pixel(1300, 720, Rgb([28, 30, 36]))
    }

    pub fn paint_cards(frame: &mut RgbImage, cards: &[Rect]) {
        for card in cards {
            draw_filled_rect_mut(
                frame,
                DrawRect::at(card.x as i32, card.y as i32).of_size(card.width, card.height),
                Rgb([210, 200, 180]),
            );
        }
    }

    pub fn grid_frame() -> RgbImage {
        let mut frame = blank_frame();
        paint_cards(&mut frame, &grid_cards());
        frame
    }

    fn rect(x: u32, y: u32, w: u32, h: u32) -> Rect {
        Rect::new(x, y, w, h).unwrap()
    }

    #[test]
    fn detects_every_card_on_synthetic_page() {
        let boxes = BoxDetector::default().detect(&grid_frame());
        assert_eq!(boxes.len(), 12);
        for card in grid_cards() {
            assert!(
                boxes.iter().any(|b| b.iou(&card) > 0.9),
                "no detection for {:?}",
                card
            );
        }
        for pair in boxes.windows(2) {
            assert!(pair[0].area() >= pair[1].area());
        }
    }

    #[test]
    fn empty_frame_yields_nothing() {
        assert!(BoxDetector::default().detect(&blank_frame()).is_empty());
    }

    #[test]
    fn header_chrome_is_ignored() {
        let mut frame = blank_frame();
        // Card-shaped panel starting in the top 12% of the frame.
        paint_cards(&mut frame, &[rect(400, 20, CARD_W, CARD_H)]);
        assert!(BoxDetector::default().detect(&frame).is_empty());
    }

    #[test]
    fn wide_rectangles_are_not_cards() {
        let mut frame = blank_frame();
        paint_cards(&mut frame, &[rect(200, 200, 400, 200)]);
        assert!(BoxDetector::default().detect(&frame).is_empty());
    }

    #[test]
    fn suppression_drops_heavy_overlaps() {
        let boxes = vec![
            rect(0, 0, 100, 100),
            rect(5, 5, 100, 100),
            rect(300, 0, 120, 120),
            rect(150, 0, 90, 90),
        ];
        let kept = suppress_overlaps(boxes, 0.2, 12);
        assert_eq!(
            kept,
            vec![rect(300, 0, 120, 120), rect(0, 0, 100, 100), rect(150, 0, 90, 90)]
        );
    }

    #[test]
    fn suppression_invariants_hold() {
        let mut boxes = Vec::new();
        for i in 0..40u32 {
            boxes.push(rect((i * 37) % 400, (i * 53) % 300, 60 + i % 7 * 10, 80 + i % 5 * 10));
        }
        let kept = suppress_overlaps(boxes, 0.2, 12);
        assert!(kept.len() <= 12);
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                assert!(a.iou(b) < 0.2);
            }
        }
        for pair in kept.windows(2) {
            assert!(pair[0].area() >= pair[1].area());
        }
    }

    #[test]
    fn suppression_caps_result() {
        let boxes: Vec<Rect> = (0..30).map(|i| rect(i * 200, 0, 100, 100)).collect();
        assert_eq!(suppress_overlaps(boxes, 0.2, 12).len(), 12);
    }
}
