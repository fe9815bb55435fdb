//! Edge/contour heuristic used when no model is available.
//!
//! This localises high-contrast blobs only. Labels and confidences are drawn
//! at random from the requested classes, so results are not classifications.

use image::DynamicImage;
use imageproc::contours::{BorderType, Contour, find_contours};
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use rand::Rng;
use shared::{BoundingBox, Detection};

use super::{ClassFilter, Detector, DetectorError};

/// Contours smaller than this fraction of the image are ignored.
const MIN_AREA_FRACTION: f32 = 0.01;
const MAX_DETECTIONS: usize = 5;
// sigma matching a 5x5 Gaussian kernel
const BLUR_SIGMA: f32 = 1.1;
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct ContourDetector;

impl ContourDetector {
    pub fn new() -> Self {
        Self
    }

    /// Axis-aligned boxes of the qualifying external contours, in discovery order.
    pub fn blob_boxes(&self, image: &DynamicImage) -> Vec<BoundingBox> {
        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();
        if width < 3 || height < 3 {
            return Vec::new();
        }

        let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);
        let edges = canny(&blurred, CANNY_LOW, CANNY_HIGH);
        let min_area = MIN_AREA_FRACTION * width as f32 * height as f32;

        find_contours::<i32>(&edges)
            .iter()
            .filter(|contour| contour.border_type == BorderType::Outer && contour.parent.is_none())
            .filter(|contour| polygon_area(contour) >= min_area)
            .filter_map(bounding_rect)
            .take(MAX_DETECTIONS)
            .collect()
    }
}

impl Detector for ContourDetector {
    fn name(&self) -> &'static str {
        "contour"
    }

    /// `confidence` is not applied: the heuristic has no real scores.
    fn detect(
        &self,
        image: &DynamicImage,
        _confidence: f32,
        classes: &ClassFilter,
    ) -> Result<Vec<Detection>, DetectorError> {
        let choices = classes.classes();
        if choices.is_empty() {
            return Ok(Vec::new());
        }

        let mut rng = rand::rng();
        let detections = self
            .blob_boxes(image)
            .into_iter()
            .map(|bbox| {
                let class = choices[rng.random_range(0..choices.len())];
                let confidence: f32 = rng.random_range(0.5..=0.9);
                Detection::new(class, confidence, bbox)
            })
            .collect();
        Ok(detections)
    }
}

/// Shoelace area of the traced border polygon.
fn polygon_area(contour: &Contour<i32>) -> f32 {
    let points = &contour.points;
    if points.len() < 3 {
        return 0.0;
    }
    let twice_area: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y))
        .sum();
    twice_area.abs() as f32 / 2.0
}

fn bounding_rect(contour: &Contour<i32>) -> Option<BoundingBox> {
    let min_x = contour.points.iter().map(|p| p.x).min()?;
    let max_x = contour.points.iter().map(|p| p.x).max()?;
    let min_y = contour.points.iter().map(|p| p.y).min()?;
    let max_y = contour.points.iter().map(|p| p.y).max()?;
    // inclusive pixel extents, as an OpenCV bounding rect would report
    Some(BoundingBox::from_corners(
        min_x as f32,
        min_y as f32,
        (max_x + 1) as f32,
        (max_y + 1) as f32,
    ))
}
