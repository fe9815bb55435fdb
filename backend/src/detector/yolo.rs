//! Pre- and post-processing for YOLO-style detection heads.
//!
//! The model sees a letterboxed square input and emits one prediction per
//! anchor: `cx, cy, w, h` followed by one score per class.
#![cfg_attr(not(feature = "torch"), allow(dead_code))]

use image::{DynamicImage, Rgb, RgbImage, imageops::FilterType};
use ndarray::{ArrayView2, Axis, s};
use shared::{BoundingBox, Detection};

use super::{ClassFilter, DetectorError};

const PAD_VALUE: u8 = 114;

/// How an original image was mapped into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_left: f32,
    pub pad_top: f32,
    pub orig_width: u32,
    pub orig_height: u32,
}

impl Letterbox {
    pub fn compute(orig_width: u32, orig_height: u32, target: u32) -> Self {
        let scale = (target as f32 / orig_width as f32).min(target as f32 / orig_height as f32);
        let new_w = (orig_width as f32 * scale).round() as u32;
        let new_h = (orig_height as f32 * scale).round() as u32;
        Self {
            scale,
            pad_left: (target.saturating_sub(new_w) / 2) as f32,
            pad_top: (target.saturating_sub(new_h) / 2) as f32,
            orig_width,
            orig_height,
        }
    }

    /// Maps model-space corners back onto the original image, clipped to it.
    pub fn unmap(&self, x1: f32, y1: f32, x2: f32, y2: f32) -> [f32; 4] {
        let w = self.orig_width as f32;
        let h = self.orig_height as f32;
        [
            ((x1 - self.pad_left) / self.scale).clamp(0.0, w),
            ((y1 - self.pad_top) / self.scale).clamp(0.0, h),
            ((x2 - self.pad_left) / self.scale).clamp(0.0, w),
            ((y2 - self.pad_top) / self.scale).clamp(0.0, h),
        ]
    }
}

/// Resizes `image` into a `target`×`target` canvas, preserving aspect ratio.
pub fn letterbox(image: &DynamicImage, target: u32) -> (RgbImage, Letterbox) {
    let rgb = image.to_rgb8();
    let params = Letterbox::compute(rgb.width(), rgb.height(), target);
    let new_w = ((rgb.width() as f32 * params.scale).round() as u32).clamp(1, target);
    let new_h = ((rgb.height() as f32 * params.scale).round() as u32).clamp(1, target);

    let resized = image::imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(target, target, Rgb([PAD_VALUE; 3]));
    image::imageops::replace(
        &mut canvas,
        &resized,
        i64::from(params.pad_left as u32),
        i64::from(params.pad_top as u32),
    );
    (canvas, params)
}

/// Planar RGB floats in [0, 1], laid out as `[3, H, W]`.
pub fn to_chw(image: &RgbImage) -> Vec<f32> {
    let plane = (image.width() * image.height()) as usize;
    let mut data = vec![0.0f32; plane * 3];
    for (i, pixel) in image.pixels().enumerate() {
        data[i] = f32::from(pixel[0]) / 255.0;
        data[plane + i] = f32::from(pixel[1]) / 255.0;
        data[2 * plane + i] = f32::from(pixel[2]) / 255.0;
    }
    data
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeParams<'a> {
    pub confidence: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub num_classes: usize,
    pub classes: &'a ClassFilter,
}

/// Decodes a raw prediction matrix. Accepts `[4 + nc, anchors]` (the usual
/// export) as well as the transposed `[anchors, 4 + nc]` layout; the feature
/// axis is the one whose length matches `4 + num_classes`.
pub fn decode(
    output: ArrayView2<f32>,
    letterbox: &Letterbox,
    params: &DecodeParams,
) -> Result<Vec<Detection>, DetectorError> {
    let features = 4 + params.num_classes;
    let (rows, cols) = output.dim();
    let predictions = if rows == features {
        output.reversed_axes()
    } else if cols == features {
        output
    } else {
        return Err(DetectorError::Inference(format!(
            "unexpected prediction shape [{}, {}], expected {} features per anchor",
            rows, cols, features
        )));
    };

    let mut candidates: Vec<([f32; 4], f32, usize)> = Vec::new();
    for row in predictions.axis_iter(Axis(0)) {
        let scores = row.slice(s![4..]);
        let best = scores
            .iter()
            .enumerate()
            .filter(|(_, score)| !score.is_nan())
            .max_by(|(_, a), (_, b)| a.total_cmp(b));
        let Some((class_idx, &score)) = best else {
            continue;
        };
        if score < params.confidence || !params.classes.allows_id(class_idx as i64) {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let corners = letterbox.unmap(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
        candidates.push((corners, score, class_idx));
    }

    let detections = nms_per_class(&candidates, params.iou_threshold)
        .into_iter()
        .take(params.max_detections)
        .filter_map(|idx| {
            let ([x1, y1, x2, y2], score, class_idx) = candidates[idx];
            let class = shared::SupportedClass::from_id(class_idx as i64)?;
            Some(Detection::new(
                class,
                score,
                BoundingBox::from_corners(x1, y1, x2, y2),
            ))
        })
        .collect();
    Ok(detections)
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union > 0.0 { intersection / union } else { 0.0 }
}

/// Greedy NMS within each class. Returns kept indices, highest score first.
pub fn nms_per_class(boxes: &[([f32; 4], f32, usize)], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| boxes[b].1.total_cmp(&boxes[a].1));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for &i in &order {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order {
            if i != j
                && !suppressed[j]
                && boxes[j].2 == boxes[i].2
                && iou(&boxes[i].0, &boxes[j].0) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
    }
    keep
}
