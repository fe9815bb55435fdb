use ab_glyph::{FontArc, PxScale};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use shared::Detection;
use std::path::Path;

/// Box colours, indexed by class id.
pub const COLORS: [[u8; 3]; 8] = [
    [4, 42, 255],    // #042aff
    [11, 219, 235],  // #0bdbeb
    [0, 223, 183],   // #00dfb7
    [255, 111, 221], // #ff6fdd
    [255, 68, 79],   // #ff444f
    [204, 237, 0],   // #cced00
    [0, 243, 68],    // #00f344
    [189, 0, 255],   // #bd00ff
];

const THICKNESS: i32 = 3;
const LABEL_HEIGHT: i32 = 18;
const LABEL_SCALE: f32 = 16.0;

pub fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(COLORS[class_id as usize % COLORS.len()])
}

/// Draws detection boxes and `<class> <confidence>` labels.
#[derive(Clone, Default)]
pub struct Annotator {
    font: Option<FontArc>,
}

impl Annotator {
    pub fn new(font: Option<FontArc>) -> Self {
        Self { font }
    }

    /// Loads a TrueType font for labels. Without one, boxes still get a coloured
    /// label tab but no text.
    pub fn from_font_path(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            log::info!("No label font configured, annotations will omit text");
            return Self::default();
        };

        let font = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|data| FontArc::try_from_vec(data).map_err(|e| e.to_string()));
        match font {
            Ok(font) => Self::new(Some(font)),
            Err(e) => {
                log::warn!("Failed to load font {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn font(&self) -> Option<&FontArc> {
        self.font.as_ref()
    }

    pub fn annotate(&self, image: &DynamicImage, detections: &[Detection]) -> RgbImage {
        let mut img = image.to_rgb8();
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return img;
        }
        let max_x = width as i32 - 1;
        let max_y = height as i32 - 1;

        for det in detections {
            let x1 = (det.bbox.x1.round() as i32).clamp(0, max_x);
            let y1 = (det.bbox.y1.round() as i32).clamp(0, max_y);
            let x2 = (det.bbox.x2.round() as i32).clamp(0, max_x);
            let y2 = (det.bbox.y2.round() as i32).clamp(0, max_y);
            if x2 <= x1 || y2 <= y1 {
                continue;
            }

            let color = class_color(det.class_id);
            for t in 0..THICKNESS {
                let (tx1, ty1) = (x1 + t, y1 + t);
                let (tx2, ty2) = (x2 - t, y2 - t);
                if tx2 > tx1 && ty2 > ty1 {
                    let rect = Rect::at(tx1, ty1).of_size((tx2 - tx1) as u32, (ty2 - ty1) as u32);
                    draw_hollow_rect_mut(&mut img, rect, color);
                }
            }

            self.draw_label(&mut img, det, color, x1, y1, y2);
        }

        img
    }

    fn draw_label(
        &self,
        img: &mut RgbImage,
        det: &Detection,
        color: Rgb<u8>,
        x1: i32,
        y1: i32,
        y2: i32,
    ) {
        let (width, height) = img.dimensions();
        let label = format!("{} {:.2}", det.class_name, det.confidence);

        // above the box if there is room, otherwise just inside it
        let label_y = if y1 >= LABEL_HEIGHT {
            y1 - LABEL_HEIGHT
        } else {
            (y1 + THICKNESS).min(y2)
        };
        let label_w = (label.len() as i32 * 9).min(width as i32 - x1).max(1);
        let label_h = LABEL_HEIGHT.min(height as i32 - label_y).max(1);
        draw_filled_rect_mut(
            img,
            Rect::at(x1, label_y).of_size(label_w as u32, label_h as u32),
            color,
        );

        if let Some(font) = &self.font {
            draw_text_mut(
                img,
                Rgb([255, 255, 255]),
                x1 + 2,
                label_y + 1,
                PxScale::from(LABEL_SCALE),
                font,
                &label,
            );
        }
    }
}
