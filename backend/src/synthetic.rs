//! Synthetic test images: random filled shapes over a faint grid.

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut, draw_hollow_polygon_mut,
    draw_hollow_rect_mut, draw_line_segment_mut, draw_polygon_mut, draw_text_mut,
};
use imageproc::point::Point;
use imageproc::rect::Rect;
use rand::Rng;

pub const MAX_DIMENSION: u32 = 4096;
pub const MAX_SHAPES: u32 = 100;

const GRID_STEP: usize = 40;
const GRID_COLOR: Rgb<u8> = Rgb([240, 240, 240]);
const BORDER_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const PALETTE: [[u8; 3]; 7] = [
    [0, 0, 255],
    [0, 255, 0],
    [255, 0, 0],
    [0, 255, 255],
    [255, 0, 255],
    [255, 255, 0],
    [128, 128, 128],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Rectangle,
    Circle,
    Triangle,
}

/// Draws `num_shapes` random rectangles, circles and triangles on a white
/// `width`×`height` canvas. The caption is only rendered when a font is given.
pub fn generate_test_image<R: Rng + ?Sized>(
    width: u32,
    height: u32,
    num_shapes: u32,
    rng: &mut R,
    font: Option<&FontArc>,
) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    if width == 0 || height == 0 {
        return img;
    }

    for x in (0..width).step_by(GRID_STEP) {
        draw_line_segment_mut(&mut img, (x as f32, 0.0), (x as f32, height as f32), GRID_COLOR);
    }
    for y in (0..height).step_by(GRID_STEP) {
        draw_line_segment_mut(&mut img, (0.0, y as f32), (width as f32, y as f32), GRID_COLOR);
    }

    for _ in 0..num_shapes {
        let shape = match rng.random_range(0..3) {
            0 => Shape::Rectangle,
            1 => Shape::Circle,
            _ => Shape::Triangle,
        };
        let color = Rgb(PALETTE[rng.random_range(0..PALETTE.len())]);
        let x = random_origin(rng, width);
        let y = random_origin(rng, height);
        let max_size = (width.min(height) / 4).max(2) as i32;
        let size = rng.random_range(max_size.min(30)..=max_size);

        draw_shape(&mut img, shape, x, y, size, color);
    }

    if let Some(font) = font {
        draw_text_mut(
            &mut img,
            BORDER_COLOR,
            10,
            (height as i32 - 30).max(0),
            PxScale::from(24.0),
            font,
            "Test Image",
        );
    }

    img
}

/// Top-left corner of a shape, keeping a margin on larger canvases.
fn random_origin<R: Rng + ?Sized>(rng: &mut R, extent: u32) -> i32 {
    if extent >= 150 {
        rng.random_range(50..=extent as i32 - 100)
    } else {
        rng.random_range(0..=(extent / 2) as i32)
    }
}

fn draw_shape(img: &mut RgbImage, shape: Shape, x: i32, y: i32, size: i32, color: Rgb<u8>) {
    match shape {
        Shape::Rectangle => {
            let rect = Rect::at(x, y).of_size(size as u32, size as u32);
            draw_filled_rect_mut(img, rect, color);
            draw_hollow_rect_mut(img, rect, BORDER_COLOR);
            if size > 2 {
                let inner = Rect::at(x + 1, y + 1).of_size(size as u32 - 2, size as u32 - 2);
                draw_hollow_rect_mut(img, inner, BORDER_COLOR);
            }
        }
        Shape::Circle => {
            let radius = (size / 2).max(1);
            let center = (x + radius, y + radius);
            draw_filled_circle_mut(img, center, radius, color);
            draw_hollow_circle_mut(img, center, radius, BORDER_COLOR);
            draw_hollow_circle_mut(img, center, radius - 1, BORDER_COLOR);
        }
        Shape::Triangle => {
            let corners = [
                Point::new(x, y + size),
                Point::new(x + size / 2, y),
                Point::new(x + size, y + size),
            ];
            draw_polygon_mut(img, &corners, color);
            let outline: Vec<Point<f32>> = corners
                .iter()
                .map(|p| Point::new(p.x as f32, p.y as f32))
                .collect();
            draw_hollow_polygon_mut(img, &outline, BORDER_COLOR);
        }
    }
}
