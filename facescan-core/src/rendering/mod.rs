//! rendering — face boxes, score labels and display-size output frames

use anyhow::{Context, Result};
use fast_image_resize as fr;
use image::{Rgb, RgbImage};
use imageproc::rect::Rect;

use crate::detection::FaceDetection;
use crate::video::RgbFrame;

/// Label baseline sits this many pixels above the box.
const LABEL_OFFSET: i32 = 10;
/// Glyph cell is 5×7 bits, advanced by 6 columns.
const GLYPH_ROWS: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;

#[derive(Debug, Clone, Copy)]
pub struct BoxStyle {
    pub color: [u8; 3],
    pub thickness: u32,
    /// Integer upscale of the bitmap label font; 0 disables labels.
    pub label_scale: u32,
}

impl Default for BoxStyle {
    fn default() -> Self {
        Self {
            color: [0, 255, 0],
            thickness: 2,
            label_scale: 2,
        }
    }
}

/// Draw every detection onto `frame` with a `face: 0.87` label above it.
pub fn draw_detections(
    frame: &mut RgbFrame,
    detections: &[FaceDetection],
    style: &BoxStyle,
) -> Result<()> {
    let mut img = frame.take_image()?;
    let color = Rgb(style.color);

    for det in detections {
        let [x1, y1, x2, y2] = det.to_pixels(img.width(), img.height());
        for t in 0..style.thickness as i32 {
            let w = (x2 - x1 - 2 * t).max(1) as u32;
            let h = (y2 - y1 - 2 * t).max(1) as u32;
            let rect = Rect::at(x1 + t, y1 + t).of_size(w, h);
            imageproc::drawing::draw_hollow_rect_mut(&mut img, rect, color);
        }

        if style.label_scale > 0 {
            let scale = style.label_scale as i32;
            let top = y1 - LABEL_OFFSET - GLYPH_ROWS * scale;
            draw_label(&mut img, x1, top, &format!("face: {:.2}", det.score), color, scale);
        }
    }

    frame.restore_image(img);
    Ok(())
}

/// Resize `frame` to exactly `width × height` (used for the annotated output).
pub fn resize_to(
    frame: &RgbFrame,
    width: u32,
    height: u32,
    resizer: &mut fr::Resizer,
) -> Result<RgbFrame> {
    let src =
        fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
            .context("failed to create display resize source")?;
    let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);
    let options = fr::ResizeOptions::new()
        .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    resizer
        .resize(&src, &mut dst, Some(&options))
        .context("display resize failed")?;
    Ok(RgbFrame {
        data: dst.into_vec(),
        width,
        height,
        pts: frame.pts,
    })
}

fn draw_label(img: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>, scale: i32) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = x + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if px >= 0 && px < w && py >= 0 && py < h {
                                img.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([
            0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'C' => Some([
            0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110,
        ]),
        'E' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'F' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000,
        ]),
        '0' => Some([
            0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110,
        ]),
        '1' => Some([
            0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        '2' => Some([
            0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111,
        ]),
        '3' => Some([
            0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110,
        ]),
        '4' => Some([
            0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010,
        ]),
        '5' => Some([
            0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '6' => Some([
            0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110,
        ]),
        '7' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000,
        ]),
        '8' => Some([
            0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110,
        ]),
        '9' => Some([
            0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100,
        ]),
        ':' => Some([0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::FACE_LABEL;

    fn pixel(frame: &RgbFrame, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * frame.width + x) * 3) as usize;
        [frame.data[i], frame.data[i + 1], frame.data[i + 2]]
    }

    #[test]
    fn box_edges_are_drawn_with_thickness() {
        let mut frame = RgbFrame::blank(100, 100);
        let det = FaceDetection {
            label: FACE_LABEL,
            score: 0.87,
            bbox: [0.2, 0.4, 0.6, 0.8],
        };
        let style = BoxStyle {
            label_scale: 0,
            ..BoxStyle::default()
        };
        draw_detections(&mut frame, &[det], &style).unwrap();

        assert_eq!(pixel(&frame, 20, 40), [0, 255, 0]);
        assert_eq!(pixel(&frame, 21, 41), [0, 255, 0]);
        assert_eq!(pixel(&frame, 30, 60), [0, 0, 0]);
        assert_eq!((frame.width, frame.height), (100, 100));
    }

    #[test]
    fn label_is_drawn_above_the_box() {
        let mut frame = RgbFrame::blank(200, 200);
        let det = FaceDetection {
            label: FACE_LABEL,
            score: 0.5,
            bbox: [0.1, 0.5, 0.4, 0.9],
        };
        draw_detections(&mut frame, &[det], &BoxStyle::default()).unwrap();

        // Label occupies rows [100 - 10 - 14, 100 - 10).
        let lit = (76..90)
            .flat_map(|y| (20..120).map(move |x| (x, y)))
            .filter(|&(x, y)| pixel(&frame, x, y) == [0, 255, 0])
            .count();
        assert!(lit > 0);
    }

    #[test]
    fn label_near_top_edge_is_clipped_not_panicking() {
        let mut frame = RgbFrame::blank(50, 50);
        let det = FaceDetection {
            label: FACE_LABEL,
            score: 0.99,
            bbox: [0.0, 0.0, 1.0, 1.0],
        };
        draw_detections(&mut frame, &[det], &BoxStyle::default()).unwrap();
    }

    #[test]
    fn resize_to_changes_dimensions_and_keeps_pts() {
        let mut frame = RgbFrame::blank(64, 48);
        frame.pts = 7;
        let mut resizer = fr::Resizer::new();
        let out = resize_to(&frame, 32, 16, &mut resizer).unwrap();
        assert_eq!((out.width, out.height, out.pts), (32, 16, 7));
        assert_eq!(out.data.len(), 32 * 16 * 3);
    }
}
