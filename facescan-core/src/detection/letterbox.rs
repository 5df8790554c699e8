//! Aspect-preserving resize into the network input, and its inverse.

use anyhow::{Context, Result};
use fast_image_resize as fr;

use crate::video::RgbFrame;

/// Geometry of fitting a `src_w × src_h` frame into a `target_w × target_h`
/// canvas: uniform scale, centred, zero padding on the short axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub target_w: u32,
    pub target_h: u32,
    pub scaled_w: u32,
    pub scaled_h: u32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    pub fn fit(src_w: u32, src_h: u32, target_w: u32, target_h: u32) -> Self {
        let scale = (target_w as f32 / src_w.max(1) as f32)
            .min(target_h as f32 / src_h.max(1) as f32);
        let scaled_w = ((src_w as f32 * scale).round() as u32).clamp(1, target_w);
        let scaled_h = ((src_h as f32 * scale).round() as u32).clamp(1, target_h);
        Self {
            target_w,
            target_h,
            scaled_w,
            scaled_h,
            pad_x: (target_w - scaled_w) / 2,
            pad_y: (target_h - scaled_h) / 2,
        }
    }

    /// Map a normalised `[x1, y1, x2, y2]` box in the padded canvas back to
    /// normalised coordinates of the unpadded frame.
    pub fn remove_pad_offset(&self, bbox: [f32; 4]) -> [f32; 4] {
        let map_x = |x: f32| {
            ((x * self.target_w as f32 - self.pad_x as f32) / self.scaled_w as f32).clamp(0.0, 1.0)
        };
        let map_y = |y: f32| {
            ((y * self.target_h as f32 - self.pad_y as f32) / self.scaled_h as f32).clamp(0.0, 1.0)
        };
        [map_x(bbox[0]), map_y(bbox[1]), map_x(bbox[2]), map_y(bbox[3])]
    }

    /// Resize `frame` into the canvas and write a normalised single-channel
    /// plane (`(luma / 255 - mean) / std`) of `target_w × target_h` floats.
    pub fn fill_gray_plane(
        &self,
        frame: &RgbFrame,
        resizer: &mut fr::Resizer,
        resize_buf: &mut Vec<u8>,
        mean: f32,
        std: f32,
    ) -> Result<Vec<f32>> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create letterbox resize source")?;

        let out_len = (self.scaled_w * self.scaled_h * 3) as usize;
        if resize_buf.len() != out_len {
            resize_buf.resize(out_len, 0);
        }
        let mut dst = fr::images::Image::from_vec_u8(
            self.scaled_w,
            self.scaled_h,
            std::mem::take(resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create letterbox resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        resizer
            .resize(&src, &mut dst, Some(&options))
            .context("letterbox resize failed")?;
        *resize_buf = dst.into_vec();

        let pad_value = (0.0 - mean) / std;
        let canvas_w = self.target_w as usize;
        let mut plane = vec![pad_value; canvas_w * self.target_h as usize];
        let scaled_w = self.scaled_w as usize;
        for row in 0..self.scaled_h as usize {
            let dst_start = (self.pad_y as usize + row) * canvas_w + self.pad_x as usize;
            let src_row = &resize_buf[row * scaled_w * 3..(row + 1) * scaled_w * 3];
            for (out, px) in plane[dst_start..dst_start + scaled_w]
                .iter_mut()
                .zip(src_row.chunks_exact(3))
            {
                // BT.601 luminance
                let luma = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                *out = (luma / 255.0 - mean) / std;
            }
        }
        Ok(plane)
    }
}
