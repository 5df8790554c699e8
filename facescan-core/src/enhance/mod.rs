//! enhance — contrast/brightness scaling and Gaussian denoise
//!
//! Applied to a copy of every frame before it enters the detection pyramid.
//! The annotated output is always drawn on the untouched original.

use anyhow::Result;
use rayon::prelude::*;

use crate::config::ScanConfig;
use crate::video::RgbFrame;

/// `saturate_u8(|alpha * p + beta|)` per channel, halves rounded to even.
pub fn adjust_brightness_contrast(frame: &mut RgbFrame, alpha: f32, beta: f32) {
    frame.data.par_iter_mut().for_each(|p| {
        *p = (alpha * *p as f32 + beta).abs().round_ties_even().min(255.0) as u8;
    });
}

/// Gaussian sigma used for a `kernel`-wide blur when no sigma is given.
pub fn sigma_for_kernel(kernel: u32) -> f32 {
    0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Gaussian blur equivalent to a `kernel × kernel` window. A kernel of 1 is a
/// no-op.
pub fn denoise(frame: &mut RgbFrame, kernel: u32) -> Result<()> {
    if kernel <= 1 {
        return Ok(());
    }
    let img = frame.take_image()?;
    let blurred = imageproc::filter::gaussian_blur_f32(&img, sigma_for_kernel(kernel));
    frame.restore_image(blurred);
    Ok(())
}

/// The per-frame enhancement chain.
#[derive(Debug, Clone, Copy)]
pub struct Enhancer {
    pub alpha: f32,
    pub beta: f32,
    pub blur_kernel: u32,
}

impl Enhancer {
    pub fn from_config(cfg: &ScanConfig) -> Self {
        Self {
            alpha: cfg.contrast_alpha,
            beta: cfg.brightness_beta,
            blur_kernel: cfg.blur_kernel,
        }
    }

    /// Return an enhanced copy of `frame`.
    pub fn apply(&self, frame: &RgbFrame) -> Result<RgbFrame> {
        let mut out = frame.clone();
        adjust_brightness_contrast(&mut out, self.alpha, self.beta);
        denoise(&mut out, self.blur_kernel)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: u32, height: u32, value: u8) -> RgbFrame {
        RgbFrame {
            data: vec![value; (width * height * 3) as usize],
            width,
            height,
            pts: 0,
        }
    }

    #[test]
    fn contrast_saturates_and_takes_absolute_value() {
        let mut frame = RgbFrame {
            data: vec![0, 10, 100, 200, 255, 50],
            width: 2,
            height: 1,
            pts: 0,
        };
        adjust_brightness_contrast(&mut frame, 1.5, 50.0);
        assert_eq!(frame.data, vec![50, 65, 200, 255, 255, 125]);

        let mut frame = RgbFrame {
            data: vec![100, 0, 20],
            width: 1,
            height: 1,
            pts: 0,
        };
        adjust_brightness_contrast(&mut frame, -1.0, 0.0);
        assert_eq!(frame.data, vec![100, 0, 20]);
    }

    #[test]
    fn contrast_rounds_halves_to_even() {
        let mut frame = RgbFrame {
            data: vec![1, 3, 5, 7, 9, 11],
            width: 2,
            height: 1,
            pts: 0,
        };
        adjust_brightness_contrast(&mut frame, 1.5, 50.0);
        // 51.5, 54.5, 57.5, 60.5, 63.5, 66.5
        assert_eq!(frame.data, vec![52, 54, 58, 60, 64, 66]);
    }

    #[test]
    fn sigma_matches_five_tap_kernel() {
        assert!((sigma_for_kernel(5) - 1.1).abs() < 1e-6);
        assert!((sigma_for_kernel(3) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn blur_keeps_flat_image_flat() {
        let mut frame = flat(16, 12, 77);
        denoise(&mut frame, 5).unwrap();
        assert_eq!((frame.width, frame.height), (16, 12));
        assert!(frame.data.iter().all(|&p| (p as i32 - 77).abs() <= 1));
    }

    #[test]
    fn blur_spreads_a_single_bright_pixel() {
        let mut frame = flat(9, 9, 0);
        let centre = (4 * 9 + 4) * 3;
        frame.data[centre..centre + 3].copy_from_slice(&[255, 255, 255]);
        denoise(&mut frame, 5).unwrap();
        let neighbour = (4 * 9 + 5) * 3;
        assert!(frame.data[centre] < 255);
        assert!(frame.data[neighbour] > 0);
    }

    #[test]
    fn enhancer_leaves_source_untouched() {
        let frame = flat(8, 8, 10);
        let enhancer = Enhancer::from_config(&ScanConfig::default());
        let out = enhancer.apply(&frame).unwrap();
        assert!(frame.data.iter().all(|&p| p == 10));
        assert!(out.data.iter().all(|&p| (p as i32 - 65).abs() <= 1));
    }
}
