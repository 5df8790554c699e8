use std::time::{Duration, Instant};

use anyhow::Result;
use fast_image_resize as fr;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::detection::{FaceDetection, FaceDetector};
use crate::enhance::Enhancer;
use crate::rendering::{BoxStyle, draw_detections, resize_to};
use crate::video::RgbFrame;

/// Result of scanning a single frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutcome {
    /// Detections above the score threshold, from the first pyramid level
    /// that produced any.
    pub detections: Vec<FaceDetection>,
    /// Pyramid level the detections came from.
    pub level: Option<u32>,
    /// Levels the detector actually ran on.
    pub levels_tried: u32,
}

impl FrameOutcome {
    pub fn detected(&self) -> bool {
        !self.detections.is_empty()
    }

    pub fn scores(&self) -> impl Iterator<Item = f32> + '_ {
        self.detections.iter().map(|d| d.score)
    }
}

/// Multi-scale retry scanner: enhance the frame, then run the detector on
/// progressively smaller copies until one yields a face above threshold.
pub struct Scanner<D> {
    detector: D,
    enhancer: Enhancer,
    cfg: ScanConfig,
    style: BoxStyle,
    resizer: fr::Resizer,
    prof_frames: u64,
    prof_enhance: Duration,
    prof_detect: Duration,
}

impl<D: FaceDetector> Scanner<D> {
    pub fn new(detector: D, cfg: ScanConfig) -> Self {
        Self {
            detector,
            enhancer: Enhancer::from_config(&cfg),
            cfg,
            style: BoxStyle::default(),
            resizer: fr::Resizer::new(),
            prof_frames: 0,
            prof_enhance: Duration::ZERO,
            prof_detect: Duration::ZERO,
        }
    }

    pub fn with_style(mut self, style: BoxStyle) -> Self {
        self.style = style;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.cfg
    }

    /// Scan `frame`; when faces are found they are drawn onto `frame` itself.
    pub fn scan_frame(&mut self, frame: &mut RgbFrame) -> Result<FrameOutcome> {
        let enhance_start = Instant::now();
        let enhanced = self.enhancer.apply(frame)?;
        self.prof_enhance += enhance_start.elapsed();

        let detect_start = Instant::now();
        let mut outcome = FrameOutcome::default();

        for level in 0..self.cfg.pyramid_levels {
            let scale = self.cfg.scale_at(level);
            let w = (enhanced.width as f32 * scale) as u32;
            let h = (enhanced.height as f32 * scale) as u32;
            if w < self.cfg.min_side || h < self.cfg.min_side {
                break;
            }

            let scaled;
            let input = if level == 0 {
                &enhanced
            } else {
                scaled = resize_to(&enhanced, w, h, &mut self.resizer)?;
                &scaled
            };

            outcome.levels_tried += 1;
            let detections = match self.detector.detect(input) {
                Ok(d) => d,
                Err(e) => {
                    warn!(level, "detection error: {e:#}");
                    continue;
                }
            };

            let accepted: Vec<FaceDetection> = detections
                .into_iter()
                .filter(|d| d.score > self.cfg.score_threshold)
                .collect();
            if accepted.is_empty() {
                continue;
            }

            for det in &accepted {
                info!("Detection confidence: {}", det.score);
            }
            debug!(level, scale, faces = accepted.len(), "faces found");
            draw_detections(frame, &accepted, &self.style)?;
            outcome.detections = accepted;
            outcome.level = Some(level);
            break;
        }
        self.prof_detect += detect_start.elapsed();

        self.prof_frames += 1;
        if self.prof_frames % 300 == 0 {
            info!(
                frames = self.prof_frames,
                enhance_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_enhance.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                detect_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_detect.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "scan timings"
            );
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::FACE_LABEL;
    use anyhow::bail;
    use std::collections::HashMap;

    /// Returns canned detections keyed by input width; records every width.
    #[derive(Default)]
    struct ScriptedDetector {
        by_width: HashMap<u32, Vec<f32>>,
        fail_widths: Vec<u32>,
        calls: Vec<u32>,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<FaceDetection>> {
            self.calls.push(frame.width);
            if self.fail_widths.contains(&frame.width) {
                bail!("scripted failure");
            }
            Ok(self
                .by_width
                .get(&frame.width)
                .map(|scores| {
                    scores
                        .iter()
                        .map(|&score| FaceDetection {
                            label: FACE_LABEL,
                            score,
                            bbox: [0.25, 0.25, 0.75, 0.75],
                        })
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn scanner(detector: ScriptedDetector) -> Scanner<ScriptedDetector> {
        Scanner::new(detector, ScanConfig::default())
    }

    #[test]
    fn stops_at_first_level_with_a_face() {
        let mut det = ScriptedDetector::default();
        // 400 → 300 → 225: faces appear at level 1.
        det.by_width.insert(300, vec![0.9, 0.3]);
        det.by_width.insert(225, vec![0.95]);
        let mut s = scanner(det);

        let mut frame = RgbFrame::blank(400, 200);
        let outcome = s.scan_frame(&mut frame).unwrap();

        assert_eq!(outcome.level, Some(1));
        assert_eq!(outcome.scores().collect::<Vec<_>>(), vec![0.9]);
        assert_eq!(s.detector.calls, vec![400, 300]);
        // Box drawn on the original frame at (100, 50).
        let i = ((50 * 400 + 100) * 3) as usize;
        assert_eq!(&frame.data[i..i + 3], &[0, 255, 0]);
    }

    #[test]
    fn threshold_is_strict() {
        let mut det = ScriptedDetector::default();
        det.by_width.insert(400, vec![0.5]);
        let mut s = scanner(det);

        let mut frame = RgbFrame::blank(400, 400);
        let outcome = s.scan_frame(&mut frame).unwrap();
        assert!(!outcome.detected());
        assert_eq!(outcome.levels_tried, 5);
        assert!(frame.data.iter().all(|&p| p == 0));
    }

    #[test]
    fn pyramid_stops_below_min_side() {
        let mut s = scanner(ScriptedDetector::default());
        // Heights: 50, 37, 28 → third level is below 30.
        let mut frame = RgbFrame::blank(200, 50);
        let outcome = s.scan_frame(&mut frame).unwrap();
        assert_eq!(outcome.levels_tried, 2);
        assert_eq!(s.detector.calls, vec![200, 150]);
    }

    #[test]
    fn tiny_frame_is_never_scanned() {
        let mut s = scanner(ScriptedDetector::default());
        let mut frame = RgbFrame::blank(20, 20);
        let outcome = s.scan_frame(&mut frame).unwrap();
        assert_eq!(outcome.levels_tried, 0);
        assert!(s.detector.calls.is_empty());
    }

    #[test]
    fn detector_error_moves_to_next_level() {
        let mut det = ScriptedDetector::default();
        det.fail_widths.push(400);
        det.by_width.insert(300, vec![0.8]);
        let mut s = scanner(det);

        let mut frame = RgbFrame::blank(400, 400);
        let outcome = s.scan_frame(&mut frame).unwrap();
        assert_eq!(outcome.level, Some(1));
    }
}
