//! detection — FaceBoxes face detection over ONNX Runtime
//!
//! The network takes a letterboxed, single-channel, normalised frame and
//! emits one `loc` regression (`[N, 4]`) and one `conf` softmax (`[N, 2]`)
//! per prior box. Decoding, thresholding and NMS happen here; boxes are
//! returned normalised to the frame that was passed in.

pub mod letterbox;
pub mod priors;

use anyhow::{Context, Result, bail};
use fast_image_resize as fr;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

use crate::config::{DetectorConfig, PriorConfig};
use crate::video::RgbFrame;
use letterbox::Letterbox;
use priors::Prior;

/// Class index the detector uses for faces.
pub const FACE_LABEL: u32 = 1;

// ── Public types ─────────────────────────────────────────────────────────────

/// A detected face. `bbox` is `[x1, y1, x2, y2]` normalised to the frame the
/// detector was given.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceDetection {
    pub label: u32,
    pub score: f32,
    pub bbox: [f32; 4],
}

impl FaceDetection {
    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }
    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }
    /// IoU (intersection over union) with another detection.
    pub fn iou(&self, other: &FaceDetection) -> f32 {
        let ix1 = self.bbox[0].max(other.bbox[0]);
        let iy1 = self.bbox[1].max(other.bbox[1]);
        let ix2 = self.bbox[2].min(other.bbox[2]);
        let iy2 = self.bbox[3].min(other.bbox[3]);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Pixel corners for a `width × height` frame (truncated toward zero).
    pub fn to_pixels(&self, width: u32, height: u32) -> [i32; 4] {
        let (w, h) = (width as f32, height as f32);
        [
            (self.bbox[0] * w) as i32,
            (self.bbox[1] * h) as i32,
            (self.bbox[2] * w) as i32,
            (self.bbox[3] * h) as i32,
        ]
    }
}

/// Anything that can find faces in an RGB frame.
pub trait FaceDetector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<FaceDetection>>;
}

// ── FaceBoxes detector ───────────────────────────────────────────────────────

/// Wraps the FaceBoxes ONNX session and its cached prior boxes.
pub struct FaceBoxesDetector {
    session: Session,
    cfg: DetectorConfig,
    variance: [f32; 2],
    priors: Vec<Prior>,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl FaceBoxesDetector {
    /// Load the ONNX model at `model_path` and precompute anchors for the
    /// configured input size.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        cfg: DetectorConfig,
        prior_cfg: &PriorConfig,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let session = build_ort_session(model_path).with_context(|| {
            format!("failed to load FaceBoxes ONNX model {}", model_path.display())
        })?;
        let priors = priors::generate(prior_cfg, cfg.width(), cfg.height());
        debug!(
            priors = priors.len(),
            width = cfg.width(),
            height = cfg.height(),
            "face detector ready"
        );
        Ok(Self {
            session,
            variance: prior_cfg.variance,
            cfg,
            priors,
            resizer: fr::Resizer::new(),
            resize_buf: Vec::new(),
        })
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<(Letterbox, ort::value::DynValue)> {
        let lb = Letterbox::fit(frame.width, frame.height, self.cfg.width(), self.cfg.height());
        let plane = lb.fill_gray_plane(
            frame,
            &mut self.resizer,
            &mut self.resize_buf,
            self.cfg.mean,
            self.cfg.std,
        )?;

        // NCHW float tensor: [1, 1, H, W].
        let shape = [1usize, 1, self.cfg.height() as usize, self.cfg.width() as usize];
        let tensor = Tensor::from_array((shape, plane.into_boxed_slice()))
            .context("failed to create detector input tensor")?
            .into_dyn();
        Ok((lb, tensor))
    }
}

impl FaceDetector for FaceBoxesDetector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<FaceDetection>> {
        let (lb, input) = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs![self.cfg.input_name.as_str() => input])
            .context("FaceBoxes inference failed")?;

        let (_, loc) = outputs
            .get(self.cfg.loc_output.as_str())
            .with_context(|| format!("model has no output named {:?}", self.cfg.loc_output))?
            .try_extract_tensor::<f32>()
            .context("failed to extract loc tensor")?;
        let (_, conf) = outputs
            .get(self.cfg.conf_output.as_str())
            .with_context(|| format!("model has no output named {:?}", self.cfg.conf_output))?
            .try_extract_tensor::<f32>()
            .context("failed to extract conf tensor")?;

        let detections = postprocess(loc, conf, &self.priors, &self.cfg, self.variance)?;
        Ok(detections
            .into_iter()
            .map(|d| FaceDetection {
                bbox: lb.remove_pad_offset(d.bbox),
                ..d
            })
            .collect())
    }
}

/// Turn raw network outputs into detections in letterbox-normalised space:
/// score filter, `top_k`, NMS, `keep_top_k`.
pub fn postprocess(
    loc: &[f32],
    conf: &[f32],
    priors: &[Prior],
    cfg: &DetectorConfig,
    variance: [f32; 2],
) -> Result<Vec<FaceDetection>> {
    let n = priors.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    if loc.len() != n * 4 {
        bail!(
            "loc output has {} values, expected {} for {} priors",
            loc.len(),
            n * 4,
            n
        );
    }
    if conf.len() % n != 0 || conf.len() / n < 2 {
        bail!(
            "conf output has {} values, not a multiple of {} priors with 2+ classes",
            conf.len(),
            n
        );
    }
    let classes = conf.len() / n;

    let mut candidates: Vec<FaceDetection> = (0..n)
        .into_par_iter()
        .filter_map(|i| {
            let score = conf[i * classes + FACE_LABEL as usize];
            if score <= cfg.confidence_threshold {
                return None;
            }
            Some(FaceDetection {
                label: FACE_LABEL,
                score,
                bbox: priors::decode(&loc[i * 4..i * 4 + 4], &priors[i], variance),
            })
        })
        .collect();

    candidates.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(cfg.top_k);

    let mut kept = nms(candidates, cfg.nms_threshold);
    kept.truncate(cfg.keep_top_k);
    Ok(kept)
}

fn build_ort_session(model_path: &Path) -> Result<Session> {
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(threads)
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder = builder
        .with_parallel_execution(false)
        .context("failed to set ORT parallel execution")?;
    builder
        .commit_from_file(model_path)
        .context("failed to commit ORT session")
}

// ── Non-Maximum Suppression ──────────────────────────────────────────────────

/// Greedy NMS: sort by score descending, suppress overlapping boxes.
fn nms(mut boxes: Vec<FaceDetection>, iou_thresh: f32) -> Vec<FaceDetection> {
    boxes.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<FaceDetection> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if boxes[i].iou(&boxes[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(score: f32, bbox: [f32; 4]) -> FaceDetection {
        FaceDetection {
            label: FACE_LABEL,
            score,
            bbox,
        }
    }

    fn square_priors() -> Vec<Prior> {
        vec![
            Prior {
                cx: 0.25,
                cy: 0.25,
                w: 0.2,
                h: 0.2,
            },
            Prior {
                cx: 0.26,
                cy: 0.25,
                w: 0.2,
                h: 0.2,
            },
            Prior {
                cx: 0.75,
                cy: 0.75,
                w: 0.2,
                h: 0.2,
            },
        ]
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = det(0.9, [0.0, 0.0, 0.5, 0.5]);
        let b = det(0.8, [0.5, 0.5, 1.0, 1.0]);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn nms_drops_lower_scoring_overlap() {
        let boxes = vec![
            det(0.6, [0.0, 0.0, 0.5, 0.5]),
            det(0.9, [0.01, 0.0, 0.51, 0.5]),
            det(0.7, [0.6, 0.6, 0.9, 0.9]),
        ];
        let kept = nms(boxes, 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.7);
    }

    #[test]
    fn postprocess_filters_decodes_and_suppresses() {
        let priors = square_priors();
        let loc = vec![0.0; 12];
        // [background, face] per prior.
        let conf = vec![0.1, 0.9, 0.2, 0.8, 0.99, 0.01];
        let cfg = DetectorConfig::default();

        let out = postprocess(&loc, &conf, &priors, &cfg, [0.1, 0.2]).unwrap();
        // Prior 1 overlaps prior 0 and scores lower; prior 2 is below threshold.
        assert_eq!(out.len(), 1);
        assert!((out[0].score - 0.9).abs() < 1e-6);
        let expect = [0.15, 0.15, 0.35, 0.35];
        for (got, want) in out[0].bbox.iter().zip(expect) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn postprocess_respects_keep_top_k() {
        let priors = square_priors();
        let loc = vec![0.0; 12];
        let conf = vec![0.1, 0.9, 0.2, 0.8, 0.3, 0.7];
        let cfg = DetectorConfig {
            nms_threshold: 1.0,
            keep_top_k: 2,
            ..DetectorConfig::default()
        };
        let out = postprocess(&loc, &conf, &priors, &cfg, [0.1, 0.2]).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].score >= out[1].score);
    }

    #[test]
    fn postprocess_rejects_shape_mismatch() {
        let priors = square_priors();
        let cfg = DetectorConfig::default();
        assert!(postprocess(&[0.0; 8], &[0.0; 6], &priors, &cfg, [0.1, 0.2]).is_err());
        assert!(postprocess(&[0.0; 12], &[0.0; 3], &priors, &cfg, [0.1, 0.2]).is_err());
    }

    #[test]
    fn to_pixels_truncates() {
        let d = det(0.9, [0.1, 0.2, 0.55, 0.99]);
        assert_eq!(d.to_pixels(100, 50), [10, 10, 55, 49]);
    }
}
