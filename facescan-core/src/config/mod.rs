//! config — detector YAML files and scan parameters
//!
//! The detector ships with two YAML files: `faceBoxesV2Cfg.yaml` describes the
//! network input and post-processing, `priorCfg.yaml` the anchor layout. Both
//! are read once at start-up; everything else is a `ScanConfig` built from
//! CLI flags.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::Path;

// ── Detector configuration ───────────────────────────────────────────────────

/// Network input geometry and decoder settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Model input size as `[width, height]`.
    #[serde(rename = "imageSize", alias = "image_size")]
    pub image_size: [u32; 2],
    /// Decoder pre-filter applied before NMS.
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Candidates kept (by score) before NMS.
    pub top_k: usize,
    /// Detections kept after NMS.
    pub keep_top_k: usize,
    pub input_name: String,
    pub loc_output: String,
    pub conf_output: String,
    /// Grayscale normalisation applied after scaling to `[0, 1]`.
    pub mean: f32,
    pub std: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            image_size: [1024, 1024],
            confidence_threshold: 0.05,
            nms_threshold: 0.3,
            top_k: 5000,
            keep_top_k: 750,
            input_name: "input".to_string(),
            loc_output: "loc".to_string(),
            conf_output: "conf".to_string(),
            mean: 0.485,
            std: 0.229,
        }
    }
}

impl DetectorConfig {
    pub fn width(&self) -> u32 {
        self.image_size[0]
    }

    pub fn height(&self) -> u32 {
        self.image_size[1]
    }

    pub fn validate(&self) -> Result<()> {
        if self.width() == 0 || self.height() == 0 {
            bail!("imageSize must be non-zero, got {:?}", self.image_size);
        }
        if self.std <= 0.0 {
            bail!("std must be positive, got {}", self.std);
        }
        if !(0.0..=1.0).contains(&self.nms_threshold) {
            bail!("nms_threshold must be within [0, 1], got {}", self.nms_threshold);
        }
        Ok(())
    }
}

/// Anchor layout of the FaceBoxes heads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    /// One list of anchor sizes per feature map.
    pub min_sizes: Vec<Vec<u32>>,
    /// Stride of each feature map in input pixels.
    pub steps: Vec<u32>,
    pub clip: bool,
    /// Center and size variances used when decoding offsets.
    pub variance: [f32; 2],
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            min_sizes: vec![vec![32, 64, 128], vec![256], vec![512]],
            steps: vec![32, 64, 128],
            clip: false,
            variance: [0.1, 0.2],
        }
    }
}

impl PriorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_sizes.len() != self.steps.len() {
            bail!(
                "min_sizes has {} feature maps but steps has {}",
                self.min_sizes.len(),
                self.steps.len()
            );
        }
        if self.steps.iter().any(|&s| s == 0) {
            bail!("steps must be non-zero");
        }
        Ok(())
    }
}

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

/// Read and validate both detector YAML files.
pub fn load_detector_configs(
    detector_path: &Path,
    prior_path: &Path,
) -> Result<(DetectorConfig, PriorConfig)> {
    let detector: DetectorConfig = load_yaml(detector_path)?;
    detector
        .validate()
        .with_context(|| format!("invalid detector config {}", detector_path.display()))?;
    let priors: PriorConfig = load_yaml(prior_path)?;
    priors
        .validate()
        .with_context(|| format!("invalid prior config {}", prior_path.display()))?;
    Ok((detector, priors))
}

// ── Scan parameters ──────────────────────────────────────────────────────────

/// Per-frame scan settings. Defaults match the values the tool has always
/// shipped with.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Detections must score strictly above this to count.
    pub score_threshold: f32,
    pub pyramid_levels: u32,
    pub scale_factor: f32,
    /// Pyramid stops once either side drops below this many pixels.
    pub min_side: u32,
    pub contrast_alpha: f32,
    pub brightness_beta: f32,
    /// Gaussian kernel size (odd).
    pub blur_kernel: u32,
    /// Size of annotated frames written to the output video.
    pub display_size: (u32, u32),
    pub max_frames: Option<u64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            pyramid_levels: 5,
            scale_factor: 0.75,
            min_side: 30,
            contrast_alpha: 1.5,
            brightness_beta: 50.0,
            blur_kernel: 5,
            display_size: (640, 480),
            max_frames: None,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.score_threshold) {
            bail!("score threshold must be within [0, 1], got {}", self.score_threshold);
        }
        if self.pyramid_levels == 0 {
            bail!("at least one pyramid level is required");
        }
        if !(self.scale_factor > 0.0 && self.scale_factor <= 1.0) {
            bail!("scale factor must be within (0, 1], got {}", self.scale_factor);
        }
        if self.blur_kernel == 0 || self.blur_kernel % 2 == 0 {
            bail!("blur kernel must be a positive odd number, got {}", self.blur_kernel);
        }
        if self.display_size.0 == 0 || self.display_size.1 == 0 {
            bail!("display size must be non-zero, got {:?}", self.display_size);
        }
        Ok(())
    }

    /// Scale applied at pyramid `level` (level 0 is the full frame).
    pub fn scale_at(&self, level: u32) -> f32 {
        self.scale_factor.powi(level as i32)
    }
}
