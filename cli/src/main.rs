use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use facescan_core::{
    batch::{BatchOptions, discover_videos, run_batch},
    config::{ScanConfig, load_detector_configs},
    detection::FaceBoxesDetector,
    pipeline::Scanner,
    rendering::BoxStyle,
    report::open_in_editor,
    runtime::configure_ort_dylib,
    video::probe,
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "facescan",
    version,
    about = "Multi-scale face detection statistics for folders of videos",
    long_about = None
)]
struct Cli {
    /// Global log file (appended to)
    #[arg(long, global = true, default_value = "face_detection_confidence.log")]
    global_log: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan every video under a folder (or a single file) and write per-video summaries.
    Scan(ScanArgs),

    /// Print frame count, frame rate and duration of a video.
    Probe {
        /// Input video path
        video: PathBuf,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// Folder searched recursively for videos, or a single video file
    input: PathBuf,

    /// FaceBoxes ONNX model path
    #[arg(long, default_value = "mdfd.onnx")]
    model: PathBuf,

    /// Detector YAML config
    #[arg(long, default_value = "FaceBoxesV2/faceBoxesV2Cfg.yaml")]
    detector_config: PathBuf,

    /// Prior-box YAML config
    #[arg(long, default_value = "FaceBoxesV2/priorCfg.yaml")]
    prior_config: PathBuf,

    /// Directory for per-video summary files
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,

    /// Write an annotated, display-size copy of each video into this directory
    #[arg(long)]
    annotate_dir: Option<PathBuf>,

    /// Video file extension to look for
    #[arg(long, default_value = "mp4")]
    extension: String,

    /// Detections must score strictly above this (0–1)
    #[arg(long, default_value_t = 0.5)]
    threshold: f32,

    /// Number of pyramid levels tried per frame
    #[arg(long, default_value_t = 5)]
    levels: u32,

    /// Scale between consecutive pyramid levels
    #[arg(long, default_value_t = 0.75)]
    scale_factor: f32,

    /// Stop the pyramid once a side drops below this many pixels
    #[arg(long, default_value_t = 30)]
    min_side: u32,

    /// Contrast multiplier applied before detection
    #[arg(long, default_value_t = 1.5)]
    alpha: f32,

    /// Brightness offset applied before detection
    #[arg(long, default_value_t = 50.0)]
    beta: f32,

    /// Gaussian denoise kernel size (odd, 1 disables)
    #[arg(long, default_value_t = 5)]
    blur_kernel: u32,

    /// Annotated output width
    #[arg(long, default_value_t = 640)]
    display_width: u32,

    /// Annotated output height
    #[arg(long, default_value_t = 480)]
    display_height: u32,

    /// Stop each video after this many frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Draw boxes without score labels
    #[arg(long)]
    no_labels: bool,

    /// Open each written summary in $VISUAL / $EDITOR when the batch ends
    #[arg(long)]
    open_logs: bool,
}

impl ScanArgs {
    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            score_threshold: self.threshold,
            pyramid_levels: self.levels,
            scale_factor: self.scale_factor,
            min_side: self.min_side,
            contrast_alpha: self.alpha,
            brightness_beta: self.beta,
            blur_kernel: self.blur_kernel,
            display_size: (self.display_width, self.display_height),
            max_frames: self.max_frames,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global_log)?;

    match cli.command {
        Commands::Scan(args) => cmd_scan(args),
        Commands::Probe { video } => cmd_probe(&video),
    }
}

/// Respect RUST_LOG; default to info. Everything goes to stderr and, without
/// colours, to the global log file.
fn init_logging(log_file: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(())
}

// ── scan ──────────────────────────────────────────────────────────────────────

fn cmd_scan(args: ScanArgs) -> Result<()> {
    let scan_cfg = args.scan_config();
    scan_cfg.validate().context("invalid scan options")?;

    info!("Face scan");
    info!("  input  : {}", args.input.display());
    info!("  model  : {}", args.model.display());
    info!("  logs   : {}", args.log_dir.display());

    let videos = discover_videos(&args.input, &args.extension)?;
    if videos.is_empty() {
        warn!(
            input = %args.input.display(),
            extension = %args.extension,
            "no videos found"
        );
        return Ok(());
    }
    info!(count = videos.len(), "videos found");

    let (detector_cfg, prior_cfg) = load_detector_configs(&args.detector_config, &args.prior_config)?;

    configure_ort_dylib();
    let detector = FaceBoxesDetector::load(&args.model, detector_cfg, &prior_cfg)
        .with_context(|| format!("failed to load model: {}", args.model.display()))?;

    let style = BoxStyle {
        label_scale: if args.no_labels { 0 } else { BoxStyle::default().label_scale },
        ..BoxStyle::default()
    };
    let mut scanner = Scanner::new(detector, scan_cfg).with_style(style);

    let opts = BatchOptions {
        log_dir: args.log_dir.clone(),
        annotate_dir: args.annotate_dir.clone(),
    };

    let pb = progress_bar()?;
    let mut current_video: Option<PathBuf> = None;
    let mut on_progress = |video: &Path, current: u64, total: u64| {
        if current_video.as_deref() != Some(video) {
            current_video = Some(video.to_path_buf());
            pb.reset();
            pb.set_length(total);
            pb.set_message(
                video
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
        }
        if current > pb.length().unwrap_or(0) {
            pb.set_length(current);
        }
        pb.set_position(current);
    };

    let reports = run_batch(&videos, &mut scanner, &opts, &mut on_progress);
    pb.finish_with_message("Done.");

    if reports.is_empty() {
        bail!("none of the {} videos could be processed", videos.len());
    }

    for report in &reports {
        let rate = report.stats.detection_rate_line();
        match report.stats.average_confidence() {
            Some(avg) => info!(
                video = %report.video.display(),
                "avg confidence {avg:.2}, detection rate {rate}"
            ),
            None => info!(video = %report.video.display(), "no detections, {rate}"),
        }
        if report.stats.unreadable_frames > 0 {
            warn!(
                video = %report.video.display(),
                "{} unreadable frames counted as undetected",
                report.stats.unreadable_frames
            );
        }
        if let Some(out) = &report.annotated {
            info!(output = %out.display(), "annotated copy");
        }
    }

    if args.open_logs {
        for report in &reports {
            if report.summary_written {
                open_in_editor(&report.log_path);
            } else {
                warn!(video = %report.video.display(), "no summary written; nothing to open");
            }
        }
    }

    Ok(())
}

// ── probe ─────────────────────────────────────────────────────────────────────

fn cmd_probe(video: &Path) -> Result<()> {
    let info = probe(video).with_context(|| format!("failed to probe {}", video.display()))?;
    println!("file      : {}", video.display());
    println!("size      : {}x{}", info.width, info.height);
    println!("frames    : {}", info.frame_count);
    println!("fps       : {:.3}", info.fps);
    println!("duration  : {:.2}s", info.duration_secs);
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {pos}/{len} frames [{elapsed_precise}]",
        )?
        .progress_chars("=> ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    Ok(pb)
}
