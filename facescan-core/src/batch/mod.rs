//! batch — find videos under a folder and scan them one at a time

use anyhow::{Context, Result};
use fast_image_resize as fr;
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::detection::FaceDetector;
use crate::pipeline::Scanner;
use crate::rendering::resize_to;
use crate::report::{append_summary, summary_log_path};
use crate::stats::VideoStats;
use crate::video::{FrameEvent, RgbFrame, for_each_frame, probe, transcode};

/// Where batch outputs go.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Directory receiving the per-video summary files.
    pub log_dir: PathBuf,
    /// When set, an annotated display-size copy of each video is written here.
    pub annotate_dir: Option<PathBuf>,
}

/// Outcome of scanning one video.
#[derive(Debug, Clone)]
pub struct VideoReport {
    pub video: PathBuf,
    pub log_path: PathBuf,
    pub stats: VideoStats,
    /// Whether a summary block was appended to `log_path`.
    pub summary_written: bool,
    pub annotated: Option<PathBuf>,
}

/// Collect every file under `root` whose extension matches `extension`
/// (case-insensitive), sorted by path. A file path is returned as-is.
pub fn discover_videos(root: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory {}", dir.display()))?;
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
            let path = entry.path();
            // Symlinked directories are not descended; symlinked files are kept.
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to stat {}", path.display()))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if path.is_file()
                && path
                    .extension()
                    .is_some_and(|e| e.to_string_lossy().to_ascii_lowercase() == ext)
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// `<dir>/<stem>_faces.mp4`
pub fn annotated_path(dir: &Path, video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    dir.join(format!("{stem}_faces.mp4"))
}

/// Per-frame bookkeeping for one video: scan the frame, count it, shrink it
/// to display size when an annotated copy is written, and decide whether
/// decoding continues.
struct FrameHandler<'a, D: FaceDetector> {
    scanner: &'a mut Scanner<D>,
    stats: VideoStats,
    resizer: fr::Resizer,
    display_size: Option<(u32, u32)>,
    max_frames: Option<u64>,
    failure: Option<anyhow::Error>,
}

impl<'a, D: FaceDetector> FrameHandler<'a, D> {
    fn new(scanner: &'a mut Scanner<D>, annotate: bool) -> Self {
        let cfg = scanner.config();
        let display_size = annotate.then_some(cfg.display_size);
        let max_frames = cfg.max_frames;
        Self {
            scanner,
            stats: VideoStats::new(),
            resizer: fr::Resizer::new(),
            display_size,
            max_frames,
            failure: None,
        }
    }

    fn handle(&mut self, event: FrameEvent<'_>) -> ControlFlow<()> {
        match event {
            FrameEvent::Unreadable => self.stats.record_unreadable(),
            FrameEvent::Decoded(frame) => {
                if let Err(e) = self.scan(frame) {
                    self.failure = Some(e);
                    return ControlFlow::Break(());
                }
            }
        }
        if self.max_frames.is_some_and(|m| self.stats.total_frames >= m) {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn scan(&mut self, frame: &mut RgbFrame) -> Result<()> {
        let outcome = self.scanner.scan_frame(frame)?;
        self.stats.record_confidences(outcome.scores());
        self.stats.record_frame(outcome.detected());
        if let Some((w, h)) = self.display_size {
            *frame = resize_to(frame, w, h, &mut self.resizer)?;
        }
        Ok(())
    }
}

/// Scan every frame of `video`, append its summary, and return the report.
/// `progress_fn(frames_seen, expected_frames)` is called after every frame.
pub fn process_video<D: FaceDetector>(
    video: &Path,
    scanner: &mut Scanner<D>,
    opts: &BatchOptions,
    progress_fn: &mut dyn FnMut(u64, u64),
) -> Result<VideoReport> {
    info!(video = %video.display(), "processing video");

    let expected = match probe(video) {
        Ok(i) => {
            info!(
                "Total frames: {}, FPS: {:.2}, Duration: {:.2}s",
                i.frame_count, i.fps, i.duration_secs
            );
            i.frame_count
        }
        Err(e) => {
            warn!(video = %video.display(), "could not probe video: {e:#}");
            0
        }
    };

    let annotated = opts
        .annotate_dir
        .as_deref()
        .map(|dir| annotated_path(dir, video));

    let mut handler = FrameHandler::new(scanner, annotated.is_some());
    let on_frame = |event: FrameEvent<'_>| -> ControlFlow<()> {
        let flow = handler.handle(event);
        progress_fn(handler.stats.total_frames, expected);
        flow
    };

    let tally = match annotated.as_deref() {
        Some(out) => {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create annotation directory {}", parent.display())
                })?;
            }
            transcode(video, out, on_frame)?
        }
        None => for_each_frame(video, on_frame)?,
    };

    if let Some(e) = handler.failure {
        return Err(e.context(format!("scan failed on {}", video.display())));
    }
    let stats = handler.stats;
    if tally.stopped_early {
        info!(frames = stats.total_frames, "stopped before end of video");
    }
    if stats.unreadable_frames > 0 {
        warn!(
            video = %video.display(),
            unreadable = stats.unreadable_frames,
            total = stats.total_frames,
            "some frames could not be read"
        );
    }

    let log_path = summary_log_path(&opts.log_dir, video);
    let summary_written = append_summary(&log_path, &stats)?;
    if let Some(avg) = stats.average_confidence() {
        info!("Average detection confidence: {avg:.2}");
        info!("Detection rate: {}", stats.detection_rate_line());
    } else {
        info!(video = %video.display(), frames = stats.total_frames, "no faces detected");
    }

    Ok(VideoReport {
        video: video.to_path_buf(),
        log_path,
        stats,
        summary_written,
        annotated,
    })
}

/// Scan `videos` sequentially. A video that fails is logged and skipped.
/// `progress_fn(video, frames_seen, expected_frames)` is forwarded from
/// [`process_video`].
pub fn run_batch<D: FaceDetector>(
    videos: &[PathBuf],
    scanner: &mut Scanner<D>,
    opts: &BatchOptions,
    progress_fn: &mut dyn FnMut(&Path, u64, u64),
) -> Vec<VideoReport> {
    let mut reports = Vec::with_capacity(videos.len());
    for video in videos {
        let mut per_video = |current: u64, total: u64| progress_fn(video, current, total);
        match process_video(video, scanner, opts, &mut per_video) {
            Ok(report) => reports.push(report),
            Err(e) => error!(video = %video.display(), "failed to process video: {e:#}"),
        }
    }
    info!(
        processed = reports.len(),
        failed = videos.len() - reports.len(),
        "batch complete"
    );
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::detection::{FACE_LABEL, FaceDetection};

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn discovers_matching_files_recursively_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("b.mp4"));
        touch(&dir.path().join("a.MP4"));
        touch(&dir.path().join("sub/deeper/c.mp4"));
        touch(&dir.path().join("notes.txt"));
        touch(&dir.path().join("sub/d.mov"));

        let found = discover_videos(dir.path(), ".mp4").unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.MP4"),
                PathBuf::from("b.mp4"),
                PathBuf::from("sub/deeper/c.mp4"),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_not_descended() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("sub/a.mp4"));
        std::os::unix::fs::symlink(dir.path(), dir.path().join("sub/loop")).unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("sub/a.mp4"),
            dir.path().join("linked.mp4"),
        )
        .unwrap();

        let found = discover_videos(dir.path(), "mp4").unwrap();
        assert_eq!(
            found,
            vec![dir.path().join("linked.mp4"), dir.path().join("sub/a.mp4")]
        );
    }

    #[test]
    fn single_file_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.avi");
        touch(&file);
        assert_eq!(discover_videos(&file, "mp4").unwrap(), vec![file]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_videos(&dir.path().join("gone"), "mp4").is_err());
    }

    #[test]
    fn annotated_path_uses_stem() {
        let p = annotated_path(Path::new("out"), Path::new("/v/clip.mp4"));
        assert_eq!(p, Path::new("out/clip_faces.mp4"));
    }

    struct NoFaces;

    impl FaceDetector for NoFaces {
        fn detect(&mut self, _frame: &RgbFrame) -> Result<Vec<FaceDetection>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn batch_skips_unreadable_videos() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("broken.mp4");
        fs::write(&bogus, b"not a video").unwrap();

        let mut scanner = Scanner::new(NoFaces, ScanConfig::default());
        let opts = BatchOptions {
            log_dir: dir.path().join("logs"),
            annotate_dir: None,
        };
        let reports = run_batch(&[bogus], &mut scanner, &opts, &mut |_, _, _| {});
        assert!(reports.is_empty());
    }

    struct OneFace;

    impl FaceDetector for OneFace {
        fn detect(&mut self, _frame: &RgbFrame) -> Result<Vec<FaceDetection>> {
            Ok(vec![FaceDetection {
                label: FACE_LABEL,
                score: 0.9,
                bbox: [0.25, 0.25, 0.75, 0.75],
            }])
        }
    }

    #[test]
    fn unreadable_frames_are_counted_and_decoding_continues() {
        let mut scanner = Scanner::new(OneFace, ScanConfig::default());
        let mut handler = FrameHandler::new(&mut scanner, false);
        let mut frame = RgbFrame::blank(64, 48);

        assert!(handler.handle(FrameEvent::Unreadable).is_continue());
        assert!(handler.handle(FrameEvent::Decoded(&mut frame)).is_continue());
        assert!(handler.handle(FrameEvent::Unreadable).is_continue());

        assert_eq!(handler.stats.total_frames, 3);
        assert_eq!(handler.stats.unreadable_frames, 2);
        assert_eq!(handler.stats.detected_frames, 1);
        assert_eq!(handler.stats.confidences, vec![0.9]);
        assert!(handler.failure.is_none());
    }

    #[test]
    fn max_frames_breaks_at_exact_count() {
        let cfg = ScanConfig {
            max_frames: Some(3),
            ..ScanConfig::default()
        };
        let mut scanner = Scanner::new(NoFaces, cfg);
        let mut handler = FrameHandler::new(&mut scanner, false);
        let mut frame = RgbFrame::blank(64, 48);

        assert!(handler.handle(FrameEvent::Decoded(&mut frame)).is_continue());
        assert!(handler.handle(FrameEvent::Unreadable).is_continue());
        assert!(handler.handle(FrameEvent::Decoded(&mut frame)).is_break());
        assert_eq!(handler.stats.total_frames, 3);
        assert!(handler.failure.is_none());
    }

    #[test]
    fn annotated_frames_are_shrunk_to_display_size() {
        let cfg = ScanConfig {
            display_size: (32, 24),
            ..ScanConfig::default()
        };
        let mut scanner = Scanner::new(OneFace, cfg.clone());
        let mut handler = FrameHandler::new(&mut scanner, true);
        let mut frame = RgbFrame::blank(64, 48);
        assert!(handler.handle(FrameEvent::Decoded(&mut frame)).is_continue());
        assert_eq!((frame.width, frame.height), (32, 24));
        assert_eq!(frame.data.len(), 32 * 24 * 3);

        let mut scanner = Scanner::new(OneFace, cfg);
        let mut handler = FrameHandler::new(&mut scanner, false);
        let mut frame = RgbFrame::blank(64, 48);
        assert!(handler.handle(FrameEvent::Decoded(&mut frame)).is_continue());
        assert_eq!((frame.width, frame.height), (64, 48));
    }
}
