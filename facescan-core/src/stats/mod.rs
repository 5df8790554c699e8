//! stats — per-video confidence log and detection counters

use std::fmt::Write as _;

/// Everything accumulated while scanning one video.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoStats {
    /// Frames seen, readable or not.
    pub total_frames: u64,
    /// Frames with at least one face above threshold.
    pub detected_frames: u64,
    pub unreadable_frames: u64,
    /// Score of every accepted detection, in order.
    pub confidences: Vec<f32>,
}

impl VideoStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a decoded frame.
    pub fn record_frame(&mut self, detected: bool) {
        self.total_frames += 1;
        if detected {
            self.detected_frames += 1;
        }
    }

    /// Count a frame the decoder could not produce. It still counts toward
    /// the detection-rate denominator.
    pub fn record_unreadable(&mut self) {
        self.total_frames += 1;
        self.unreadable_frames += 1;
    }

    pub fn record_confidences<I: IntoIterator<Item = f32>>(&mut self, scores: I) {
        self.confidences.extend(scores);
    }

    /// Mean of all recorded confidences, `None` when nothing was detected.
    pub fn average_confidence(&self) -> Option<f32> {
        if self.confidences.is_empty() {
            return None;
        }
        let sum: f64 = self.confidences.iter().map(|&c| c as f64).sum();
        Some((sum / self.confidences.len() as f64) as f32)
    }

    /// `detected_frames / total_frames`, 0 when no frames were seen.
    pub fn detection_rate(&self) -> f64 {
        if self.total_frames == 0 {
            0.0
        } else {
            self.detected_frames as f64 / self.total_frames as f64
        }
    }

    /// `45.00% (45/100 frames)`
    pub fn detection_rate_line(&self) -> String {
        format!(
            "{:.2}% ({}/{} frames)",
            self.detection_rate() * 100.0,
            self.detected_frames,
            self.total_frames
        )
    }

    /// Text block appended to the per-video log, or `None` when no
    /// confidence was recorded.
    pub fn summary(&self) -> Option<String> {
        let avg = self.average_confidence()?;
        let mut out = String::new();
        let _ = writeln!(out);
        let _ = writeln!(out, "Average detection confidence: {avg:.2}");
        let _ = writeln!(out, "Detection rate: {}", self.detection_rate_line());
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_have_no_average_and_zero_rate() {
        let stats = VideoStats::new();
        assert_eq!(stats.average_confidence(), None);
        assert_eq!(stats.detection_rate(), 0.0);
        assert_eq!(stats.summary(), None);
    }

    #[test]
    fn counters_and_rate() {
        let mut stats = VideoStats::new();
        stats.record_frame(true);
        stats.record_frame(false);
        stats.record_frame(true);
        stats.record_unreadable();
        assert_eq!(stats.total_frames, 4);
        assert_eq!(stats.detected_frames, 2);
        assert_eq!(stats.unreadable_frames, 1);
        assert!((stats.detection_rate() - 0.5).abs() < 1e-12);
        assert_eq!(stats.detection_rate_line(), "50.00% (2/4 frames)");
    }

    #[test]
    fn average_over_all_detections_not_frames() {
        let mut stats = VideoStats::new();
        stats.record_confidences([0.9, 0.7]);
        stats.record_frame(true);
        stats.record_confidences([0.8]);
        stats.record_frame(true);
        let avg = stats.average_confidence().unwrap();
        assert!((avg - 0.8).abs() < 1e-6);
    }

    #[test]
    fn summary_format() {
        let mut stats = VideoStats::new();
        stats.record_confidences([0.874, 0.866]);
        stats.record_frame(true);
        stats.record_frame(false);
        stats.record_frame(false);
        assert_eq!(
            stats.summary().unwrap(),
            "\nAverage detection confidence: 0.87\nDetection rate: 33.33% (1/3 frames)\n"
        );
    }
}
