//! report — per-video summary files and opening them for the operator

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use crate::stats::VideoStats;

const LOG_PREFIX: &str = "face_detection_confidence_";

/// `<log_dir>/face_detection_confidence_<video file name>.txt`
pub fn summary_log_path(log_dir: &Path, video: &Path) -> PathBuf {
    let name = video
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    log_dir.join(format!("{LOG_PREFIX}{name}.txt"))
}

/// Append the summary block for `stats` to `path`. Returns `false` (and
/// leaves the file untouched) when there is nothing to report.
pub fn append_summary(path: &Path, stats: &VideoStats) -> Result<bool> {
    let Some(summary) = stats.summary() else {
        return Ok(false);
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open summary log {}", path.display()))?;
    file.write_all(summary.as_bytes())
        .with_context(|| format!("failed to write summary log {}", path.display()))?;
    Ok(true)
}

/// Command used to show a text file: `$VISUAL`, then `$EDITOR`, then the
/// platform's default.
pub fn editor_command() -> Vec<String> {
    for var in ["VISUAL", "EDITOR"] {
        if let Ok(value) = std::env::var(var) {
            let parts: Vec<String> = value.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                return parts;
            }
        }
    }
    if cfg!(target_os = "windows") {
        vec!["notepad.exe".to_string()]
    } else if cfg!(target_os = "macos") {
        vec!["open".to_string(), "-t".to_string()]
    } else {
        vec!["xdg-open".to_string()]
    }
}

/// Open `path` in the operator's editor and wait for it to exit. Failures
/// are logged, never fatal.
pub fn open_in_editor(path: &Path) {
    let cmd = editor_command();
    let Some((program, args)) = cmd.split_first() else {
        return;
    };
    info!(editor = %program, path = %path.display(), "opening log");
    match Command::new(program).args(args).arg(path).status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, path = %path.display(), "editor exited with an error"),
        Err(e) => warn!(editor = %program, "failed to launch editor: {e}"),
    }
}
