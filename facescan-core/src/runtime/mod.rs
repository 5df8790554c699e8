use std::path::{Path, PathBuf};

#[cfg(target_os = "windows")]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";

/// Resolve and set ORT_DYLIB_PATH at runtime when it is missing or invalid.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if file exists)
/// 2) models/onnxruntime*/lib/<platform library> near current exe/cwd
/// 3) the system library directory (last-resort fallback)
///
/// Returns the path that was configured, if any.
pub fn configure_ort_dylib() -> Option<PathBuf> {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return Some(existing_path);
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    let roots = search_roots();
    let found = ort_candidates(&roots).into_iter().find(|c| c.is_file());
    match found {
        Some(candidate) => {
            // SAFETY: called once from main before any ORT session exists and
            // before any other thread is spawned.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", &candidate);
            }
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
            Some(candidate)
        }
        None => {
            tracing::warn!(
                "could not locate {ORT_LIB_NAME}; set ORT_DYLIB_PATH to an ONNX Runtime build"
            );
            None
        }
    }
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..7 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }
    roots
}

fn ort_candidates(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIB_NAME));
        candidates.push(root.join("models").join(ORT_LIB_NAME));
        candidates.push(root.join(ORT_LIB_NAME));
    }

    if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from("/opt/homebrew/lib").join(ORT_LIB_NAME));
    } else if cfg!(not(target_os = "windows")) {
        candidates.push(PathBuf::from("/usr/local/lib").join(ORT_LIB_NAME));
        candidates.push(PathBuf::from("/usr/lib").join(ORT_LIB_NAME));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_follow_root_order() {
        let roots = vec![PathBuf::from("/a"), PathBuf::from("/b")];
        let c = ort_candidates(&roots);
        assert_eq!(c[0], Path::new("/a/models/onnxruntime/lib").join(ORT_LIB_NAME));
        assert_eq!(c[3], Path::new("/b/models/onnxruntime/lib").join(ORT_LIB_NAME));
        assert!(c.iter().all(|p| p.ends_with(ORT_LIB_NAME)));
    }
}
