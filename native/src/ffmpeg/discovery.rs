//! Locating the ffmpeg and ffprobe executables.
//!
//! Order: `FFMPEG_PATH` / `FFPROBE_PATH` env, bundled `resources/` next to the
//! executable, common install paths, then `PATH`. Resolved once per process.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use crate::error::AppError;

/// Paths of the external media tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

static MEDIA_TOOLS_CACHE: OnceLock<MediaTools> = OnceLock::new();

fn exe_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{base}.exe")
    } else {
        base.to_string()
    }
}

fn find_in_path(base: &str) -> Option<PathBuf> {
    let finder = if cfg!(windows) { "where" } else { "which" };
    let output = Command::new(finder).arg(base).output().ok()?;
    if output.status.success() {
        let path = String::from_utf8_lossy(&output.stdout);
        let first = path.lines().next()?.trim();
        if !first.is_empty() {
            return Some(PathBuf::from(first));
        }
    }
    None
}

fn common_dirs() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/opt/homebrew/bin"),
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/opt/local/bin"),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![
            PathBuf::from("C:\\ffmpeg\\bin"),
            PathBuf::from("C:\\Program Files\\ffmpeg\\bin"),
        ]
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        vec![PathBuf::from("/usr/bin"), PathBuf::from("/usr/local/bin")]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", unix)))]
    {
        vec![]
    }
}

/// Bundled copy shipped next to the executable (`<exe dir>/resources/<name>` or `<exe dir>/<name>`).
fn bundled_path(base: &str) -> Option<PathBuf> {
    let exe_dir = std::env::current_exe().ok()?.parent()?.to_path_buf();
    let name = exe_name(base);
    [exe_dir.join("resources").join(&name), exe_dir.join(&name)]
        .into_iter()
        .find(|p| p.is_file())
}

fn env_override(var: &str) -> Option<PathBuf> {
    let value = std::env::var(var).ok()?;
    let p = PathBuf::from(value.trim());
    if p.is_file() {
        log::debug!(
            target: "mediaforge::ffmpeg::discovery",
            "{} from env: {}",
            var,
            p.display()
        );
        Some(p)
    } else {
        log::warn!(
            target: "mediaforge::ffmpeg::discovery",
            "{} points to a missing file, ignoring: {}",
            var,
            p.display()
        );
        None
    }
}

fn resolve_ffmpeg_path() -> Result<PathBuf, AppError> {
    if let Some(p) = env_override("FFMPEG_PATH") {
        return Ok(p);
    }
    if let Some(p) = bundled_path("ffmpeg") {
        log::debug!(
            target: "mediaforge::ffmpeg::discovery",
            "FFmpeg found as bundled resource: {}",
            p.display()
        );
        return Ok(p);
    }
    let name = exe_name("ffmpeg");
    for dir in common_dirs() {
        let path = dir.join(&name);
        if path.is_file() {
            log::debug!(
                target: "mediaforge::ffmpeg::discovery",
                "FFmpeg found in common path: {}",
                path.display()
            );
            return Ok(path);
        }
    }
    if let Some(p) = find_in_path("ffmpeg").filter(|p| p.exists()) {
        log::debug!(
            target: "mediaforge::ffmpeg::discovery",
            "FFmpeg found in PATH: {}",
            p.display()
        );
        return Ok(p);
    }

    log::error!(
        target: "mediaforge::ffmpeg::discovery",
        "FFmpeg not found in env, resources, common locations or PATH"
    );
    Err(AppError::FfmpegNotFound(
        "FFmpeg not found. Please install FFmpeg on your system:\n  - macOS: brew install ffmpeg\n  - Linux: sudo apt install ffmpeg\n  - Windows: Download from https://ffmpeg.org/download.html"
            .to_string(),
    ))
}

/// Paths to try for ffprobe given an ffmpeg binary path (suffixed first, then plain).
pub fn ffprobe_candidates(ffmpeg_path: &Path) -> Vec<PathBuf> {
    let parent = match ffmpeg_path.parent() {
        Some(p) => p,
        None => return vec![],
    };
    let mut candidates = Vec::with_capacity(2);
    if let Some(suffix) = ffmpeg_path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.strip_prefix("ffmpeg"))
        .filter(|suffix| !suffix.is_empty())
    {
        candidates.push(parent.join(exe_name(&format!("ffprobe{suffix}"))));
    }
    candidates.push(parent.join(exe_name("ffprobe")));
    candidates
}

fn resolve_ffprobe_path(ffmpeg: &Path) -> Result<PathBuf, AppError> {
    if let Some(p) = env_override("FFPROBE_PATH") {
        return Ok(p);
    }
    if let Some(p) = ffprobe_candidates(ffmpeg).into_iter().find(|c| c.is_file()) {
        return Ok(p);
    }
    find_in_path("ffprobe")
        .filter(|p| p.exists())
        .ok_or_else(|| {
            AppError::FfmpegNotFound(format!(
                "ffprobe not found next to {} or in PATH",
                ffmpeg.display()
            ))
        })
}

impl MediaTools {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Locate both tools. Cached for process lifetime once found.
    pub fn resolve() -> Result<&'static MediaTools, AppError> {
        if let Some(tools) = MEDIA_TOOLS_CACHE.get() {
            return Ok(tools);
        }
        let ffmpeg = resolve_ffmpeg_path()?;
        let ffprobe = resolve_ffprobe_path(&ffmpeg)?;
        log::info!(
            target: "mediaforge::ffmpeg::discovery",
            "Using ffmpeg={} ffprobe={}",
            ffmpeg.display(),
            ffprobe.display()
        );
        // A concurrent caller may have won; either result is valid.
        Ok(MEDIA_TOOLS_CACHE.get_or_init(|| MediaTools { ffmpeg, ffprobe }))
    }
}
