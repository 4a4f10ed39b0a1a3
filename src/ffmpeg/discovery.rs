//! Locate the ffmpeg and ffprobe binaries.

use crate::error::AppError;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

#[cfg(target_os = "windows")]
const LOOKUP_COMMAND: &str = "where";
#[cfg(not(target_os = "windows"))]
const LOOKUP_COMMAND: &str = "which";

fn find_in_path(name: &str) -> Option<PathBuf> {
    let output = Command::new(LOOKUP_COMMAND).arg(name).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next()?.trim();
    (!first.is_empty()).then(|| PathBuf::from(first))
}

fn common_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/opt/homebrew/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
            PathBuf::from("/opt/local/bin/ffmpeg"),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![
            PathBuf::from("C:\\ffmpeg\\bin\\ffmpeg.exe"),
            PathBuf::from("C:\\Program Files\\ffmpeg\\bin\\ffmpeg.exe"),
        ]
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", unix)))]
    {
        vec![]
    }
}

static FFMPEG_PATH_CACHE: OnceLock<PathBuf> = OnceLock::new();

fn resolve_ffmpeg_path() -> Result<PathBuf, AppError> {
    if let Ok(env_path) = std::env::var("FFMPEG_PATH") {
        let p = PathBuf::from(&env_path);
        if p.exists() {
            log::debug!(
                target: "clipjoin::ffmpeg::discovery",
                "FFmpeg path from FFMPEG_PATH env: {}",
                p.display()
            );
            return Ok(p);
        }
        log::warn!(
            target: "clipjoin::ffmpeg::discovery",
            "FFMPEG_PATH={} does not exist, falling back to search",
            env_path
        );
    }

    if let Some(path) = common_paths().into_iter().find(|p| p.exists()) {
        log::debug!(
            target: "clipjoin::ffmpeg::discovery",
            "FFmpeg found in common path: {}",
            path.display()
        );
        return Ok(path);
    }

    if let Some(p) = find_in_path("ffmpeg").filter(|p| p.exists()) {
        log::debug!(
            target: "clipjoin::ffmpeg::discovery",
            "FFmpeg found in PATH: {}",
            p.display()
        );
        return Ok(p);
    }

    log::error!(
        target: "clipjoin::ffmpeg::discovery",
        "FFmpeg not found in FFMPEG_PATH, common locations or PATH"
    );
    Err(AppError::FfmpegNotFound(
        "FFmpeg not found. Install FFmpeg or set FFMPEG_PATH:\n  - macOS: brew install ffmpeg\n  - Linux: sudo apt install ffmpeg\n  - Windows: Download from https://ffmpeg.org/download.html"
            .to_string(),
    ))
}

/// Get FFmpeg path. Cached for process lifetime.
/// FFMPEG_PATH takes precedence, then common install locations, then PATH.
pub fn get_ffmpeg_path() -> Result<&'static Path, AppError> {
    if let Some(path) = FFMPEG_PATH_CACHE.get() {
        return Ok(path.as_path());
    }
    let resolved = resolve_ffmpeg_path()?;
    // Another thread may have won the race; either value is equivalent.
    Ok(FFMPEG_PATH_CACHE.get_or_init(|| resolved).as_path())
}

/// Paths to try for ffprobe given an ffmpeg binary path (suffixed first, then plain).
pub fn ffprobe_candidates(ffmpeg_path: &Path) -> Vec<PathBuf> {
    let Some(parent) = ffmpeg_path.parent() else {
        return vec![];
    };
    let exe = if cfg!(target_os = "windows") { ".exe" } else { "" };
    let mut candidates = Vec::with_capacity(2);
    if let Some(suffix) = ffmpeg_path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.strip_prefix("ffmpeg"))
        .filter(|suffix| !suffix.is_empty())
    {
        candidates.push(parent.join(format!("ffprobe{suffix}{exe}")));
    }
    candidates.push(parent.join(format!("ffprobe{exe}")));
    candidates
}

/// Get ffprobe path: next to ffmpeg when possible, otherwise PATH.
pub fn get_ffprobe_path(ffmpeg: &Path) -> Result<PathBuf, AppError> {
    if let Some(found) = ffprobe_candidates(ffmpeg).into_iter().find(|c| c.exists()) {
        return Ok(found);
    }
    if let Some(found) = find_in_path("ffprobe").filter(|p| p.exists()) {
        return Ok(found);
    }
    Err(AppError::FfmpegNotFound(format!(
        "ffprobe not found next to {} or in PATH",
        ffmpeg.display()
    )))
}
