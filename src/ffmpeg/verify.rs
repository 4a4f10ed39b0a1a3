//! Integrity check via FFmpeg decode-to-null.
//!
//! A valid file decodes without errors; a broken join (bad keyframe tables, timestamp
//! discontinuities the demuxer rejects) produces errors on stderr or a non-zero exit.

use std::path::Path;
use std::process::Command;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use crate::error::AppError;

pub fn verify_decodes(ffmpeg: &Path, path: &Path) -> Result<(), AppError> {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-nostdin")
        .arg("-v")
        .arg("error")
        .arg("-i")
        .arg(path)
        .arg("-f")
        .arg("null")
        .arg("-");
    #[cfg(windows)]
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    let output = cmd
        .output()
        .map_err(|e| AppError::from(format!("Failed to spawn FFmpeg: {}", e)))?;
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let code = output.status.code().unwrap_or(-1);
    if output.status.success() && !stderr.to_lowercase().contains("error") {
        log::debug!(
            target: "clipjoin::ffmpeg::verify",
            "decode check passed: {}",
            path.display()
        );
        return Ok(());
    }
    log::warn!(
        target: "clipjoin::ffmpeg::verify",
        "decode check failed for {} (exit {})",
        path.display(),
        code
    );
    Err(AppError::ffmpeg_failed(
        if code == 0 { 1 } else { code },
        format!("Decode check failed for {}: {}", path.display(), stderr.trim()),
    ))
}
