//! Staging files for encoder output. FFmpeg writes into a staging path; the file is either
//! handed off (renamed into the cache, or kept by an uncached build) or removed on drop.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File name marker for staging files, so stale ones can be told apart from real artifacts.
pub const STAGING_MARKER: &str = ".part";

/// Short suffix for uniqueness within a process; not random.
fn unique_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!(
        "{}-{}-{}",
        std::process::id(),
        millis,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Fresh staging path `<dir>/<stem>.<unique>.part.<ext>`; nothing is created on disk.
pub fn staging_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    dir.join(format!("{stem}.{}{STAGING_MARKER}.{ext}", unique_suffix()))
}

/// Owns a staging file and removes it on drop unless [`StagingFile::keep`] was called.
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
    keep: bool,
}

impl StagingFile {
    pub fn new(dir: &Path, stem: &str, ext: &str) -> Self {
        Self {
            path: staging_path(dir, stem, ext),
            keep: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release ownership; the caller is now responsible for the file.
    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Remove staging files older than `max_age` from `dir`. Returns how many were removed.
pub fn cleanup_stale_staging_files(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().contains(STAGING_MARKER) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if meta.is_file() && age >= max_age && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        log::info!(
            target: "clipjoin::ffmpeg::temp",
            "Removed {} stale staging file(s) from {}",
            removed,
            dir.display()
        );
    }
    Ok(removed)
}
