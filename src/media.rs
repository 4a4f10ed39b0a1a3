//! The seam between the pipeline and the external transcode engine.

use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::ffmpeg::{
    ClipInfo, ProgressCallback, RunOwners, discovery, ffprobe, run_ffmpeg_blocking,
    verify_decodes,
};

/// Blocking access to probe and encode. Callers on an async runtime go through
/// `spawn_blocking`.
pub trait MediaTool: Send + Sync {
    fn probe(&self, path: &Path) -> Result<ClipInfo, AppError>;

    /// `owners` ties the run to the builds it serves, so a forced cancel of one build does
    /// not kill work another build still needs.
    fn run(
        &self,
        args: &[String],
        duration_secs: Option<f64>,
        progress: Option<ProgressCallback>,
        owners: Option<&RunOwners>,
    ) -> Result<(), AppError>;

    fn verify(&self, path: &Path) -> Result<(), AppError>;
}

/// `MediaTool` backed by the ffmpeg and ffprobe executables.
#[derive(Debug, Clone)]
pub struct FfmpegCli {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegCli {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    /// Resolve both binaries (FFMPEG_PATH first, then common paths and PATH).
    pub fn discover() -> Result<Self, AppError> {
        let ffmpeg = discovery::get_ffmpeg_path()?.to_path_buf();
        let ffprobe = discovery::get_ffprobe_path(&ffmpeg)?;
        log::info!(
            target: "clipjoin::media",
            "Using ffmpeg={} ffprobe={}",
            ffmpeg.display(),
            ffprobe.display()
        );
        Ok(Self::new(ffmpeg, ffprobe))
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn ffprobe_path(&self) -> &Path {
        &self.ffprobe
    }
}

impl MediaTool for FfmpegCli {
    fn probe(&self, path: &Path) -> Result<ClipInfo, AppError> {
        ffprobe::probe_clip(&self.ffprobe, path)
    }

    fn run(
        &self,
        args: &[String],
        duration_secs: Option<f64>,
        progress: Option<ProgressCallback>,
        owners: Option<&RunOwners>,
    ) -> Result<(), AppError> {
        run_ffmpeg_blocking(&self.ffmpeg, args, duration_secs, progress, owners)
    }

    fn verify(&self, path: &Path) -> Result<(), AppError> {
        verify_decodes(&self.ffmpeg, path)
    }
}
