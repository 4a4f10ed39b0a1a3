mod builder;
pub mod discovery;
mod error;
pub mod ffprobe;
mod progress;
mod runner;
mod temp;
mod verify;

pub use builder::{
    AudioPlan, NormalizePlan, build_concat_args, build_normalize_args, build_repair_args,
    build_trim_args, concat_manifest, format_args_for_display_multiline, source_audio_filter,
    video_filter_chain,
};
pub use error::{FfmpegErrorPayload, parse_ffmpeg_error};
pub use ffprobe::{AudioStreamInfo, ClipInfo, VideoStreamInfo};
pub use runner::{ProgressCallback, RunOwners, run_ffmpeg_blocking, terminate_cancelled_ffmpeg};
pub use temp::{STAGING_MARKER, StagingFile, cleanup_stale_staging_files, staging_path};
pub use verify::verify_decodes;

/// Path to string for FFmpeg args or logging.
pub fn path_to_string(path: &(impl AsRef<std::path::Path> + ?Sized)) -> String {
    path.as_ref().to_string_lossy().to_string()
}
