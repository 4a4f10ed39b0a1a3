//! Normalization request value types and the cache key derived from them.
//!
//! Every field that changes the bytes of a normalized artifact participates in the key:
//! the source identity, the canvas, the crop mode, the audio mode, the encode profile and
//! the artifact format version. Bump [`CLIP_FORMAT_VERSION`] whenever the normalization
//! procedure itself changes so old artifacts stop matching.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Version of the normalized artifact layout (filters, timestamp handling, container flags).
pub const CLIP_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSignature {
    pub size: u64,
    pub modified_ms: u64,
}

pub fn file_signature(path: &Path) -> Option<FileSignature> {
    let meta = fs::metadata(path).ok()?;
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)?;
    Some(FileSignature {
        size: meta.len(),
        modified_ms,
    })
}

/// (absolute path, mtime, size) captured when a request is made.
#[derive(Clone, Hash, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceIdentity {
    pub path: PathBuf,
    #[serde(flatten)]
    pub signature: FileSignature,
}

impl SourceIdentity {
    pub fn capture(path: &Path) -> Result<Self, AppError> {
        let absolute = fs::canonicalize(path)
            .map_err(|e| AppError::source_unreadable(path, e.to_string()))?;
        if !absolute.is_file() {
            return Err(AppError::source_unreadable(path, "not a regular file"));
        }
        let signature = file_signature(&absolute)
            .ok_or_else(|| AppError::source_unreadable(path, "cannot read file metadata"))?;
        Ok(Self {
            path: absolute,
            signature,
        })
    }

    /// True when the file on disk still has the size and mtime captured here.
    pub fn is_current(&self) -> bool {
        file_signature(&self.path).is_some_and(|sig| sig == self.signature)
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (size={}, mtime={})",
            self.path.display(),
            self.signature.size,
            self.signature.modified_ms
        )
    }
}

#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Result<Self, AppError> {
        let canvas = Self { width, height };
        canvas.validate()?;
        Ok(canvas)
    }

    /// yuv420p needs even, non-zero dimensions.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(AppError::InvalidRequest(format!(
                "canvas must have even non-zero dimensions, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Canvas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropMode {
    /// Scale to cover the canvas, crop the overflow symmetrically.
    #[default]
    Center,
    /// Scale to fit inside the canvas, pad with black bars.
    Fit,
    /// Stretch to the exact canvas size.
    Fill,
}

impl CropMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CropMode::Center => "center",
            CropMode::Fit => "fit",
            CropMode::Fill => "fill",
        }
    }
}

#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    Strip,
    Keep,
}

impl AudioMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioMode::Strip => "strip",
            AudioMode::Keep => "keep",
        }
    }
}

/// Fixed encode parameters shared by every artifact of a cache. Stream-copy concatenation
/// is only valid between artifacts produced with the same profile.
#[derive(Clone, Hash, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncodeProfile {
    pub video_codec: String,
    pub preset: String,
    pub crf: u32,
    pub pix_fmt: String,
    pub fps: u32,
    /// Keyframe interval in frames; scene-cut keyframes are disabled.
    pub gop: u32,
    pub video_timescale: u32,
    pub audio_codec: String,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
    pub audio_bitrate_kbps: u32,
}

impl Default for EncodeProfile {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            crf: 20,
            pix_fmt: "yuv420p".to_string(),
            fps: 30,
            gop: 60,
            video_timescale: 15360,
            audio_codec: "aac".to_string(),
            audio_sample_rate: 48_000,
            audio_channels: 2,
            audio_bitrate_kbps: 128,
        }
    }
}

impl EncodeProfile {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.fps == 0 || self.gop == 0 || self.video_timescale == 0 {
            return Err(AppError::InvalidRequest(
                "encode profile fps, gop and timescale must be non-zero".into(),
            ));
        }
        if self.audio_sample_rate == 0 || self.audio_channels == 0 {
            return Err(AppError::InvalidRequest(
                "encode profile audio rate and channels must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// `anullsrc` channel layout name for the profile's channel count.
    pub fn channel_layout(&self) -> &'static str {
        match self.audio_channels {
            1 => "mono",
            2 => "stereo",
            6 => "5.1",
            _ => "stereo",
        }
    }

    pub fn fingerprint(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}/{}/{}/{}/{}/{}",
            self.video_codec,
            self.preset,
            self.crf,
            self.pix_fmt,
            self.fps,
            self.gop,
            self.video_timescale,
            self.audio_codec,
            self.audio_sample_rate,
            self.audio_channels,
            self.audio_bitrate_kbps,
        )
    }
}

/// Content address of a normalized artifact (hex SHA-256).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Hash, Eq, PartialEq, Debug)]
pub struct NormalizationRequest {
    pub source: SourceIdentity,
    pub canvas: Canvas,
    pub crop_mode: CropMode,
    pub audio_mode: AudioMode,
    pub profile: EncodeProfile,
}

impl NormalizationRequest {
    fn key_material(&self) -> String {
        format!(
            "clip-v{}|{}|{}|{}|{}|{}|{}|{}|{}",
            CLIP_FORMAT_VERSION,
            self.source.path.to_string_lossy(),
            self.source.signature.modified_ms,
            self.source.signature.size,
            self.canvas.width,
            self.canvas.height,
            self.crop_mode.as_str(),
            self.audio_mode.as_str(),
            self.profile.fingerprint(),
        )
    }

    pub fn cache_key(&self) -> CacheKey {
        let digest = Sha256::digest(self.key_material().as_bytes());
        CacheKey(hex::encode(digest))
    }
}
