//! ffprobe-based clip inspection. Structural only: reports which streams exist and their
//! shape, never decodes samples to guess whether audio is audible.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    size: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    #[serde(default)]
    sample_rate: Option<String>,
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    (den != 0.0).then(|| num / den)
}

fn parse_seconds(s: Option<&String>) -> Option<f64> {
    s.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStreamInfo {
    pub codec_name: Option<String>,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: Option<String>,
    /// Raw rational as reported (e.g. "30000/1001"); compared verbatim across clips.
    pub frame_rate: String,
    pub fps: f64,
    pub start_time: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStreamInfo {
    pub codec_name: Option<String>,
    pub sample_rate: u32,
    pub channels: u32,
    pub start_time: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipInfo {
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    pub size: u64,
    pub format_name: Option<String>,
    /// First video stream.
    pub video: Option<VideoStreamInfo>,
    /// First audio stream.
    pub audio: Option<AudioStreamInfo>,
}

impl ClipInfo {
    pub fn has_audio_stream(&self) -> bool {
        self.audio.is_some()
    }

    /// Length of the picture: the video stream's own duration when reported, else the
    /// container's. An audio track may run longer or shorter than this.
    pub fn video_duration(&self) -> f64 {
        self.video
            .as_ref()
            .and_then(|v| v.duration)
            .filter(|d| *d > 0.0)
            .unwrap_or(self.duration)
    }
}

/// Parse ffprobe JSON output into ClipInfo.
pub fn parse_ffprobe_json(json: &str) -> Result<ClipInfo, String> {
    let output: FfprobeOutput =
        serde_json::from_str(json).map_err(|e| format!("Failed to parse ffprobe JSON: {}", e))?;

    let format = output.format.as_ref();
    let streams = output.streams.unwrap_or_default();
    let first_of = |kind: &str| {
        streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(kind))
    };

    let video = first_of("video").map(|s| {
        let frame_rate = s.r_frame_rate.clone().unwrap_or_default();
        VideoStreamInfo {
            codec_name: s.codec_name.clone(),
            width: s.width.unwrap_or(0),
            height: s.height.unwrap_or(0),
            pix_fmt: s.pix_fmt.clone(),
            fps: parse_frame_rate(&frame_rate).unwrap_or(0.0),
            frame_rate,
            start_time: parse_seconds(s.start_time.as_ref()),
            duration: parse_seconds(s.duration.as_ref()),
        }
    });
    let audio = first_of("audio").map(|s| AudioStreamInfo {
        codec_name: s.codec_name.clone(),
        sample_rate: s
            .sample_rate
            .as_deref()
            .and_then(|r| r.trim().parse().ok())
            .unwrap_or(0),
        channels: s.channels.unwrap_or(0),
        start_time: parse_seconds(s.start_time.as_ref()),
        duration: parse_seconds(s.duration.as_ref()),
    });

    // Some containers only carry duration on the stream.
    let duration = parse_seconds(format.and_then(|f| f.duration.as_ref()))
        .or_else(|| first_of("video").and_then(|s| parse_seconds(s.duration.as_ref())))
        .unwrap_or(0.0);

    Ok(ClipInfo {
        duration,
        start_time: parse_seconds(format.and_then(|f| f.start_time.as_ref())),
        size: format
            .and_then(|f| f.size.as_ref())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0),
        format_name: format.and_then(|f| f.format_name.clone()),
        video,
        audio,
    })
}

/// Run ffprobe on a file. Any failure to read the file is reported as `SourceUnreadable`.
pub fn probe_clip(ffprobe: &Path, path: &Path) -> Result<ClipInfo, AppError> {
    if !path.is_file() {
        return Err(AppError::source_unreadable(path, "file does not exist"));
    }
    log::debug!(
        target: "clipjoin::ffmpeg::ffprobe",
        "probe: path={}",
        path.display()
    );

    let mut cmd = Command::new(ffprobe);
    cmd.arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(path);
    #[cfg(windows)]
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    let output = cmd
        .output()
        .map_err(|e| AppError::from(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::source_unreadable(
            path,
            format!("ffprobe failed: {}", stderr.trim()),
        ));
    }

    let json = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_json(&json).map_err(|e| AppError::source_unreadable(path, e))
}
