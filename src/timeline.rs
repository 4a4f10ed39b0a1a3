//! Joins normalized artifacts into one MP4 without re-encoding.
//!
//! Every input must share one stream shape (canvas, frame rate, pixel format, codecs, audio
//! layout); that is what makes a stream-copy concat valid. A mismatch is reported, never
//! papered over with an implicit re-encode. The only re-encode here is the opt-in repair
//! pass over the already joined file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::error::AppError;
use crate::ffmpeg::{
    ClipInfo, RunOwners, build_concat_args, build_repair_args, build_trim_args,
    concat_manifest, path_to_string,
};
use crate::media::MediaTool;
use crate::request::EncodeProfile;

/// Trims shorter than this are skipped; the artifact is copied whole.
const TRIM_TOLERANCE_SECS: f64 = 0.001;

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyInput {
    pub path: PathBuf,
    pub target_duration: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssembleOptions {
    /// Re-encode the joined file once with the normalization profile.
    pub repair: bool,
    /// Decode the finished file end to end before publishing it.
    pub verify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledSegment {
    pub index: usize,
    pub duration_secs: f64,
    /// False when the artifact was used as is.
    pub trimmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledTimeline {
    pub output_path: PathBuf,
    pub duration_secs: f64,
    pub segments: Vec<AssembledSegment>,
    pub repaired: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct AudioShape {
    codec: Option<String>,
    sample_rate: u32,
    channels: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct StreamShape {
    width: u32,
    height: u32,
    frame_rate: String,
    pix_fmt: Option<String>,
    video_codec: Option<String>,
    audio: Option<AudioShape>,
}

impl StreamShape {
    fn of(info: &ClipInfo) -> Option<Self> {
        let video = info.video.as_ref()?;
        Some(Self {
            width: video.width,
            height: video.height,
            frame_rate: video.frame_rate.clone(),
            pix_fmt: video.pix_fmt.clone(),
            video_codec: video.codec_name.clone(),
            audio: info.audio.as_ref().map(|a| AudioShape {
                codec: a.codec_name.clone(),
                sample_rate: a.sample_rate,
                channels: a.channels,
            }),
        })
    }

    /// First field that differs, as `(name, this, reference)`.
    fn difference(&self, reference: &Self) -> Option<(&'static str, String, String)> {
        fn opt(v: &Option<String>) -> String {
            v.clone().unwrap_or_else(|| "unknown".into())
        }
        if self.width != reference.width {
            return Some(("width", self.width.to_string(), reference.width.to_string()));
        }
        if self.height != reference.height {
            return Some(("height", self.height.to_string(), reference.height.to_string()));
        }
        if self.frame_rate != reference.frame_rate {
            return Some(("frame rate", self.frame_rate.clone(), reference.frame_rate.clone()));
        }
        if self.pix_fmt != reference.pix_fmt {
            return Some(("pixel format", opt(&self.pix_fmt), opt(&reference.pix_fmt)));
        }
        if self.video_codec != reference.video_codec {
            return Some(("video codec", opt(&self.video_codec), opt(&reference.video_codec)));
        }
        match (&self.audio, &reference.audio) {
            (None, None) => None,
            (Some(_), None) => Some(("audio track", "present".into(), "absent".into())),
            (None, Some(_)) => Some(("audio track", "absent".into(), "present".into())),
            (Some(a), Some(b)) => {
                if a.codec != b.codec {
                    Some(("audio codec", opt(&a.codec), opt(&b.codec)))
                } else if a.sample_rate != b.sample_rate {
                    Some((
                        "audio sample rate",
                        a.sample_rate.to_string(),
                        b.sample_rate.to_string(),
                    ))
                } else if a.channels != b.channels {
                    Some(("audio channels", a.channels.to_string(), b.channels.to_string()))
                } else {
                    None
                }
            }
        }
    }
}

pub struct TimelineAssembler {
    tool: Arc<dyn MediaTool>,
    profile: EncodeProfile,
    owners: Option<RunOwners>,
}

impl TimelineAssembler {
    pub fn new(tool: Arc<dyn MediaTool>, profile: EncodeProfile) -> Self {
        Self {
            tool,
            profile,
            owners: None,
        }
    }

    /// Tag every process this assembler starts, so a forced cancel of the build can find them.
    pub fn with_owners(mut self, owners: RunOwners) -> Self {
        self.owners = Some(owners);
        self
    }

    /// Probe every input and check they can be stream-copied together.
    /// Returns the probe results in input order.
    pub fn validate(&self, inputs: &[AssemblyInput]) -> Result<Vec<ClipInfo>, AppError> {
        if inputs.is_empty() {
            return Err(AppError::InvalidRequest("timeline has no clips".into()));
        }
        for (i, input) in inputs.iter().enumerate() {
            if !input.target_duration.is_finite() || input.target_duration <= 0.0 {
                return Err(AppError::InvalidRequest(format!(
                    "clip {} has invalid target duration {}",
                    i, input.target_duration
                )));
            }
        }

        let infos = inputs
            .iter()
            .map(|input| self.tool.probe(&input.path))
            .collect::<Result<Vec<_>, _>>()?;

        let mut reference: Option<StreamShape> = None;
        for (i, (input, info)) in inputs.iter().zip(&infos).enumerate() {
            let shape = StreamShape::of(info).ok_or_else(|| {
                AppError::ShapeMismatch(format!(
                    "clip {} ({}) has no video stream",
                    i,
                    input.path.display()
                ))
            })?;
            match &reference {
                None => reference = Some(shape),
                Some(first) => {
                    if let Some((field, value, expected)) = shape.difference(first) {
                        return Err(AppError::ShapeMismatch(format!(
                            "clip {} ({}): {} is {}, clip 0 has {}",
                            i,
                            input.path.display(),
                            field,
                            value,
                            expected
                        )));
                    }
                }
            }
        }
        Ok(infos)
    }

    /// Trim, join and publish `inputs` at `output`. Blocking.
    ///
    /// Intermediate files live in a workspace directory next to `output` and are removed
    /// when this returns. `output` is only written by a final rename, so on failure any
    /// previous file at that path is left untouched.
    pub fn assemble(
        &self,
        inputs: &[AssemblyInput],
        output: &Path,
        options: AssembleOptions,
    ) -> Result<AssembledTimeline, AppError> {
        let infos = self.validate(inputs)?;
        let has_audio = infos.first().is_some_and(ClipInfo::has_audio_stream);

        let output_dir = match output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&output_dir)?;
        let workspace = tempfile::Builder::new()
            .prefix(".clipjoin-assemble-")
            .tempdir_in(&output_dir)?;

        let mut segments = Vec::with_capacity(inputs.len());
        let mut parts = Vec::with_capacity(inputs.len());
        for (i, (input, info)) in inputs.iter().zip(&infos).enumerate() {
            let picture = info.video_duration();
            let available = if picture > 0.0 {
                picture
            } else {
                input.target_duration
            };
            let wanted = input.target_duration.min(available);
            let trimmed = available - wanted > TRIM_TOLERANCE_SECS;
            let part = if trimmed {
                let part = workspace.path().join(format!("segment-{:03}.mp4", i));
                let args =
                    build_trim_args(&path_to_string(&input.path), &path_to_string(&part), wanted);
                self.tool
                    .run(&args, Some(wanted), None, self.owners.as_ref())?;
                part
            } else {
                input.path.clone()
            };
            parts.push(std::path::absolute(&part)?);
            segments.push(AssembledSegment {
                index: i,
                duration_secs: wanted,
                trimmed,
            });
        }

        let manifest_path = workspace.path().join("concat.txt");
        fs::write(&manifest_path, concat_manifest(&parts))?;
        let joined = workspace.path().join("joined.mp4");
        let expected: f64 = segments.iter().map(|s| s.duration_secs).sum();
        self.tool.run(
            &build_concat_args(&path_to_string(&manifest_path), &path_to_string(&joined)),
            Some(expected),
            None,
            self.owners.as_ref(),
        )?;

        let finished = if options.repair {
            log::info!(
                target: "clipjoin::timeline",
                "Repair pass requested; re-encoding joined file"
            );
            let repaired = workspace.path().join("repaired.mp4");
            let args = build_repair_args(
                &path_to_string(&joined),
                &path_to_string(&repaired),
                has_audio,
                &self.profile,
            );
            self.tool
                .run(&args, Some(expected), None, self.owners.as_ref())?;
            repaired
        } else {
            joined
        };

        if options.verify {
            self.tool.verify(&finished)?;
        }

        fs::rename(&finished, output)?;

        let duration_secs = match self.tool.probe(output) {
            Ok(info) if info.duration > 0.0 => info.duration,
            Ok(_) => expected,
            Err(e) => {
                log::warn!(
                    target: "clipjoin::timeline",
                    "Could not probe joined output {}: {}",
                    output.display(),
                    e
                );
                expected
            }
        };
        log::info!(
            target: "clipjoin::timeline",
            "Joined {} clip(s) into {} ({:.3}s, requested {:.3}s)",
            segments.len(),
            output.display(),
            duration_secs,
            expected
        );

        Ok(AssembledTimeline {
            output_path: output.to_path_buf(),
            duration_secs,
            segments,
            repaired: options.repair,
        })
    }
}
