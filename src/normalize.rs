//! Turns one source clip into a canonical intermediate: fixed canvas and frame grid,
//! zero-based timestamps, and an audio track that is present or absent per the audio mode.
//! This is the only place that asks the encoder to re-encode a clip.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::AppError;
use crate::ffmpeg::{
    AudioPlan, ClipInfo, NormalizePlan, ProgressCallback, RunOwners, build_normalize_args,
    path_to_string,
};
use crate::media::MediaTool;
use crate::request::{AudioMode, NormalizationRequest};

/// A finished artifact at a staging path, not yet owned by any cache.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub has_audio: bool,
    /// Probed from the artifact itself, not the source.
    pub duration_secs: f64,
}

/// Audio handling for one clip given the build-wide mode and what the source carries.
/// Both audio branches are sized to the picture, so the artifact ends with its last frame.
pub fn plan_audio(info: &ClipInfo, mode: AudioMode) -> AudioPlan {
    let duration_secs = info.video_duration().max(0.0);
    match (mode, info.has_audio_stream()) {
        (AudioMode::Strip, _) => AudioPlan::None,
        (AudioMode::Keep, true) => AudioPlan::Source { duration_secs },
        (AudioMode::Keep, false) => AudioPlan::Silence { duration_secs },
    }
}

pub struct ClipNormalizer {
    tool: Arc<dyn MediaTool>,
}

impl ClipNormalizer {
    pub fn new(tool: Arc<dyn MediaTool>) -> Self {
        Self { tool }
    }

    /// Encode `request.source` into `output`. Blocking.
    ///
    /// On any failure the output path is removed, so a failed encode never leaves a
    /// partial file behind for the cache to pick up. `owners` are the builds waiting on this
    /// encode; a forced cancel only kills it once all of them are cancelled.
    pub fn normalize(
        &self,
        request: &NormalizationRequest,
        output: &Path,
        progress: Option<ProgressCallback>,
        owners: Option<&RunOwners>,
    ) -> Result<NormalizedArtifact, AppError> {
        request.canvas.validate()?;
        request.profile.validate()?;

        let source_path = &request.source.path;
        let info = self.tool.probe(source_path)?;
        if info.video.is_none() {
            return Err(AppError::source_unreadable(source_path, "no video stream"));
        }

        let audio = plan_audio(&info, request.audio_mode);
        let args = build_normalize_args(
            &path_to_string(source_path),
            &path_to_string(output),
            &NormalizePlan {
                canvas: request.canvas,
                crop_mode: request.crop_mode,
                audio,
                profile: &request.profile,
            },
        );

        log::info!(
            target: "clipjoin::normalize",
            "Normalizing {} -> {} ({}, {}, {:?})",
            request.source,
            request.canvas,
            request.crop_mode.as_str(),
            request.audio_mode.as_str(),
            audio
        );

        let expected = info.video_duration();
        let result = self
            .tool
            .run(&args, (expected > 0.0).then_some(expected), progress, owners)
            .map_err(|e| match e {
                AppError::FfmpegFailed { code, stderr } => AppError::EncodeFailed {
                    source_identity: request.source.to_string(),
                    code,
                    stderr,
                    args: args.clone(),
                },
                other => other,
            })
            .and_then(|()| self.finished_artifact(request, output, &args));

        if result.is_err() && output.exists() {
            let _ = fs::remove_file(output);
        }
        result
    }

    fn finished_artifact(
        &self,
        request: &NormalizationRequest,
        output: &Path,
        args: &[String],
    ) -> Result<NormalizedArtifact, AppError> {
        let encode_failed = |stderr: String| AppError::EncodeFailed {
            source_identity: request.source.to_string(),
            code: 0,
            stderr,
            args: args.to_vec(),
        };
        let size = fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(encode_failed(
                "encoder exited successfully but produced no output".into(),
            ));
        }
        let produced = self
            .tool
            .probe(output)
            .map_err(|e| encode_failed(format!("output is unreadable: {e}")))?;
        let has_audio = produced.has_audio_stream();
        if has_audio != (request.audio_mode == AudioMode::Keep) {
            return Err(encode_failed(format!(
                "output audio track present={has_audio} does not match audio mode {}",
                request.audio_mode.as_str()
            )));
        }
        // The artifact is keyed by the identity captured before encoding.
        if !request.source.is_current() {
            return Err(AppError::source_unreadable(
                &request.source.path,
                "source changed while it was being normalized",
            ));
        }
        Ok(NormalizedArtifact {
            path: output.to_path_buf(),
            size,
            has_audio,
            duration_secs: produced.duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Canvas, CropMode, EncodeProfile, SourceIdentity};
    use crate::test_support::{FakeMediaTool, clip_info};

    struct Fixture {
        _dir: tempfile::TempDir,
        tool: Arc<FakeMediaTool>,
        normalizer: ClipNormalizer,
        source: PathBuf,
        out: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("source.mov");
        fs::write(&source, b"source bytes").expect("write source");
        let tool = Arc::new(FakeMediaTool::new());
        let normalizer = ClipNormalizer::new(tool.clone());
        let out = dir.path().join("out.part.mp4");
        Fixture {
            _dir: dir,
            tool,
            normalizer,
            source,
            out,
        }
    }

    fn request(source: &Path, audio_mode: AudioMode) -> NormalizationRequest {
        NormalizationRequest {
            source: SourceIdentity::capture(source).expect("capture"),
            canvas: Canvas {
                width: 720,
                height: 1280,
            },
            crop_mode: CropMode::Center,
            audio_mode,
            profile: EncodeProfile::default(),
        }
    }

    #[test]
    fn audio_plan_matrix() {
        let with_audio = clip_info(640, 480, "25/1", true);
        let silent = clip_info(640, 480, "25/1", false);
        assert_eq!(plan_audio(&with_audio, AudioMode::Strip), AudioPlan::None);
        assert_eq!(plan_audio(&silent, AudioMode::Strip), AudioPlan::None);
        assert_eq!(
            plan_audio(&with_audio, AudioMode::Keep),
            AudioPlan::Source { duration_secs: 4.0 }
        );
        assert_eq!(
            plan_audio(&silent, AudioMode::Keep),
            AudioPlan::Silence { duration_secs: 4.0 }
        );
    }

    #[test]
    fn audio_is_sized_to_the_picture_not_the_container() {
        let mut long_audio = clip_info(640, 480, "25/1", true);
        long_audio.duration = 5.2;
        if let Some(audio) = long_audio.audio.as_mut() {
            audio.duration = Some(5.2);
        }
        assert_eq!(
            plan_audio(&long_audio, AudioMode::Keep),
            AudioPlan::Source { duration_secs: 4.0 }
        );
        let mut silent = clip_info(640, 480, "25/1", false);
        silent.duration = 6.0;
        assert_eq!(
            plan_audio(&silent, AudioMode::Keep),
            AudioPlan::Silence { duration_secs: 4.0 }
        );
    }

    #[test]
    fn artifact_duration_is_read_from_the_output() {
        let f = fixture();
        let mut source_info = clip_info(640, 480, "25/1", true);
        source_info.duration = 9.0;
        f.tool
            .set_probe(&fs::canonicalize(&f.source).expect("canon"), source_info);
        let mut produced = clip_info(720, 1280, "30/1", true);
        produced.duration = 3.5;
        f.tool.set_probe(&f.out, produced);
        let artifact = f
            .normalizer
            .normalize(&request(&f.source, AudioMode::Keep), &f.out, None, None)
            .expect("normalize");
        assert_eq!(artifact.duration_secs, 3.5);
    }

    #[test]
    fn output_missing_its_audio_track_is_an_encode_failure() {
        let f = fixture();
        f.tool
            .set_probe(&f.out, clip_info(720, 1280, "30/1", false));
        let err = f
            .normalizer
            .normalize(&request(&f.source, AudioMode::Keep), &f.out, None, None)
            .expect_err("audio missing");
        assert!(matches!(err, AppError::EncodeFailed { .. }));
        assert!(!f.out.exists());
    }

    #[test]
    fn keep_on_silent_source_synthesizes_track() {
        let f = fixture();
        f.tool.set_probe(
            &fs::canonicalize(&f.source).expect("canon"),
            clip_info(640, 480, "25/1", false),
        );
        let artifact = f
            .normalizer
            .normalize(&request(&f.source, AudioMode::Keep), &f.out, None, None)
            .expect("normalize");
        assert!(artifact.has_audio);
        assert!(artifact.size > 0);
        let args = &f.tool.calls()[0];
        assert!(args.iter().any(|a| a.starts_with("anullsrc=")));
    }

    #[test]
    fn strip_drops_audio() {
        let f = fixture();
        let artifact = f
            .normalizer
            .normalize(&request(&f.source, AudioMode::Strip), &f.out, None, None)
            .expect("normalize");
        assert!(!artifact.has_audio);
        assert!(f.tool.calls()[0].contains(&"-an".to_string()));
    }

    #[test]
    fn encoder_failure_carries_source_and_args_and_leaves_no_file() {
        let f = fixture();
        f.tool.fail_runs_matching("setpts");
        fs::write(&f.out, b"stale partial").expect("write");
        let err = f
            .normalizer
            .normalize(&request(&f.source, AudioMode::Keep), &f.out, None, None)
            .expect_err("should fail");
        match err {
            AppError::EncodeFailed {
                source_identity,
                args,
                ..
            } => {
                assert!(source_identity.contains("source.mov"));
                assert!(args.iter().any(|a| a.contains("setpts=PTS-STARTPTS")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!f.out.exists());
    }

    #[test]
    fn source_without_video_is_unreadable() {
        let f = fixture();
        let mut info = clip_info(0, 0, "0/0", true);
        info.video = None;
        f.tool
            .set_probe(&fs::canonicalize(&f.source).expect("canon"), info);
        let err = f
            .normalizer
            .normalize(&request(&f.source, AudioMode::Keep), &f.out, None, None)
            .expect_err("no video");
        assert!(matches!(err, AppError::SourceUnreadable { .. }));
        assert!(f.tool.calls().is_empty());
    }

    #[test]
    fn owners_reach_the_encoder() {
        let f = fixture();
        let token = tokio_util::sync::CancellationToken::new();
        let owners = RunOwners::of(&token);
        f.normalizer
            .normalize(&request(&f.source, AudioMode::Strip), &f.out, None, Some(&owners))
            .expect("normalize");
        let recorded = f.tool.run_owners();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].as_ref().is_some_and(|o| o.same_as(&owners)));
    }
}
