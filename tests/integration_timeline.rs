#![cfg(feature = "integration-test-api")]

mod support;

use clipjoin_core::request::{AudioMode, Canvas, CropMode, EncodeProfile, NormalizationRequest};
use clipjoin_core::{
    ClipNormalizer, ClipOutcome, JobClip, MediaTool, SourceIdentity, TimelineJob, TimelineOutput,
};
use support::{IntegrationEnv, TestSource};
use tokio_util::sync::CancellationToken;

/// One video frame at 30 fps; an AAC frame is about 21 ms at 48 kHz.
const LENGTH_TOLERANCE_SECS: f64 = 1.0 / 30.0;
/// Stream-copy trims cut audio on AAC frame boundaries, once per joined segment.
const JOINED_TOLERANCE_SECS: f64 = 0.1;

fn job(
    env: &IntegrationEnv,
    sources: &[std::path::PathBuf],
    volume: f64,
    output: &str,
) -> TimelineJob {
    TimelineJob {
        clips: sources
            .iter()
            .map(|path| JobClip {
                path: path.clone(),
                target_duration: 1.5,
            })
            .collect(),
        canvas: Canvas {
            width: 360,
            height: 640,
        },
        crop_mode: CropMode::Center,
        original_volume: volume,
        output_path: env.path(output),
        repair: false,
    }
}

fn mixed_sources(env: &IntegrationEnv) -> Vec<std::path::PathBuf> {
    vec![
        env.with_source("landscape.mp4", &TestSource::new(640, 360, 30)),
        env.with_source("portrait_silent.mp4", &TestSource::new(360, 640, 25).silent()),
        env.with_source("square.mp4", &TestSource::new(480, 480, 60).offset(1.5)),
    ]
}

fn outcomes(output: &TimelineOutput) -> Vec<ClipOutcome> {
    output.clips.iter().map(|c| c.outcome).collect()
}

fn normalize_request(source: &std::path::Path, mode: AudioMode) -> NormalizationRequest {
    let mut profile = EncodeProfile::default();
    profile.preset = "ultrafast".into();
    NormalizationRequest {
        source: SourceIdentity::capture(source).expect("capture"),
        canvas: Canvas {
            width: 360,
            height: 640,
        },
        crop_mode: CropMode::Fit,
        audio_mode: mode,
        profile,
    }
}

/// Audio and video of one file end together.
fn assert_tracks_match(env: &IntegrationEnv, path: &std::path::Path, tolerance: f64) {
    let info = env.cli.probe(path).expect("probe");
    let video = info.video.as_ref().and_then(|v| v.duration).expect("video duration");
    let audio = info.audio.as_ref().and_then(|a| a.duration).expect("audio duration");
    assert!(
        (audio - video).abs() <= tolerance,
        "{}: audio {audio}s vs video {video}s",
        path.display()
    );
}

#[test]
fn normalized_streams_start_at_zero() {
    let env = IntegrationEnv::new();
    let source = env.with_source("shifted.mp4", &TestSource::new(320, 240, 30).offset(2.0));
    let normalizer = ClipNormalizer::new(env.tool());

    for mode in [AudioMode::Keep, AudioMode::Strip] {
        let request = normalize_request(&source, mode);
        let output = env.path(&format!("normalized-{}.mp4", mode.as_str()));
        normalizer
            .normalize(&request, &output, None, None)
            .expect("normalize");

        let info = env.cli.probe(&output).expect("probe");
        let video = info.video.as_ref().expect("video stream");
        assert_eq!((video.width, video.height), (360, 640));
        assert_eq!(video.frame_rate, "30/1");
        assert_eq!(video.start_time, Some(0.0), "video must start at exactly zero");
        match mode {
            AudioMode::Keep => {
                let audio = info.audio.as_ref().expect("audio stream");
                assert_eq!(audio.sample_rate, 48_000);
                assert_eq!(audio.channels, 2);
                assert_eq!(audio.start_time, Some(0.0), "audio must start at exactly zero");
            }
            AudioMode::Strip => assert!(info.audio.is_none()),
        }
    }
}

#[test]
fn source_audio_is_fitted_to_the_picture() {
    let env = IntegrationEnv::new();
    let normalizer = ClipNormalizer::new(env.tool());
    let sources = [
        ("long_audio.mp4", TestSource::new(320, 240, 30).audio_length(3.2)),
        ("short_audio.mp4", TestSource::new(320, 240, 30).audio_length(1.1)),
    ];

    for (name, spec) in &sources {
        let source = env.with_source(name, spec);
        let output = env.path(&format!("fitted-{name}"));
        let artifact = normalizer
            .normalize(&normalize_request(&source, AudioMode::Keep), &output, None, None)
            .expect("normalize");
        assert_tracks_match(&env, &output, LENGTH_TOLERANCE_SECS);
        assert!(
            (artifact.duration_secs - 2.0).abs() <= LENGTH_TOLERANCE_SECS,
            "{name}: artifact lasts {}s",
            artifact.duration_secs
        );
    }
}

#[tokio::test]
async fn heterogeneous_clips_join_with_one_uniform_audio_track() {
    let env = IntegrationEnv::new();
    let sources = mixed_sources(&env);
    let builder = env.builder();

    let output = builder
        .build(&job(&env, &sources, 1.0, "keep.mp4"), &CancellationToken::new())
        .await
        .expect("build");

    let info = env.cli.probe(&output.output_path).expect("probe output");
    let video = info.video.as_ref().expect("video");
    assert_eq!((video.width, video.height), (360, 640));
    assert!(info.has_audio_stream(), "keep mode always yields an audio track");
    assert_eq!(video.start_time, Some(0.0));
    assert_tracks_match(&env, &output.output_path, JOINED_TOLERANCE_SECS);
    for entry in std::fs::read_dir(env.path("cache").join("clips")).expect("cached clips") {
        assert_tracks_match(&env, &entry.expect("entry").path(), LENGTH_TOLERANCE_SECS);
    }
    assert!(
        (output.duration_secs - 4.5).abs() < 0.3,
        "joined duration {}",
        output.duration_secs
    );
    env.cli.verify(&output.output_path).expect("joined file decodes");
}

#[tokio::test]
async fn second_build_reuses_every_clip() {
    let env = IntegrationEnv::new();
    let sources = mixed_sources(&env);
    let builder = env.builder();
    let token = CancellationToken::new();

    let first = builder
        .build(&job(&env, &sources, 1.0, "first.mp4"), &token)
        .await
        .expect("first build");
    assert_eq!(outcomes(&first), vec![ClipOutcome::Miss; 3]);

    let second = builder
        .build(&job(&env, &sources, 1.0, "second.mp4"), &token)
        .await
        .expect("second build");
    assert_eq!(outcomes(&second), vec![ClipOutcome::Hit; 3]);
    assert!(second.output_path.is_file());
}

#[tokio::test]
async fn zero_volume_build_is_video_only_and_cached_separately() {
    let env = IntegrationEnv::new();
    let sources = mixed_sources(&env);
    let builder = env.builder();
    let token = CancellationToken::new();

    builder
        .build(&job(&env, &sources, 0.8, "keep.mp4"), &token)
        .await
        .expect("keep build");
    let strip = builder
        .build(&job(&env, &sources, 0.0, "strip.mp4"), &token)
        .await
        .expect("strip build");

    assert_eq!(strip.audio_mode, AudioMode::Strip);
    assert_eq!(outcomes(&strip), vec![ClipOutcome::Miss; 3]);
    let info = env.cli.probe(&strip.output_path).expect("probe output");
    assert!(!info.has_audio_stream());
    assert_eq!(builder.cache().expect("cache").stats().file_count, 6);
}
