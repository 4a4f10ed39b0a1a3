#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use clipjoin_core::cache::CacheConfig;
use clipjoin_core::{
    ClipCache, EventEmitter, FfmpegCli, MediaTool, PipelineConfig, TimelineBuilder,
};

/// Shape of a generated source clip.
pub struct TestSource {
    pub width: u32,
    pub height: u32,
    pub rate: u32,
    pub duration_secs: f32,
    pub with_audio: bool,
    /// Length of the audio track when it differs from the picture.
    pub audio_secs: Option<f32>,
    /// Shift every timestamp, as cameras and editors sometimes do.
    pub ts_offset_secs: f32,
}

impl TestSource {
    pub fn new(width: u32, height: u32, rate: u32) -> Self {
        Self {
            width,
            height,
            rate,
            duration_secs: 2.0,
            with_audio: true,
            audio_secs: None,
            ts_offset_secs: 0.0,
        }
    }

    pub fn silent(mut self) -> Self {
        self.with_audio = false;
        self
    }

    pub fn offset(mut self, secs: f32) -> Self {
        self.ts_offset_secs = secs;
        self
    }

    pub fn audio_length(mut self, secs: f32) -> Self {
        self.audio_secs = Some(secs);
        self
    }
}

pub struct IntegrationEnv {
    pub ffmpeg: PathBuf,
    pub cli: Arc<FfmpegCli>,
    dir: tempfile::TempDir,
}

impl IntegrationEnv {
    pub fn new() -> Self {
        let cli = FfmpegCli::discover().expect("FFmpeg not found");
        let dir = tempfile::tempdir().expect("tempdir");
        Self {
            ffmpeg: cli.ffmpeg_path().to_path_buf(),
            cli: Arc::new(cli),
            dir,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn tool(&self) -> Arc<dyn MediaTool> {
        self.cli.clone()
    }

    /// Fast profile so the tests spend little time encoding.
    pub fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig {
            cache_dir: Some(self.path("cache")),
            verify_output: true,
            ..PipelineConfig::default()
        };
        config.profile.preset = "ultrafast".into();
        config
    }

    pub fn builder(&self) -> TimelineBuilder {
        let config = self.config();
        let cache = ClipCache::open(CacheConfig::new(self.path("cache")));
        TimelineBuilder::new(self.tool(), cache, &config, EventEmitter::default())
    }

    pub fn with_source(&self, name: &str, source: &TestSource) -> PathBuf {
        let output = self.path(name);
        create_source(&self.ffmpeg, &output, source);
        output
    }
}

pub fn create_source(ffmpeg: &Path, output_path: &Path, source: &TestSource) {
    let mut args = vec![
        "-loglevel".to_string(),
        "error".to_string(),
        "-y".to_string(),
        "-f".to_string(),
        "lavfi".to_string(),
        "-i".to_string(),
        format!(
            "testsrc=duration={}:size={}x{}:rate={}",
            source.duration_secs, source.width, source.height, source.rate
        ),
    ];
    if source.with_audio {
        args.extend([
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!(
                "sine=frequency=440:sample_rate=44100:duration={}",
                source.audio_secs.unwrap_or(source.duration_secs)
            ),
        ]);
    }
    args.extend([
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "ultrafast".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
    ]);
    if source.with_audio {
        args.extend(["-c:a".to_string(), "aac".to_string()]);
    }
    if source.ts_offset_secs > 0.0 {
        args.extend([
            "-output_ts_offset".to_string(),
            format!("{}", source.ts_offset_secs),
        ]);
    }
    args.push(output_path.to_string_lossy().to_string());

    let status = Command::new(ffmpeg)
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("failed to spawn ffmpeg");
    assert!(status.success(), "ffmpeg failed to create test source");
}
