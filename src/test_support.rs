//! In-process stand-in for ffmpeg/ffprobe used by unit tests.
//!
//! `run` records its arguments and writes the argument list into the output path (the last
//! argument), so different invocations produce different bytes. `probe` answers from
//! registered results, then from files it wrote itself (dropping the audio stream when the
//! invocation had `-an`), then from the default clip shape.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::AppError;
use crate::ffmpeg::{AudioStreamInfo, ClipInfo, ProgressCallback, RunOwners, VideoStreamInfo};
use crate::media::MediaTool;

const FAKE_HEADER: &str = "fake-ffmpeg-output";

pub fn clip_info(width: u32, height: u32, frame_rate: &str, with_audio: bool) -> ClipInfo {
    ClipInfo {
        duration: 4.0,
        start_time: Some(0.0),
        size: 1_000,
        format_name: Some("mov,mp4,m4a,3gp,3g2,mj2".into()),
        video: Some(VideoStreamInfo {
            codec_name: Some("h264".into()),
            width,
            height,
            pix_fmt: Some("yuv420p".into()),
            frame_rate: frame_rate.to_string(),
            fps: 30.0,
            start_time: Some(0.0),
            duration: Some(4.0),
        }),
        audio: with_audio.then(|| AudioStreamInfo {
            codec_name: Some("aac".into()),
            sample_rate: 48_000,
            channels: 2,
            start_time: Some(0.0),
            duration: Some(4.0),
        }),
    }
}

pub struct FakeMediaTool {
    default_info: Mutex<ClipInfo>,
    probes: Mutex<HashMap<PathBuf, ClipInfo>>,
    calls: Mutex<Vec<Vec<String>>>,
    fail_matching: Mutex<Option<String>>,
    run_delay: Mutex<Duration>,
    verify_fails: AtomicBool,
    run_owners: Mutex<Vec<Option<RunOwners>>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Default for FakeMediaTool {
    fn default() -> Self {
        Self {
            default_info: Mutex::new(clip_info(1080, 1920, "30/1", true)),
            probes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_matching: Mutex::new(None),
            run_delay: Mutex::new(Duration::ZERO),
            verify_fails: AtomicBool::new(false),
            run_owners: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }
}

impl FakeMediaTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default_info(&self, info: ClipInfo) {
        *self.default_info.lock() = info;
    }

    pub fn set_probe(&self, path: &Path, info: ClipInfo) {
        self.probes.lock().insert(path.to_path_buf(), info);
    }

    /// Any invocation whose arguments contain `needle` fails with exit code 1.
    pub fn fail_runs_matching(&self, needle: &str) {
        *self.fail_matching.lock() = Some(needle.to_string());
    }

    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock() = delay;
    }

    pub fn set_verify_fails(&self, fails: bool) {
        self.verify_fails.store(fails, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    /// The owners handed to each `run`, in call order. Live handles: a build that joins a
    /// running encode shows up here while the encode is still in progress.
    pub fn run_owners(&self) -> Vec<Option<RunOwners>> {
        self.run_owners.lock().clone()
    }

    /// Most invocations that were ever in progress at the same time.
    pub fn max_concurrent_runs(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Invocations that encode video (normalize or repair), as opposed to stream copies.
    pub fn encode_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|args| args.iter().any(|a| a == "-c:v"))
            .count()
    }

    fn info_from_written_file(&self, path: &Path) -> Option<ClipInfo> {
        let content = fs::read_to_string(path).ok()?;
        let mut lines = content.lines();
        if lines.next()? != FAKE_HEADER {
            return None;
        }
        let args: Vec<&str> = lines.collect();
        let mut info = self.default_info.lock().clone();
        if args.contains(&"-an") {
            info.audio = None;
        } else if args.contains(&"-c:a") && info.audio.is_none() {
            info.audio = clip_info(0, 0, "30/1", true).audio;
        }
        let trimmed = args
            .windows(2)
            .find(|w| w[0] == "-t")
            .and_then(|w| w[1].parse::<f64>().ok());
        if let Some(t) = trimmed {
            info.duration = info.duration.min(t);
            if let Some(video) = info.video.as_mut() {
                video.duration = video.duration.map(|d| d.min(t));
            }
            if let Some(audio) = info.audio.as_mut() {
                audio.duration = audio.duration.map(|d| d.min(t));
            }
        }
        Some(info)
    }

    fn write_output(
        &self,
        args: &[String],
        progress: Option<ProgressCallback>,
    ) -> Result<(), AppError> {
        let delay = *self.run_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(needle) = self.fail_matching.lock().as_deref()
            && args.iter().any(|a| a.contains(needle))
        {
            return Err(AppError::ffmpeg_failed(1, "fake encoder failure"));
        }
        let output = args
            .last()
            .ok_or_else(|| AppError::from("no output argument"))?;
        let mut content = String::from(FAKE_HEADER);
        for arg in args {
            content.push('\n');
            content.push_str(arg);
        }
        fs::write(output, content)?;
        if let Some(cb) = progress {
            cb(1.0);
        }
        Ok(())
    }
}

impl MediaTool for FakeMediaTool {
    fn probe(&self, path: &Path) -> Result<ClipInfo, AppError> {
        if let Some(info) = self.probes.lock().get(path) {
            return Ok(info.clone());
        }
        if !path.is_file() {
            return Err(AppError::source_unreadable(path, "file does not exist"));
        }
        Ok(self
            .info_from_written_file(path)
            .unwrap_or_else(|| self.default_info.lock().clone()))
    }

    fn run(
        &self,
        args: &[String],
        _duration_secs: Option<f64>,
        progress: Option<ProgressCallback>,
        owners: Option<&RunOwners>,
    ) -> Result<(), AppError> {
        self.calls.lock().push(args.to_vec());
        self.run_owners.lock().push(owners.cloned());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let result = self.write_output(args, progress);
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn verify(&self, path: &Path) -> Result<(), AppError> {
        if self.verify_fails.load(Ordering::Relaxed) {
            return Err(AppError::ffmpeg_failed(
                1,
                format!("Decode check failed for {}", path.display()),
            ));
        }
        Ok(())
    }
}
