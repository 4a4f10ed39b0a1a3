//! FFmpeg process spawning and progress parsing.
//!
//! Spawns FFmpeg as a child process, parses progress from stdout (pipe:1) and keeps a bounded
//! tail of stderr for error reporting. Several encodes may run at once (one per normalization
//! worker, possibly for different builds), so live children are kept in a registry together
//! with the builds that own them. `terminate_cancelled_ffmpeg` kills only the children whose
//! owners have all been cancelled.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};

#[cfg(windows)]
use std::os::windows::process::CommandExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::progress::parse_ffmpeg_progress;
use crate::error::AppError;

/// Receives normalized progress in [0,1].
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Sentinel for "duration not yet known". AtomicU64 cannot hold Option<f64>,
/// so duration is stored as f64 bits; u64::MAX means "not yet known".
const NONE_DURATION_BITS: u64 = u64::MAX;

const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(250);
/// Keep only the last N bytes of stderr to avoid unbounded memory growth.
const MAX_STDERR_BYTES: usize = 64 * 1024;

static ACTIVE_FFMPEG_PROCESSES: LazyLock<Mutex<HashMap<u64, ActiveProcess>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

struct ActiveProcess {
    child: Child,
    owners: Option<RunOwners>,
}

/// The builds waiting on one FFmpeg run, by cancellation token. Shared: a build that joins
/// another build's in-flight encode adds itself while the encode is queued or running.
#[derive(Clone, Default)]
pub struct RunOwners {
    tokens: Arc<Mutex<Vec<(u64, CancellationToken)>>>,
}

impl RunOwners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owned by a single build.
    pub fn of(token: &CancellationToken) -> Self {
        let owners = Self::new();
        owners.add(token);
        owners
    }

    /// Returns an id for [`RunOwners::remove`].
    pub fn add(&self, token: &CancellationToken) -> u64 {
        let id = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
        self.tokens.lock().push((id, token.clone()));
        id
    }

    pub fn remove(&self, id: u64) {
        self.tokens.lock().retain(|(owner, _)| *owner != id);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    /// True when there is at least one owner and every owner has been cancelled.
    pub fn all_cancelled(&self) -> bool {
        let tokens = self.tokens.lock();
        !tokens.is_empty() && tokens.iter().all(|(_, token)| token.is_cancelled())
    }

    pub fn same_as(&self, other: &RunOwners) -> bool {
        Arc::ptr_eq(&self.tokens, &other.tokens)
    }
}

impl std::fmt::Debug for RunOwners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOwners").field("owners", &self.len()).finish()
    }
}

struct ReadStreamConfig {
    collect_stderr: Option<Arc<Mutex<Vec<u8>>>>,
    duration: Arc<AtomicU64>,
    progress_callback: Option<ProgressCallback>,
}

fn read_stream<R: std::io::Read + Send + 'static>(
    reader: R,
    config: ReadStreamConfig,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let load_duration = || {
            let bits = config.duration.load(Ordering::Relaxed);
            (bits != NONE_DURATION_BITS).then(|| f64::from_bits(bits))
        };
        let mut last_emit = Instant::now();
        let mut last_progress = 0.0_f64;
        let mut stream_reader = BufReader::new(reader);
        let mut line_buf = Vec::with_capacity(256);
        while stream_reader.read_until(b'\n', &mut line_buf).unwrap_or(0) > 0 {
            let line = String::from_utf8_lossy(&line_buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(ref buf) = config.collect_stderr {
                let mut guard = buf.lock();
                guard.extend_from_slice(line.as_bytes());
                guard.push(b'\n');
                if guard.len() > MAX_STDERR_BYTES {
                    let excess = guard.len() - MAX_STDERR_BYTES;
                    guard.drain(..excess);
                }
            }
            let (progress, d) = parse_ffmpeg_progress(line, load_duration());
            if let Some(new_dur) = d {
                config.duration.store(new_dur.to_bits(), Ordering::Relaxed);
            }
            if let (Some(p), Some(cb)) = (progress, config.progress_callback.as_ref()) {
                let now = Instant::now();
                if now.duration_since(last_emit) >= PROGRESS_EMIT_INTERVAL
                    || (p - last_progress).abs() >= 0.05
                    || p >= 1.0
                {
                    last_emit = now;
                    last_progress = p;
                    cb(p);
                }
            }
            line_buf.clear();
        }
    })
}

/// Run FFmpeg and block until completion.
///
/// - `duration_secs`: seeds the shared duration so progress can be computed from `out_time_*`
///   before the Duration banner arrives on stderr.
/// - `owners`: the builds this run serves. A run without owners is never killed by
///   `terminate_cancelled_ffmpeg`.
/// - Returns `Cancelled` when the process was removed from the registry by
///   `terminate_cancelled_ffmpeg` while running.
pub fn run_ffmpeg_blocking(
    ffmpeg: &Path,
    args: &[String],
    duration_secs: Option<f64>,
    progress_callback: Option<ProgressCallback>,
    owners: Option<&RunOwners>,
) -> Result<(), AppError> {
    let input_arg = args
        .iter()
        .position(|a| a == "-i")
        .and_then(|i| args.get(i + 1));
    log::debug!(
        target: "clipjoin::ffmpeg::runner",
        "Spawning FFmpeg: path={}, input={:?}, output={:?}",
        ffmpeg.display(),
        input_arg,
        args.last()
    );

    let mut cmd = Command::new(ffmpeg);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(windows)]
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn FFmpeg: {}", e))?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(AppError::from("Failed to capture FFmpeg output streams"));
    };

    let process_id = NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed);
    ACTIVE_FFMPEG_PROCESSES.lock().insert(
        process_id,
        ActiveProcess {
            child,
            owners: owners.cloned(),
        },
    );

    let duration = Arc::new(AtomicU64::new(
        duration_secs
            .filter(|&d| d > 0.0)
            .map(f64::to_bits)
            .unwrap_or(NONE_DURATION_BITS),
    ));
    let stderr_buffer = Arc::new(Mutex::new(Vec::new()));

    let stdout_handle = read_stream(
        stdout,
        ReadStreamConfig {
            collect_stderr: None,
            duration: Arc::clone(&duration),
            progress_callback,
        },
    );
    let stderr_handle = read_stream(
        stderr,
        ReadStreamConfig {
            collect_stderr: Some(Arc::clone(&stderr_buffer)),
            duration: Arc::clone(&duration),
            progress_callback: None,
        },
    );

    let _ = stdout_handle.join();
    let _ = stderr_handle.join();

    let process = ACTIVE_FFMPEG_PROCESSES.lock().remove(&process_id);
    let status = match process {
        Some(mut p) => p.child.wait()?,
        None => {
            log::warn!(
                target: "clipjoin::ffmpeg::runner",
                "FFmpeg process {} was terminated externally",
                process_id
            );
            return Err(AppError::Cancelled);
        }
    };

    let stderr_str = String::from_utf8_lossy(&stderr_buffer.lock()).to_string();

    if status.success() {
        log::debug!(
            target: "clipjoin::ffmpeg::runner",
            "FFmpeg completed: output={:?}",
            args.last()
        );
        Ok(())
    } else {
        let code = status.code().unwrap_or(-1);
        let err_preview = stderr_str
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .join("; ");
        log::error!(
            target: "clipjoin::ffmpeg::runner",
            "FFmpeg failed (code={}): {}",
            code,
            err_preview
        );
        Err(AppError::ffmpeg_failed(code, stderr_str))
    }
}

/// Kill every FFmpeg process whose owners have all been cancelled. A process that still
/// serves a live build keeps running. Returns how many were killed.
pub fn terminate_cancelled_ffmpeg() -> usize {
    let doomed: Vec<(u64, ActiveProcess)> = {
        let mut active = ACTIVE_FFMPEG_PROCESSES.lock();
        let ids: Vec<u64> = active
            .iter()
            .filter(|(_, p)| p.owners.as_ref().is_some_and(RunOwners::all_cancelled))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| active.remove(&id).map(|p| (id, p)))
            .collect()
    };
    let count = doomed.len();
    for (id, mut process) in doomed {
        log::info!(
            target: "clipjoin::ffmpeg::runner",
            "Terminating FFmpeg process {}",
            id
        );
        let _ = process.child.kill();
        let _ = process.child.wait();
    }
    count
}
