use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use clipjoin_core::error::AppError;
use clipjoin_core::ffmpeg::{parse_ffmpeg_error, terminate_cancelled_ffmpeg};
use clipjoin_core::{
    ClipCache, EventEmitter, FfmpegCli, MediaTool, PipelineConfig, PipelineEvent,
    TimelineBuilder, TimelineJob,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcSuccess {
    id: u64,
    result: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcFailure {
    id: u64,
    error: RpcErrorPayload,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcErrorPayload {
    summary: String,
    detail: String,
}

#[derive(Debug, serde::Serialize)]
struct RpcEvent {
    event: String,
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaInspectParams {
    input_path: PathBuf,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TimelineCancelParams {
    job_id: Option<u64>,
    /// Also kill running ffmpeg processes instead of waiting for them.
    #[serde(default)]
    force: bool,
}

/// Running builds by job id.
#[derive(Clone, Default)]
struct JobState {
    active: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    next_job_id: Arc<AtomicU64>,
}

impl JobState {
    fn begin_job(&self) -> (u64, CancellationToken) {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        self.active.lock().insert(job_id, token.clone());
        (job_id, token)
    }

    fn finish_job(&self, job_id: u64) {
        self.active.lock().remove(&job_id);
    }

    /// Cancel one job, or every running job when `job_id` is `None`.
    fn cancel(&self, job_id: Option<u64>) -> Result<Vec<u64>, AppError> {
        let active = self.active.lock();
        match job_id {
            Some(id) => {
                let token = active
                    .get(&id)
                    .ok_or_else(|| AppError::InvalidRequest(format!("Unknown jobId: {}", id)))?;
                token.cancel();
                Ok(vec![id])
            }
            None => {
                for token in active.values() {
                    token.cancel();
                }
                Ok(active.keys().copied().collect())
            }
        }
    }
}

struct ActiveJobGuard {
    state: JobState,
    job_id: u64,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.state.finish_job(self.job_id);
    }
}

struct Worker {
    config: PipelineConfig,
    cache: Result<ClipCache, AppError>,
    /// Media tooling, or why it is unavailable.
    media: Result<(Arc<FfmpegCli>, TimelineBuilder), AppError>,
    jobs: JobState,
    writer: SharedWriter,
}

type SharedWriter = Arc<Mutex<io::Stdout>>;

fn write_json_line<T: serde::Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|e| io::Error::other(format!("serialize response: {}", e)))?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn write_json_line_shared<T: serde::Serialize>(writer: &SharedWriter, value: &T) -> io::Result<()> {
    let mut guard = writer.lock();
    write_json_line(&mut *guard, value)
}

fn emit_rpc_event(writer: &SharedWriter, event: &str, payload: Value) {
    let message = RpcEvent {
        event: event.to_string(),
        payload,
    };
    let _ = write_json_line_shared(writer, &message);
}

fn parse_error_payload(err: &AppError) -> RpcErrorPayload {
    match err {
        AppError::Cancelled => RpcErrorPayload {
            summary: "Cancelled".to_string(),
            detail: "Cancelled".to_string(),
        },
        AppError::FfmpegFailed { code, stderr } if *code == -1 => RpcErrorPayload {
            summary: stderr.clone(),
            detail: stderr.clone(),
        },
        AppError::FfmpegFailed { code, stderr } => {
            let parsed = parse_ffmpeg_error(stderr, Some(*code));
            RpcErrorPayload {
                summary: parsed.summary,
                detail: parsed.detail,
            }
        }
        other => {
            let (summary, detail) = other.summary_and_detail();
            RpcErrorPayload { summary, detail }
        }
    }
}

fn params_from_value<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, AppError> {
    serde_json::from_value(params)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid params payload: {}", e)))
}

fn to_value<T: serde::Serialize>(value: T, what: &str) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|e| AppError::from(format!("Failed to serialize {}: {}", what, e)))
}

fn respond(writer: &SharedWriter, id: u64, result: Result<Value, AppError>) {
    let written = match result {
        Ok(result) => write_json_line_shared(writer, &RpcSuccess { id, result }),
        Err(err) => write_json_line_shared(
            writer,
            &RpcFailure {
                id,
                error: parse_error_payload(&err),
            },
        ),
    };
    if let Err(e) = written {
        log::error!(target: "clipjoin::worker", "Failed to write response {}: {}", id, e);
    }
}

impl Worker {
    fn media(&self) -> Result<&(Arc<FfmpegCli>, TimelineBuilder), AppError> {
        self.media.as_ref().map_err(AppError::duplicate)
    }

    fn cache(&self) -> Result<&ClipCache, AppError> {
        self.cache.as_ref().map_err(AppError::duplicate)
    }

    fn dispatch_sync(&self, method: &str, params: Value) -> Result<Value, AppError> {
        match method {
            "app.capabilities" => {
                let (ffmpeg, ffprobe) = match &self.media {
                    Ok((cli, _)) => (
                        Some(cli.ffmpeg_path().to_path_buf()),
                        Some(cli.ffprobe_path().to_path_buf()),
                    ),
                    Err(_) => (None, None),
                };
                Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "ffmpegPath": ffmpeg,
                    "ffprobePath": ffprobe,
                    "cacheDir": self.config.resolved_cache_dir(),
                    "cacheAvailable": self.cache.is_ok(),
                    "cropModes": ["center", "fit", "fill"],
                    "profile": self.config.profile,
                }))
            }
            "media.inspect" => {
                let parsed: MediaInspectParams = params_from_value(params)?;
                let (cli, _) = self.media()?;
                let info = cli.probe(&parsed.input_path)?;
                let has_audio = info.has_audio_stream();
                let mut value = to_value(info, "clip info")?;
                value["hasAudio"] = Value::Bool(has_audio);
                Ok(value)
            }
            "timeline.cancel" => {
                let parsed: TimelineCancelParams = if params.is_null() {
                    TimelineCancelParams::default()
                } else {
                    params_from_value(params)?
                };
                let cancelled = self.jobs.cancel(parsed.job_id)?;
                let terminated = if parsed.force && !cancelled.is_empty() {
                    terminate_cancelled_ffmpeg()
                } else {
                    0
                };
                log::info!(
                    target: "clipjoin::worker",
                    "Cancel requested for jobs {:?} (force={}, terminated {} ffmpeg process(es))",
                    cancelled,
                    parsed.force,
                    terminated
                );
                Ok(json!({ "cancelled": cancelled, "terminated": terminated }))
            }
            "cache.stats" => to_value(self.cache()?.stats(), "cache stats"),
            "cache.clear" => to_value(self.cache()?.clear_all(), "clear report"),
            "timeline.build" => Err(AppError::InvalidRequest(
                "timeline.build requires async execution".into(),
            )),
            _ => Err(AppError::InvalidRequest(format!("Unknown method: {}", method))),
        }
    }

    async fn run_build(self: Arc<Self>, request: RpcRequest) {
        let job: TimelineJob = match params_from_value(request.params) {
            Ok(job) => job,
            Err(err) => return respond(&self.writer, request.id, Err(err)),
        };
        let builder = match self.media() {
            Ok((_, builder)) => builder.clone(),
            Err(err) => return respond(&self.writer, request.id, Err(err)),
        };

        let (job_id, token) = self.jobs.begin_job();
        let _job_guard = ActiveJobGuard {
            state: self.jobs.clone(),
            job_id,
        };
        emit_rpc_event(
            &self.writer,
            "timeline.job.started",
            json!({ "jobId": job_id, "requestId": request.id }),
        );

        let writer = Arc::clone(&self.writer);
        let events = EventEmitter::new(Some(Arc::new(move |event: PipelineEvent| {
            emit_rpc_event(
                &writer,
                "timeline.event",
                json!({ "jobId": job_id, "event": event }),
            );
        })));

        let result = builder.with_events(events).build(&job, &token).await;
        let result = match result {
            Ok(output) => {
                emit_rpc_event(
                    &self.writer,
                    "timeline.job.complete",
                    json!({ "jobId": job_id }),
                );
                to_value(output, "timeline output").map(|mut value| {
                    value["jobId"] = json!(job_id);
                    value
                })
            }
            Err(err) => {
                let payload = parse_error_payload(&err);
                emit_rpc_event(
                    &self.writer,
                    "timeline.job.error",
                    json!({
                        "jobId": job_id,
                        "cancelled": err.is_cancelled(),
                        "summary": payload.summary,
                        "detail": payload.detail,
                    }),
                );
                Err(err)
            }
        };
        respond(&self.writer, request.id, result);
    }
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
}

fn main() -> io::Result<()> {
    init_logging();

    let config = match PipelineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!(target: "clipjoin::worker", "Invalid configuration, using defaults: {}", e);
            PipelineConfig::default()
        }
    };
    let cache = ClipCache::open(config.cache_config());
    if let Err(e) = &cache {
        log::warn!(target: "clipjoin::worker", "Clip cache unavailable: {}", e);
    }
    let media = FfmpegCli::discover().map(|cli| {
        let cli = Arc::new(cli);
        let tool: Arc<dyn MediaTool> = cli.clone();
        let builder_cache = cache.as_ref().cloned().map_err(AppError::duplicate);
        let builder = TimelineBuilder::new(tool, builder_cache, &config, EventEmitter::default());
        (cli, builder)
    });
    if let Err(e) = &media {
        log::error!(target: "clipjoin::worker", "FFmpeg unavailable: {}", e);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("clipjoin-worker")
        .build()?;

    let worker = Arc::new(Worker {
        config,
        cache,
        media,
        jobs: JobState::default(),
        writer: Arc::new(Mutex::new(io::stdout())),
    });
    let mut builds = Vec::new();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                let failure = RpcFailure {
                    id: 0,
                    error: RpcErrorPayload {
                        summary: "Invalid input stream".to_string(),
                        detail: err.to_string(),
                    },
                };
                let _ = write_json_line_shared(&worker.writer, &failure);
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let failure = RpcFailure {
                    id: 0,
                    error: RpcErrorPayload {
                        summary: "Invalid request".to_string(),
                        detail: err.to_string(),
                    },
                };
                let _ = write_json_line_shared(&worker.writer, &failure);
                continue;
            }
        };

        if request.method == "timeline.build" {
            builds.push(runtime.spawn(Arc::clone(&worker).run_build(request)));
        } else {
            let result = worker.dispatch_sync(&request.method, request.params);
            respond(&worker.writer, request.id, result);
        }
    }

    // stdin closed: let running builds finish, then persist cache access times.
    runtime.block_on(async {
        for build in builds {
            if let Err(e) = build.await {
                log::error!(target: "clipjoin::worker", "Build task failed: {}", e);
            }
        }
    });
    if let Ok(cache) = &worker.cache {
        cache.flush();
    }
    Ok(())
}
