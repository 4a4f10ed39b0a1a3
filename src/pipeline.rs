//! One timeline build: pick the audio mode, normalize every clip through the cache with
//! bounded concurrency, then join the pinned artifacts in caller order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::audio_mode::select_audio_mode;
use crate::cache::{CacheOutcome, ClipCache, PinnedClip};
use crate::config::PipelineConfig;
use crate::error::{AppError, ClipFailure};
use crate::events::{EventEmitter, PipelineEvent, Stage};
use crate::ffmpeg::{ProgressCallback, RunOwners, StagingFile};
use crate::media::MediaTool;
use crate::normalize::{ClipNormalizer, NormalizedArtifact};
use crate::request::{
    AudioMode, CacheKey, Canvas, CropMode, EncodeProfile, NormalizationRequest, SourceIdentity,
};
use crate::timeline::{AssembleOptions, AssembledSegment, AssemblyInput, TimelineAssembler};

fn default_volume() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobClip {
    pub path: PathBuf,
    pub target_duration: f64,
}

/// A timeline build request as received from the job layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineJob {
    pub clips: Vec<JobClip>,
    pub canvas: Canvas,
    #[serde(default)]
    pub crop_mode: CropMode,
    /// Volume the user chose for the clips' own audio; exactly 0.0 drops audio.
    #[serde(default = "default_volume")]
    pub original_volume: f64,
    pub output_path: PathBuf,
    /// Re-encode the joined file once. Never implied by a shape mismatch.
    #[serde(default)]
    pub repair: bool,
}

impl TimelineJob {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.clips.is_empty() {
            return Err(AppError::InvalidRequest("timeline has no clips".into()));
        }
        self.canvas.validate()?;
        for (i, clip) in self.clips.iter().enumerate() {
            if !clip.target_duration.is_finite() || clip.target_duration <= 0.0 {
                return Err(AppError::InvalidRequest(format!(
                    "clip {} has invalid target duration {}",
                    i, clip.target_duration
                )));
            }
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(AppError::InvalidRequest("output path is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClipOutcome {
    Hit,
    Miss,
    Joined,
    /// Normalized without the cache (cache storage unavailable).
    Uncached,
}

impl From<CacheOutcome> for ClipOutcome {
    fn from(outcome: CacheOutcome) -> Self {
        match outcome {
            CacheOutcome::Hit => ClipOutcome::Hit,
            CacheOutcome::Miss => ClipOutcome::Miss,
            CacheOutcome::Joined => ClipOutcome::Joined,
        }
    }
}

/// A normalized clip ready for assembly. Dropping it releases the cache pin, or deletes
/// the file when it was produced without the cache.
#[derive(Debug)]
pub enum ClipArtifact {
    Cached {
        pin: PinnedClip,
        outcome: CacheOutcome,
    },
    Uncached {
        file: StagingFile,
        artifact: NormalizedArtifact,
    },
}

impl ClipArtifact {
    pub fn path(&self) -> &Path {
        match self {
            ClipArtifact::Cached { pin, .. } => pin.path(),
            ClipArtifact::Uncached { file, .. } => file.path(),
        }
    }

    pub fn outcome(&self) -> ClipOutcome {
        match self {
            ClipArtifact::Cached { outcome, .. } => (*outcome).into(),
            ClipArtifact::Uncached { .. } => ClipOutcome::Uncached,
        }
    }

    /// Length of the normalized artifact, before any trim to the clip's target.
    pub fn duration_secs(&self) -> f64 {
        match self {
            ClipArtifact::Cached { pin, .. } => pin.clip().duration_secs,
            ClipArtifact::Uncached { artifact, .. } => artifact.duration_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipReport {
    pub index: usize,
    pub source: PathBuf,
    pub outcome: ClipOutcome,
    pub normalized_duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineOutput {
    pub output_path: PathBuf,
    pub duration_secs: f64,
    pub audio_mode: AudioMode,
    pub clips: Vec<ClipReport>,
    pub segments: Vec<AssembledSegment>,
    pub repaired: bool,
    /// The cache could not be used; every clip was normalized from scratch.
    pub degraded: bool,
}

/// Builds waiting on each in-flight encode, by cache key.
type EncodeOwners = Arc<Mutex<HashMap<CacheKey, RunOwners>>>;

/// One build's claim on the encode of `key`, held while the build produces or waits for it.
struct OwnerRegistration {
    registry: EncodeOwners,
    key: CacheKey,
    owners: RunOwners,
    id: u64,
}

impl OwnerRegistration {
    fn join(registry: &EncodeOwners, key: &CacheKey, cancel: &CancellationToken) -> Self {
        let mut map = registry.lock();
        let owners = map.entry(key.clone()).or_default().clone();
        let id = owners.add(cancel);
        Self {
            registry: Arc::clone(registry),
            key: key.clone(),
            owners,
            id,
        }
    }
}

impl Drop for OwnerRegistration {
    fn drop(&mut self) {
        let mut map = self.registry.lock();
        self.owners.remove(self.id);
        if self.owners.is_empty()
            && map.get(&self.key).is_some_and(|o| o.same_as(&self.owners))
        {
            map.remove(&self.key);
        }
    }
}

struct BuilderInner {
    tool: Arc<dyn MediaTool>,
    cache: Result<ClipCache, String>,
    normalizer: ClipNormalizer,
    profile: EncodeProfile,
    verify_output: bool,
    /// Shared by every build on this builder.
    normalize_slots: Arc<Semaphore>,
    /// Shared by every build on this builder.
    encode_owners: EncodeOwners,
    events: EventEmitter,
}

/// Runs timeline builds. Cheap to clone; clones share the cache and the normalization pool.
#[derive(Clone)]
pub struct TimelineBuilder {
    inner: Arc<BuilderInner>,
}

impl std::fmt::Debug for TimelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineBuilder")
            .field("cache", &self.inner.cache)
            .field("events", &self.inner.events)
            .finish()
    }
}

/// Per-clip settings shared by every clip of one build.
#[derive(Clone)]
struct ClipJob {
    canvas: Canvas,
    crop_mode: CropMode,
    audio_mode: AudioMode,
    cache: Option<ClipCache>,
    /// Where uncached artifacts are written.
    scratch_dir: PathBuf,
}

impl TimelineBuilder {
    /// Build with the cache described by `config`. If the cache cannot be opened the builder
    /// still works, uncached.
    pub fn open(tool: Arc<dyn MediaTool>, config: &PipelineConfig, events: EventEmitter) -> Self {
        let cache = ClipCache::open(config.cache_config());
        if let Err(e) = &cache {
            log::warn!(
                target: "clipjoin::pipeline",
                "Clip cache unavailable, builds will run uncached: {}",
                e
            );
        }
        Self::new(tool, cache, config, events)
    }

    pub fn new(
        tool: Arc<dyn MediaTool>,
        cache: Result<ClipCache, AppError>,
        config: &PipelineConfig,
        events: EventEmitter,
    ) -> Self {
        Self {
            inner: Arc::new(BuilderInner {
                normalizer: ClipNormalizer::new(Arc::clone(&tool)),
                tool,
                cache: cache.map_err(|e| e.to_string()),
                profile: config.profile.clone(),
                verify_output: config.verify_output,
                normalize_slots: Arc::new(Semaphore::new(
                    config.max_concurrent_normalizations.max(1),
                )),
                encode_owners: EncodeOwners::default(),
                events,
            }),
        }
    }

    /// A builder sharing this one's cache and normalization pool that reports to `events`.
    pub fn with_events(&self, events: EventEmitter) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(BuilderInner {
                tool: Arc::clone(&inner.tool),
                cache: inner.cache.clone(),
                normalizer: ClipNormalizer::new(Arc::clone(&inner.tool)),
                profile: inner.profile.clone(),
                verify_output: inner.verify_output,
                normalize_slots: Arc::clone(&inner.normalize_slots),
                encode_owners: Arc::clone(&inner.encode_owners),
                events,
            }),
        }
    }

    pub fn cache(&self) -> Option<&ClipCache> {
        self.inner.cache.as_ref().ok()
    }

    pub fn tool(&self) -> &Arc<dyn MediaTool> {
        &self.inner.tool
    }

    /// The cache for this build, or `None` (with a `CacheDegraded` event) when it cannot be
    /// written.
    fn usable_cache(&self) -> Option<ClipCache> {
        let reason = match &self.inner.cache {
            Ok(cache) => match cache.check_writable() {
                Ok(()) => return Some(cache.clone()),
                Err(e) => e.to_string(),
            },
            Err(reason) => reason.clone(),
        };
        log::warn!(target: "clipjoin::pipeline", "Running uncached: {}", reason);
        self.inner.events.emit(PipelineEvent::CacheDegraded { reason });
        None
    }

    /// Build the timeline described by `job`.
    ///
    /// Cancellation is observed before each clip starts, while waiting for an encoder slot
    /// and before assembly. An encode already running finishes unless a forced cancel kills
    /// it. Clips that completed stay cached.
    pub async fn build(
        &self,
        job: &TimelineJob,
        cancel: &CancellationToken,
    ) -> Result<TimelineOutput, AppError> {
        let started = Instant::now();
        job.validate()?;
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let audio_mode = select_audio_mode(job.original_volume);
        log::info!(
            target: "clipjoin::pipeline",
            "Building timeline of {} clip(s) at {} ({}, audio {}) -> {}",
            job.clips.len(),
            job.canvas,
            job.crop_mode.as_str(),
            audio_mode.as_str(),
            job.output_path.display()
        );
        self.inner.events.emit(PipelineEvent::BuildStarted {
            clip_count: job.clips.len(),
            audio_mode,
        });

        let cache = self.usable_cache();
        let degraded = cache.is_none();
        // Uncached artifacts live next to the output until the build returns.
        let scratch = if degraded {
            let dir = output_dir(&job.output_path);
            std::fs::create_dir_all(&dir)?;
            Some(
                tempfile::Builder::new()
                    .prefix(".clipjoin-job-")
                    .tempdir_in(&dir)?,
            )
        } else {
            None
        };
        let clip_job = ClipJob {
            canvas: job.canvas,
            crop_mode: job.crop_mode,
            audio_mode,
            scratch_dir: match (&scratch, &cache) {
                (Some(dir), _) => dir.path().to_path_buf(),
                (None, Some(cache)) => cache.staging_dir().to_path_buf(),
                (None, None) => std::env::temp_dir(),
            },
            cache,
        };

        let normalize_started = Instant::now();
        let results = self.normalize_all(&job.clips, &clip_job, cancel).await;
        self.emit_timing(Stage::Normalize, normalize_started);

        let mut artifacts = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        let mut cancelled = false;
        for result in results {
            match result {
                Ok(artifact) => artifacts.push(artifact),
                Err(failure) if failure.error.is_cancelled() => cancelled = true,
                Err(failure) => failures.push(failure),
            }
        }
        if cancelled || cancel.is_cancelled() {
            log::info!(
                target: "clipjoin::pipeline",
                "Build cancelled; {} clip(s) completed and stay cached",
                artifacts.len()
            );
            return Err(AppError::Cancelled);
        }
        if !failures.is_empty() {
            return Err(AppError::ClipsFailed(failures));
        }

        let clips: Vec<ClipReport> = artifacts
            .iter()
            .zip(&job.clips)
            .enumerate()
            .map(|(index, (artifact, clip))| ClipReport {
                index,
                source: clip.path.clone(),
                outcome: artifact.outcome(),
                normalized_duration_secs: artifact.duration_secs(),
            })
            .collect();
        let inputs: Vec<AssemblyInput> = artifacts
            .iter()
            .zip(&job.clips)
            .map(|(artifact, clip)| AssemblyInput {
                path: artifact.path().to_path_buf(),
                target_duration: clip.target_duration,
            })
            .collect();

        let assemble_started = Instant::now();
        let assembler =
            TimelineAssembler::new(Arc::clone(&self.inner.tool), self.inner.profile.clone())
                .with_owners(RunOwners::of(cancel));
        let output = job.output_path.clone();
        let options = AssembleOptions {
            repair: job.repair,
            verify: self.inner.verify_output,
        };
        let assembled = tokio::task::spawn_blocking(move || {
            assembler.assemble(&inputs, &output, options)
        })
        .await
        .map_err(|e| AppError::from(e.to_string()))??;
        self.emit_timing(Stage::Assemble, assemble_started);

        // Pins are released only once the joined file exists.
        drop(artifacts);
        drop(scratch);
        if let Some(cache) = &clip_job.cache {
            cache.flush();
        }
        self.emit_timing(Stage::Total, started);
        log::info!(
            target: "clipjoin::pipeline",
            "Timeline ready: {} ({:.3}s) in {} ms",
            assembled.output_path.display(),
            assembled.duration_secs,
            started.elapsed().as_millis()
        );

        Ok(TimelineOutput {
            output_path: assembled.output_path,
            duration_secs: assembled.duration_secs,
            audio_mode,
            clips,
            segments: assembled.segments,
            repaired: assembled.repaired,
            degraded,
        })
    }

    /// Normalize every clip concurrently (bounded by the builder's pool). Results are in
    /// caller order; each clip either yields an artifact or an attributed failure.
    async fn normalize_all(
        &self,
        clips: &[JobClip],
        clip_job: &ClipJob,
        cancel: &CancellationToken,
    ) -> Vec<Result<ClipArtifact, ClipFailure>> {
        let mut set = JoinSet::new();
        for (index, clip) in clips.iter().enumerate() {
            let this = self.clone();
            let clip = clip.clone();
            let clip_job = clip_job.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let result = this.normalize_clip(index, &clip, &clip_job, &cancel).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<ClipArtifact, ClipFailure>>> =
            clips.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => log::error!(target: "clipjoin::pipeline", "Clip task failed: {}", e),
            }
        }
        results
            .into_iter()
            .zip(clips)
            .enumerate()
            .map(|(index, (result, clip))| {
                result.unwrap_or_else(|| {
                    Err(ClipFailure {
                        index,
                        path: clip.path.display().to_string(),
                        error: AppError::from("normalization task aborted"),
                    })
                })
            })
            .collect()
    }

    async fn normalize_clip(
        &self,
        index: usize,
        clip: &JobClip,
        clip_job: &ClipJob,
        cancel: &CancellationToken,
    ) -> Result<ClipArtifact, ClipFailure> {
        let fail = |error: AppError| ClipFailure {
            index,
            path: clip.path.display().to_string(),
            error,
        };
        if cancel.is_cancelled() {
            return Err(fail(AppError::Cancelled));
        }

        let source =
            SourceIdentity::capture(&clip.path).map_err(|e| self.clip_failed(index, fail(e)))?;
        let request = NormalizationRequest {
            source,
            canvas: clip_job.canvas,
            crop_mode: clip_job.crop_mode,
            audio_mode: clip_job.audio_mode,
            profile: self.inner.profile.clone(),
        };

        let result = match &clip_job.cache {
            Some(cache) => self.through_cache(index, cache, &request, cancel).await,
            None => {
                let key = request.cache_key();
                let file = StagingFile::new(&clip_job.scratch_dir, key.short(), "mp4");
                match self.acquire_slot(cancel).await {
                    Ok(_permit) => self
                        .encode(
                            index,
                            request.clone(),
                            file.path().to_path_buf(),
                            RunOwners::of(cancel),
                        )
                        .await
                        .map(|artifact| ClipArtifact::Uncached { file, artifact }),
                    Err(e) => Err(e),
                }
            }
        };
        result.map_err(|e| self.clip_failed(index, fail(e)))
    }

    /// Hit, join an in-flight encode, or encode. Only the producer takes an encoder slot,
    /// so a build waiting on another build's encode leaves the pool to its other clips.
    async fn through_cache(
        &self,
        index: usize,
        cache: &ClipCache,
        request: &NormalizationRequest,
        cancel: &CancellationToken,
    ) -> Result<ClipArtifact, AppError> {
        let key = request.cache_key();
        loop {
            let registration = OwnerRegistration::join(&self.inner.encode_owners, &key, cancel);
            let owners = registration.owners.clone();
            let key_str = key.as_str();
            let result = cache
                .get_or_normalize(request, move |staging| async move {
                    let _permit = self.acquire_slot(cancel).await?;
                    self.emit_outcome(index, key_str, CacheOutcome::Miss);
                    self.encode(index, request.clone(), staging, owners).await
                })
                .await;
            drop(registration);

            match result {
                Ok((pin, outcome)) => {
                    if outcome != CacheOutcome::Miss {
                        self.emit_outcome(index, key_str, outcome);
                    }
                    return Ok(ClipArtifact::Cached { pin, outcome });
                }
                // The build that was producing this clip was cancelled; this one was not.
                Err(e) if e.is_cancelled() && !cancel.is_cancelled() => {
                    log::debug!(
                        target: "clipjoin::pipeline",
                        "clip {}: shared encode {} was cancelled by another build, retrying",
                        index,
                        key.short()
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn acquire_slot(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, AppError> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.inner.normalize_slots).acquire_owned() => {
                permit.map_err(|_| AppError::from("normalization pool closed"))?
            }
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
        };
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        Ok(permit)
    }

    async fn encode(
        &self,
        index: usize,
        request: NormalizationRequest,
        output: PathBuf,
        owners: RunOwners,
    ) -> Result<NormalizedArtifact, AppError> {
        let started = Instant::now();
        let events = self.inner.events.clone();
        let progress: ProgressCallback = Arc::new(move |progress| {
            events.emit(PipelineEvent::EncodeProgress {
                clip_index: index,
                progress,
            })
        });
        let this = self.clone();
        let artifact = tokio::task::spawn_blocking(move || {
            this.inner
                .normalizer
                .normalize(&request, &output, Some(progress), Some(&owners))
        })
        .await
        .map_err(|e| AppError::from(e.to_string()))??;
        self.inner.events.emit(PipelineEvent::ClipNormalized {
            clip_index: index,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        Ok(artifact)
    }

    fn emit_outcome(&self, clip_index: usize, key: &str, outcome: CacheOutcome) {
        let key = key.to_string();
        self.inner.events.emit(match outcome {
            CacheOutcome::Hit => PipelineEvent::CacheHit { clip_index, key },
            CacheOutcome::Miss => PipelineEvent::CacheMiss { clip_index, key },
            CacheOutcome::Joined => PipelineEvent::CacheJoined { clip_index, key },
        });
    }

    fn clip_failed(&self, index: usize, failure: ClipFailure) -> ClipFailure {
        if !failure.error.is_cancelled() {
            log::warn!(target: "clipjoin::pipeline", "{}", failure);
            let (summary, _) = failure.error.summary_and_detail();
            self.inner.events.emit(PipelineEvent::ClipFailed {
                clip_index: index,
                summary,
            });
        }
        failure
    }

    fn emit_timing(&self, stage: Stage, since: Instant) {
        self.inner.events.emit(PipelineEvent::StageTiming {
            stage,
            elapsed_ms: since.elapsed().as_millis() as u64,
        });
    }
}

fn output_dir(output: &Path) -> PathBuf {
    match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
