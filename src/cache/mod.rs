//! Persistent content-addressed store of normalized clips.
//!
//! Layout under the cache root:
//! - `clips/<key>.mp4`: finished artifacts, only ever created by same-directory rename
//! - `tmp/`: staging files the encoder writes into
//! - `index.json`: key -> artifact metadata, last access and insertion order
//!
//! Entries handed to a build are pinned ([`PinnedClip`]); eviction and `clear_all` skip
//! pinned entries, so a file is never deleted while a build still needs it. At most one
//! producer runs per key; concurrent callers for the same key wait for it and share its
//! result.

mod index;

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::AppError;
use crate::ffmpeg::{StagingFile, cleanup_stale_staging_files};
use crate::normalize::NormalizedArtifact;
use crate::request::{
    AudioMode, CLIP_FORMAT_VERSION, CacheKey, Canvas, CropMode, NormalizationRequest,
    SourceIdentity,
};
use index::{IndexFile, LoadedIndex, load_index, write_index};

pub const DEFAULT_CAPACITY_BYTES: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_LOW_WATERMARK_RATIO: f64 = 0.8;

const INDEX_FILE: &str = "index.json";
const CLIPS_DIR: &str = "clips";
const STAGING_DIR: &str = "tmp";
const ARTIFACT_EXT: &str = "mp4";
const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub capacity_bytes: u64,
    pub low_watermark_bytes: u64,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_capacity(root, DEFAULT_CAPACITY_BYTES, DEFAULT_LOW_WATERMARK_RATIO)
    }

    pub fn with_capacity(
        root: impl Into<PathBuf>,
        capacity_bytes: u64,
        low_watermark_ratio: f64,
    ) -> Self {
        let ratio = if low_watermark_ratio.is_finite() {
            low_watermark_ratio.clamp(0.0, 1.0)
        } else {
            DEFAULT_LOW_WATERMARK_RATIO
        };
        Self {
            root: root.into(),
            capacity_bytes,
            low_watermark_bytes: (capacity_bytes as f64 * ratio) as u64,
        }
    }
}

/// Index record of one cached artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedClip {
    pub key: CacheKey,
    /// File name inside `clips/`.
    pub file_name: String,
    pub size: u64,
    pub last_access_ms: u64,
    pub inserted_seq: u64,
    pub source: SourceIdentity,
    pub canvas: Canvas,
    pub crop_mode: CropMode,
    pub audio_mode: AudioMode,
    pub has_audio: bool,
    /// Length of the artifact as probed after encoding.
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Served by a producer another caller already had in flight.
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    pub files_removed: usize,
    pub bytes_freed: u64,
    pub bytes_remaining: u64,
    /// Pinned entries kept usage above the low watermark.
    pub blocked_by_pins: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub files_removed: usize,
    pub bytes_freed: u64,
    /// Entries in use by a running build; left in place.
    pub pinned_retained: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub file_count: usize,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
    pub low_watermark_bytes: u64,
    pub pinned_count: usize,
}

struct Entry {
    clip: CachedClip,
    pins: u32,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    total_bytes: u64,
    next_seq: u64,
    /// Access times changed since the index was last written.
    dirty: bool,
}

type InFlight = Arc<OnceCell<Result<(), AppError>>>;

struct CacheInner {
    config: CacheConfig,
    clips_dir: PathBuf,
    staging_dir: PathBuf,
    index_path: PathBuf,
    state: Mutex<CacheState>,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl CacheInner {
    fn artifact_path(&self, clip: &CachedClip) -> PathBuf {
        self.clips_dir.join(&clip.file_name)
    }

    /// Persist failures are logged; the in-memory state stays authoritative for this process.
    fn persist(&self, state: &mut CacheState) {
        state.dirty = false;
        let mut entries: Vec<CachedClip> = state.entries.values().map(|e| e.clip.clone()).collect();
        entries.sort_by_key(|c| c.inserted_seq);
        let index = IndexFile {
            format_version: CLIP_FORMAT_VERSION,
            next_seq: state.next_seq,
            entries,
        };
        if let Err(e) = write_index(&self.index_path, &index) {
            log::warn!(
                target: "clipjoin::cache",
                "Failed to write cache index {}: {}",
                self.index_path.display(),
                e
            );
        }
    }

    fn remove_entry(&self, state: &mut CacheState, key: &CacheKey) -> Option<u64> {
        let entry = state.entries.remove(key)?;
        state.total_bytes = state.total_bytes.saturating_sub(entry.clip.size);
        if let Err(e) = remove_file_if_exists(&self.artifact_path(&entry.clip)) {
            log::warn!(
                target: "clipjoin::cache",
                "Failed to delete artifact {}: {}",
                entry.clip.file_name,
                e
            );
        }
        Some(entry.clip.size)
    }

    fn evict_locked(&self, state: &mut CacheState) -> EvictionReport {
        let mut report = EvictionReport {
            bytes_remaining: state.total_bytes,
            ..Default::default()
        };
        if state.total_bytes <= self.config.capacity_bytes {
            return report;
        }

        let mut candidates: Vec<(u64, u64, CacheKey)> = state
            .entries
            .iter()
            .filter(|(_, e)| e.pins == 0)
            .map(|(k, e)| (e.clip.last_access_ms, e.clip.inserted_seq, k.clone()))
            .collect();
        candidates.sort();

        for (_, _, key) in candidates {
            if state.total_bytes <= self.config.low_watermark_bytes {
                break;
            }
            if let Some(freed) = self.remove_entry(state, &key) {
                log::debug!(
                    target: "clipjoin::cache",
                    "Evicted {} ({} bytes)",
                    key.short(),
                    freed
                );
                report.files_removed += 1;
                report.bytes_freed += freed;
            }
        }

        report.bytes_remaining = state.total_bytes;
        report.blocked_by_pins = state.total_bytes > self.config.low_watermark_bytes;
        if report.blocked_by_pins {
            log::warn!(
                target: "clipjoin::cache",
                "Cache still at {} bytes after eviction (low watermark {}); remaining entries are in use",
                state.total_bytes,
                self.config.low_watermark_bytes
            );
        } else {
            log::info!(
                target: "clipjoin::cache",
                "Evicted {} clip(s), freed {} bytes, {} bytes remain",
                report.files_removed,
                report.bytes_freed,
                report.bytes_remaining
            );
        }
        if report.files_removed > 0 {
            self.persist(state);
        }
        report
    }

    fn unpin(&self, key: &CacheKey) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.pins = entry.pins.saturating_sub(1);
        }
        // An earlier eviction may have been blocked by this pin.
        if state.total_bytes > self.config.capacity_bytes {
            self.evict_locked(&mut state);
        }
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.dirty {
            self.persist(&mut state);
        }
    }
}

/// A cache entry reserved for the holder. The artifact file stays on disk until the pin is
/// dropped, even if the cache is over capacity or cleared meanwhile.
pub struct PinnedClip {
    inner: Arc<CacheInner>,
    clip: CachedClip,
    path: PathBuf,
}

impl PinnedClip {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn clip(&self) -> &CachedClip {
        &self.clip
    }

    pub fn key(&self) -> &CacheKey {
        &self.clip.key
    }
}

impl std::fmt::Debug for PinnedClip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedClip")
            .field("key", &self.clip.key)
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for PinnedClip {
    fn drop(&mut self) {
        self.inner.unpin(&self.clip.key);
    }
}

/// Handle to a cache directory. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ClipCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for ClipCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipCache")
            .field("root", &self.inner.config.root)
            .finish()
    }
}

impl ClipCache {
    /// Open (creating if needed) the cache at `config.root` and reconcile the index with
    /// the files actually present.
    pub fn open(config: CacheConfig) -> Result<Self, AppError> {
        let clips_dir = config.root.join(CLIPS_DIR);
        let staging_dir = config.root.join(STAGING_DIR);
        for dir in [&clips_dir, &staging_dir] {
            fs::create_dir_all(dir).map_err(|e| AppError::storage_unavailable(dir, e))?;
        }
        let index_path = config.root.join(INDEX_FILE);

        let cache = Self {
            inner: Arc::new(CacheInner {
                config,
                clips_dir,
                staging_dir,
                index_path,
                state: Mutex::new(CacheState::default()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        };
        cache.check_writable()?;
        cache.reconcile();
        Ok(cache)
    }

    fn reconcile(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        let loaded = match load_index(&inner.index_path) {
            LoadedIndex::Missing => None,
            LoadedIndex::Loaded(index) => Some(index),
            LoadedIndex::Incompatible(reason) => {
                log::warn!(
                    target: "clipjoin::cache",
                    "Discarding cache index at {}: {}",
                    inner.index_path.display(),
                    reason
                );
                None
            }
        };

        if let Some(index) = loaded {
            state.next_seq = index.next_seq;
            for clip in index.entries {
                let on_disk = fs::metadata(inner.artifact_path(&clip)).map(|m| m.len()).ok();
                if on_disk != Some(clip.size) {
                    log::debug!(
                        target: "clipjoin::cache",
                        "Dropping index entry {} (artifact missing or resized)",
                        clip.key.short()
                    );
                    continue;
                }
                state.next_seq = state.next_seq.max(clip.inserted_seq + 1);
                state.total_bytes += clip.size;
                state.entries.insert(clip.key.clone(), Entry { clip, pins: 0 });
            }
        }

        let referenced: std::collections::HashSet<String> = state
            .entries
            .values()
            .map(|e| e.clip.file_name.clone())
            .collect();
        if let Ok(dir) = fs::read_dir(&inner.clips_dir) {
            for entry in dir.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !referenced.contains(&name) {
                    log::debug!(target: "clipjoin::cache", "Removing orphan artifact {}", name);
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        if let Err(e) = cleanup_stale_staging_files(&inner.staging_dir, STALE_STAGING_AGE) {
            log::warn!(target: "clipjoin::cache", "Staging cleanup failed: {}", e);
        }

        log::info!(
            target: "clipjoin::cache",
            "Opened clip cache at {}: {} clip(s), {} bytes",
            inner.config.root.display(),
            state.entries.len(),
            state.total_bytes
        );
        inner.persist(&mut state);
        inner.evict_locked(&mut state);
    }

    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    pub fn staging_dir(&self) -> &Path {
        &self.inner.staging_dir
    }

    /// Fails with `CacheStorageUnavailable` when the staging directory cannot be written.
    pub fn check_writable(&self) -> Result<(), AppError> {
        let probe = StagingFile::new(&self.inner.staging_dir, "write-check", "tmp");
        fs::write(probe.path(), b"ok")
            .map_err(|e| AppError::storage_unavailable(&self.inner.staging_dir, e))
    }

    /// Look up a request without pinning. A hit refreshes the entry's last access time.
    ///
    /// Misses when the source no longer matches the identity in the request, when the key
    /// is unknown, or when the artifact file has disappeared (the dead entry is dropped).
    pub fn lookup(&self, request: &NormalizationRequest) -> Option<CachedClip> {
        self.touch(request, false).map(|(clip, _)| clip)
    }

    /// Like [`ClipCache::lookup`] but pins the entry for the lifetime of the returned handle.
    pub fn checkout(&self, request: &NormalizationRequest) -> Option<PinnedClip> {
        self.touch(request, true).map(|(clip, path)| PinnedClip {
            inner: Arc::clone(&self.inner),
            clip,
            path,
        })
    }

    fn touch(&self, request: &NormalizationRequest, pin: bool) -> Option<(CachedClip, PathBuf)> {
        if !request.source.is_current() {
            log::debug!(
                target: "clipjoin::cache",
                "Source changed since request was made: {}",
                request.source.path.display()
            );
            return None;
        }
        let key = request.cache_key();
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let entry = state.entries.get(&key)?;
        let path = inner.artifact_path(&entry.clip);
        if !path.is_file() {
            if entry.pins == 0 {
                inner.remove_entry(&mut state, &key);
                state.dirty = true;
            }
            log::debug!(target: "clipjoin::cache", "Artifact missing for {}", key.short());
            return None;
        }
        let entry = state.entries.get_mut(&key)?;
        entry.clip.last_access_ms = now_ms();
        if pin {
            entry.pins += 1;
        }
        let clip = entry.clip.clone();
        state.dirty = true;
        Some((clip, path))
    }

    /// Move a staged artifact into the cache and return it pinned.
    ///
    /// The rename happens inside the cache directory, so a reader sees either no file or the
    /// complete one. If the key is already present the staged file is discarded and the
    /// existing entry is returned. Runs eviction afterwards; the new entry is pinned and
    /// therefore never its own eviction victim.
    pub fn insert(
        &self,
        request: &NormalizationRequest,
        artifact: &NormalizedArtifact,
    ) -> Result<PinnedClip, AppError> {
        let inner = &self.inner;
        let key = request.cache_key();
        let file_name = format!("{}.{}", key, ARTIFACT_EXT);
        let final_path = inner.clips_dir.join(&file_name);
        let size = fs::metadata(&artifact.path)?.len();

        let mut state = inner.state.lock();
        let existing_live = state
            .entries
            .get(&key)
            .is_some_and(|e| e.clip.file_name == file_name && final_path.is_file());
        if existing_live {
            log::debug!(
                target: "clipjoin::cache",
                "Key {} already cached; discarding redundant artifact",
                key.short()
            );
            let _ = fs::remove_file(&artifact.path);
            let entry = state
                .entries
                .get_mut(&key)
                .ok_or_else(|| AppError::from("cache entry vanished under lock"))?;
            entry.pins += 1;
            entry.clip.last_access_ms = now_ms();
            let clip = entry.clip.clone();
            inner.persist(&mut state);
            return Ok(PinnedClip {
                inner: Arc::clone(inner),
                clip,
                path: final_path,
            });
        }

        fs::rename(&artifact.path, &final_path)
            .map_err(|e| AppError::storage_unavailable(&inner.clips_dir, e))?;

        let pins = match state.entries.remove(&key) {
            Some(stale) => {
                state.total_bytes = state.total_bytes.saturating_sub(stale.clip.size);
                stale.pins
            }
            None => 0,
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        let clip = CachedClip {
            key: key.clone(),
            file_name,
            size,
            last_access_ms: now_ms(),
            inserted_seq: seq,
            source: request.source.clone(),
            canvas: request.canvas,
            crop_mode: request.crop_mode,
            audio_mode: request.audio_mode,
            has_audio: artifact.has_audio,
            duration_secs: artifact.duration_secs,
        };
        state.total_bytes += size;
        state.entries.insert(
            key.clone(),
            Entry {
                clip: clip.clone(),
                pins: pins + 1,
            },
        );
        log::info!(
            target: "clipjoin::cache",
            "Cached {} ({} bytes) for {}",
            key.short(),
            size,
            request.source.path.display()
        );
        inner.persist(&mut state);
        inner.evict_locked(&mut state);

        Ok(PinnedClip {
            inner: Arc::clone(inner),
            clip,
            path: final_path,
        })
    }

    /// Return the cached artifact for `request`, producing it at most once across all
    /// concurrent callers.
    ///
    /// `produce` receives a staging path inside the cache and must write the artifact there.
    /// Callers that arrive while another caller's producer is running wait for it; a failed
    /// producer's error is handed to every waiter, and nothing is cached for it.
    pub async fn get_or_normalize<F, Fut>(
        &self,
        request: &NormalizationRequest,
        produce: F,
    ) -> Result<(PinnedClip, CacheOutcome), AppError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<NormalizedArtifact, AppError>>,
    {
        let key = request.cache_key();
        let mut produce = Some(produce);
        loop {
            if let Some(pin) = self.checkout(request) {
                return Ok((pin, CacheOutcome::Hit));
            }

            let cell: InFlight = {
                let mut in_flight = self.inner.in_flight.lock();
                Arc::clone(in_flight.entry(key.clone()).or_default())
            };

            let mut produced: Option<Result<(PinnedClip, CacheOutcome), AppError>> = None;
            let produce_slot = &mut produce;
            let produced_slot = &mut produced;
            let shared = cell
                .get_or_init(|| async move {
                    // A previous producer may have finished between the checkout above and
                    // this cell being created.
                    let result = match (self.checkout(request), produce_slot.take()) {
                        (Some(pin), _) => Ok((pin, CacheOutcome::Hit)),
                        (None, Some(produce)) => self
                            .produce_and_insert(request, produce)
                            .await
                            .map(|pin| (pin, CacheOutcome::Miss)),
                        (None, None) => Err(AppError::from("producer already consumed")),
                    };
                    let shared = result.as_ref().map(|_| ()).map_err(AppError::duplicate);
                    *produced_slot = Some(result);
                    shared
                })
                .await;
            let shared = shared.as_ref().map(|_| ()).map_err(AppError::duplicate);

            if let Some(result) = produced {
                let mut in_flight = self.inner.in_flight.lock();
                if in_flight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                    in_flight.remove(&key);
                }
                return result;
            }

            if shared.is_err() {
                // A failed cell is never reused; a caller that retries gets a fresh producer.
                let mut in_flight = self.inner.in_flight.lock();
                if in_flight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                    in_flight.remove(&key);
                }
            }
            shared?;
            if let Some(pin) = self.checkout(request) {
                return Ok((pin, CacheOutcome::Joined));
            }
            // Evicted or cleared between the producer finishing and this checkout.
            let mut in_flight = self.inner.in_flight.lock();
            if in_flight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                in_flight.remove(&key);
            }
            if produce.is_none() {
                return Err(AppError::from("cached clip disappeared before it could be used"));
            }
        }
    }

    async fn produce_and_insert<F, Fut>(
        &self,
        request: &NormalizationRequest,
        produce: F,
    ) -> Result<PinnedClip, AppError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<NormalizedArtifact, AppError>>,
    {
        let key = request.cache_key();
        let staging = StagingFile::new(&self.inner.staging_dir, key.short(), ARTIFACT_EXT);
        let artifact = produce(staging.path().to_path_buf()).await?;
        let pin = self.insert(request, &artifact)?;
        // Renamed into place; nothing left for the guard to remove.
        let _ = staging.keep();
        Ok(pin)
    }

    /// Evict least-recently-used unpinned entries down to the low watermark if usage is
    /// above capacity.
    pub fn evict_if_over_capacity(&self) -> EvictionReport {
        let mut state = self.inner.state.lock();
        self.inner.evict_locked(&mut state)
    }

    /// Delete every entry not currently pinned, plus any unindexed file in `clips/`.
    pub fn clear_all(&self) -> ClearReport {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let mut report = ClearReport::default();

        let unpinned: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, e)| e.pins == 0)
            .map(|(k, _)| k.clone())
            .collect();
        for key in unpinned {
            if let Some(freed) = inner.remove_entry(&mut state, &key) {
                report.files_removed += 1;
                report.bytes_freed += freed;
            }
        }
        report.pinned_retained = state.entries.len();

        let referenced: std::collections::HashSet<String> = state
            .entries
            .values()
            .map(|e| e.clip.file_name.clone())
            .collect();
        if let Ok(dir) = fs::read_dir(&inner.clips_dir) {
            for entry in dir.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if referenced.contains(&name) {
                    continue;
                }
                let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                if fs::remove_file(entry.path()).is_ok() {
                    report.files_removed += 1;
                    report.bytes_freed += len;
                }
            }
        }

        inner.persist(&mut state);
        log::info!(
            target: "clipjoin::cache",
            "Cleared cache: {} file(s), {} bytes freed, {} in use retained",
            report.files_removed,
            report.bytes_freed,
            report.pinned_retained
        );
        report
    }

    /// Write pending access-time updates to the index.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        if state.dirty {
            self.inner.persist(&mut state);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            file_count: state.entries.len(),
            total_bytes: state.total_bytes,
            capacity_bytes: self.inner.config.capacity_bytes,
            low_watermark_bytes: self.inner.config.low_watermark_bytes,
            pinned_count: state.entries.values().filter(|e| e.pins > 0).count(),
        }
    }

    #[cfg(test)]
    fn set_last_access(&self, key: &CacheKey, ms: u64) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.clip.last_access_ms = ms;
            state.dirty = true;
        }
    }
}
