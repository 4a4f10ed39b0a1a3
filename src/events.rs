//! Structured pipeline events. Delivery is best-effort: with no sink attached the pipeline
//! behaves identically, and every event is also logged at debug level.

use std::sync::Arc;

use serde::Serialize;

use crate::request::AudioMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Normalize,
    /// Trim, concat and the optional repair pass.
    Assemble,
    Total,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PipelineEvent {
    BuildStarted {
        clip_count: usize,
        audio_mode: AudioMode,
    },
    CacheHit {
        clip_index: usize,
        key: String,
    },
    CacheMiss {
        clip_index: usize,
        key: String,
    },
    /// Another build was already normalizing this key; its result was reused.
    CacheJoined {
        clip_index: usize,
        key: String,
    },
    ClipNormalized {
        clip_index: usize,
        elapsed_ms: u64,
    },
    ClipFailed {
        clip_index: usize,
        summary: String,
    },
    EncodeProgress {
        clip_index: usize,
        progress: f64,
    },
    StageTiming {
        stage: Stage,
        elapsed_ms: u64,
    },
    CacheDegraded {
        reason: String,
    },
}

pub type EventSink = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventEmitter {
    sink: Option<EventSink>,
}

impl EventEmitter {
    pub fn new(sink: Option<EventSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: PipelineEvent) {
        log::debug!(target: "clipjoin::events", "{:?}", event);
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}
