pub mod audio_mode;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod ffmpeg;
pub mod media;
pub mod normalize;
pub mod pipeline;
pub mod request;
pub mod timeline;
#[cfg(test)]
mod test_support;

pub use audio_mode::select_audio_mode;
pub use cache::{CacheConfig, CacheOutcome, CacheStats, ClearReport, ClipCache, PinnedClip};
pub use config::PipelineConfig;
pub use error::{AppError, ClipFailure};
pub use events::{EventEmitter, EventSink, PipelineEvent, Stage};
pub use media::{FfmpegCli, MediaTool};
pub use normalize::{ClipNormalizer, NormalizedArtifact};
pub use pipeline::{ClipOutcome, JobClip, TimelineBuilder, TimelineJob, TimelineOutput};
pub use request::{AudioMode, Canvas, CropMode, EncodeProfile, NormalizationRequest, SourceIdentity};
pub use timeline::{AssembleOptions, AssembledTimeline, AssemblyInput, TimelineAssembler};
