//! Error type shared by the cache, normalizer, assembler and worker. Implements Display and
//! Serialize so the worker can hand `{summary, detail}` payloads to its caller.

use crate::ffmpeg::{format_args_for_display_multiline, parse_ffmpeg_error};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    FfmpegNotFound(String),

    #[error("FFmpeg failed (code {code}): {stderr}")]
    FfmpegFailed { code: i32, stderr: String },

    #[error("Source unreadable: {path}: {reason}")]
    SourceUnreadable { path: String, reason: String },

    #[error("Encode failed for {source_identity} (code {code}): {stderr}")]
    EncodeFailed {
        source_identity: String,
        code: i32,
        stderr: String,
        args: Vec<String>,
    },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Cache storage unavailable at {path}: {reason}")]
    CacheStorageUnavailable { path: String, reason: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{}", describe_failures(.0))]
    ClipsFailed(Vec<ClipFailure>),
}

/// A per-clip error attributed to its position in the caller's clip list.
#[derive(Debug)]
pub struct ClipFailure {
    pub index: usize,
    pub path: String,
    pub error: AppError,
}

impl std::fmt::Display for ClipFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "clip {} ({}): {}", self.index, self.path, self.error)
    }
}

fn describe_failures(failures: &[ClipFailure]) -> String {
    let listed = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} clip(s) failed: {}", failures.len(), listed)
}

impl AppError {
    pub fn ffmpeg_failed(code: i32, stderr: impl Into<String>) -> Self {
        Self::FfmpegFailed {
            code,
            stderr: stderr.into(),
        }
    }

    pub fn source_unreadable(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        Self::SourceUnreadable {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn storage_unavailable(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        Self::CacheStorageUnavailable {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }

    /// Rebuilds an equivalent error so one in-flight result can be handed to every waiter.
    /// `io::Error` is not `Clone`, so it is reconstructed from its kind and message.
    pub fn duplicate(&self) -> Self {
        match self {
            AppError::Io(e) => AppError::Io(std::io::Error::new(e.kind(), e.to_string())),
            AppError::FfmpegNotFound(s) => AppError::FfmpegNotFound(s.clone()),
            AppError::FfmpegFailed { code, stderr } => {
                AppError::ffmpeg_failed(*code, stderr.clone())
            }
            AppError::SourceUnreadable { path, reason } => AppError::SourceUnreadable {
                path: path.clone(),
                reason: reason.clone(),
            },
            AppError::EncodeFailed {
                source_identity,
                code,
                stderr,
                args,
            } => AppError::EncodeFailed {
                source_identity: source_identity.clone(),
                code: *code,
                stderr: stderr.clone(),
                args: args.clone(),
            },
            AppError::ShapeMismatch(s) => AppError::ShapeMismatch(s.clone()),
            AppError::CacheStorageUnavailable { path, reason } => {
                AppError::CacheStorageUnavailable {
                    path: path.clone(),
                    reason: reason.clone(),
                }
            }
            AppError::Cancelled => AppError::Cancelled,
            AppError::InvalidRequest(s) => AppError::InvalidRequest(s.clone()),
            AppError::ClipsFailed(failures) => AppError::ClipsFailed(
                failures
                    .iter()
                    .map(|f| ClipFailure {
                        index: f.index,
                        path: f.path.clone(),
                        error: f.error.duplicate(),
                    })
                    .collect(),
            ),
        }
    }

    /// Short human summary plus full detail, as shown by the worker's error payloads.
    pub fn summary_and_detail(&self) -> (String, String) {
        match self {
            AppError::FfmpegFailed { code, stderr } => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                (payload.summary, payload.detail)
            }
            AppError::EncodeFailed {
                source_identity,
                code,
                stderr,
                args,
            } => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                (
                    format!("{} ({})", payload.summary, source_identity),
                    format!(
                        "{}\n\nffmpeg\n{}",
                        payload.detail,
                        format_args_for_display_multiline(args)
                    ),
                )
            }
            _ => {
                let text = self.to_string();
                (text.clone(), text)
            }
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            AppError::FfmpegFailed { .. } | AppError::EncodeFailed { .. } => {
                let (summary, detail) = self.summary_and_detail();
                let json = serde_json::json!({ "summary": summary, "detail": detail });
                serializer.serialize_str(&json.to_string())
            }
            _ => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        if s == "Cancelled" {
            AppError::Cancelled
        } else {
            AppError::FfmpegFailed {
                code: -1,
                stderr: s,
            }
        }
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}
