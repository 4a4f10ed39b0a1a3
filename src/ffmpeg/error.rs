//! Map FFmpeg exit codes to short human summaries.
//!
//! Exit codes are from ffmpeg.c: 1 (general), 69 (rate exceeded), 123 (hard exit),
//! 255 (signal). -1 is used for spawn failure. Stderr is kept as detail for diagnosis.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FfmpegErrorPayload {
    pub summary: String,
    pub detail: String,
}

pub fn parse_ffmpeg_error(stderr: &str, exit_code: Option<i32>) -> FfmpegErrorPayload {
    let summary = match exit_code.and_then(known_exit_code_summary) {
        Some(msg) => msg.to_string(),
        None => match exit_code {
            Some(code) => format!("FFmpeg failed (exit code {}).", code),
            None => first_meaningful_line(stderr, 120),
        },
    };
    FfmpegErrorPayload {
        summary,
        detail: stderr.trim().to_string(),
    }
}

fn known_exit_code_summary(code: i32) -> Option<&'static str> {
    match code {
        -1 => Some("FFmpeg not found or failed to start."),
        1 => Some("FFmpeg failed."),
        69 => Some("Encoding rate limit exceeded."),
        123 | 255 => Some("Encoding was stopped."),
        _ => None,
    }
}

const ELLIPSIS: &str = "…";

/// First non-empty stderr line, cut to `max_len` bytes on a char boundary.
fn first_meaningful_line(stderr: &str, max_len: usize) -> String {
    let first = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if first.len() <= max_len {
        return first.to_string();
    }
    let mut cut = max_len.saturating_sub(ELLIPSIS.len());
    while !first.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &first[..cut], ELLIPSIS)
}
