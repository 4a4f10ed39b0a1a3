use regex::Regex;
use std::sync::LazyLock;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration: (\d+):(\d+):([\d.]+)").expect("invalid duration regex")
});
// Despite the name, ffmpeg reports out_time_ms in microseconds; out_time_us is the newer spelling.
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^out_time_(?:ms|us)=(\d+)").expect("invalid time regex"));

/// Parse one line of FFmpeg stderr or `-progress pipe:1` output.
/// Returns (progress 0.0-1.0 or None, duration in seconds or None).
pub fn parse_ffmpeg_progress(
    line: &str,
    current_duration: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    if current_duration.is_none()
        && let Some(caps) = DURATION_RE.captures(line)
    {
        let hours: f64 = caps[1].parse().unwrap_or(0.0);
        let minutes: f64 = caps[2].parse().unwrap_or(0.0);
        let seconds: f64 = caps[3].parse().unwrap_or(0.0);
        return (None, Some(hours * 3600.0 + minutes * 60.0 + seconds));
    }

    if line.trim() == "progress=end" {
        return (Some(1.0), current_duration);
    }

    if let (Some(caps), Some(dur)) = (TIME_RE.captures(line.trim()), current_duration)
        && dur > 0.0
    {
        let micros: i64 = caps[1].parse().unwrap_or(0);
        let current_time = micros as f64 / 1_000_000.0;
        return (Some((current_time / dur).clamp(0.0, 1.0)), Some(dur));
    }

    (None, current_duration)
}
