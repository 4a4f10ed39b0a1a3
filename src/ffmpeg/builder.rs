//! FFmpeg argument lists for normalization, lossless trim, manifest concat and the
//! optional repair re-encode.

use std::path::Path;

use crate::request::{Canvas, CropMode, EncodeProfile};

use super::path_to_string;

/// How the audio track of a normalized artifact is produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioPlan {
    /// No audio stream in the output.
    None,
    /// Synthesized silence of the given duration (seconds; 0 means "as long as the video").
    Silence { duration_secs: f64 },
    /// First audio stream of the source, resampled to the profile and padded or cut to the
    /// video's duration (seconds; 0 means "unknown, stop with the video").
    Source { duration_secs: f64 },
}

pub struct NormalizePlan<'a> {
    pub canvas: Canvas,
    pub crop_mode: CropMode,
    pub audio: AudioPlan,
    pub profile: &'a EncodeProfile,
}

fn geometry_filter(canvas: Canvas, crop_mode: CropMode) -> String {
    let (w, h) = (canvas.width, canvas.height);
    match crop_mode {
        CropMode::Center => format!(
            "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}:(in_w-{w})/2:(in_h-{h})/2"
        ),
        CropMode::Fit => format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease:force_divisible_by=2,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black"
        ),
        CropMode::Fill => format!("scale={w}:{h}"),
    }
}

/// Video filter chain: timestamps to zero first, then geometry, then the fixed frame grid.
pub fn video_filter_chain(canvas: Canvas, crop_mode: CropMode, profile: &EncodeProfile) -> String {
    format!(
        "setpts=PTS-STARTPTS,{},setsar=1,fps={},format={}",
        geometry_filter(canvas, crop_mode),
        profile.fps,
        profile.pix_fmt
    )
}

/// Audio filter for a retained source track. The resampler pads or drops samples so the
/// track starts at zero and tracks the video clock.
pub fn source_audio_filter(profile: &EncodeProfile) -> String {
    format!(
        "aresample={}:async=1:first_pts=0,asetpts=PTS-STARTPTS",
        profile.audio_sample_rate
    )
}

/// [`source_audio_filter`] followed by padding with silence and, when the video duration is
/// known, a cut at exactly that duration. A track that ran longer than the picture would
/// stretch the artifact past its last frame; a shorter one would leave a gap at the join.
pub fn fitted_audio_filter(profile: &EncodeProfile, video_duration_secs: f64) -> String {
    let base = source_audio_filter(profile);
    if video_duration_secs > 0.0 {
        format!("{base},apad,atrim=end={video_duration_secs:.3}")
    } else {
        format!("{base},apad")
    }
}

fn push_all(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

fn push_video_profile(args: &mut Vec<String>, profile: &EncodeProfile) {
    let gop = profile.gop.to_string();
    args.extend([
        "-c:v".to_string(),
        profile.video_codec.clone(),
        "-preset".to_string(),
        profile.preset.clone(),
        "-crf".to_string(),
        profile.crf.to_string(),
        "-pix_fmt".to_string(),
        profile.pix_fmt.clone(),
        "-r".to_string(),
        profile.fps.to_string(),
        "-g".to_string(),
        gop.clone(),
        "-keyint_min".to_string(),
        gop,
        "-sc_threshold".to_string(),
        "0".to_string(),
        "-video_track_timescale".to_string(),
        profile.video_timescale.to_string(),
    ]);
}

fn push_audio_profile(args: &mut Vec<String>, profile: &EncodeProfile) {
    args.extend([
        "-c:a".to_string(),
        profile.audio_codec.clone(),
        "-b:a".to_string(),
        format!("{}k", profile.audio_bitrate_kbps),
        "-ar".to_string(),
        profile.audio_sample_rate.to_string(),
        "-ac".to_string(),
        profile.audio_channels.to_string(),
    ]);
}

fn push_mp4_output(args: &mut Vec<String>, output: &str) {
    push_all(
        args,
        &[
            "-avoid_negative_ts",
            "make_zero",
            "-movflags",
            "+faststart",
            "-f",
            "mp4",
        ],
    );
    args.push(output.to_string());
}

pub fn build_normalize_args(input: &str, output: &str, plan: &NormalizePlan<'_>) -> Vec<String> {
    log::debug!(
        target: "clipjoin::ffmpeg::builder",
        "Building normalize command: canvas={}, crop={}, audio={:?}, input={} -> output={}",
        plan.canvas,
        plan.crop_mode.as_str(),
        plan.audio,
        input,
        output
    );

    let mut args = Vec::with_capacity(64);
    push_all(&mut args, &["-nostdin", "-hide_banner", "-y", "-progress", "pipe:1"]);
    args.extend(["-i".to_string(), input.to_string()]);

    if let AudioPlan::Silence { duration_secs } = plan.audio {
        push_all(&mut args, &["-f", "lavfi"]);
        if duration_secs > 0.0 {
            args.extend(["-t".to_string(), format!("{:.3}", duration_secs)]);
        }
        args.extend([
            "-i".to_string(),
            format!(
                "anullsrc=r={}:cl={}",
                plan.profile.audio_sample_rate,
                plan.profile.channel_layout()
            ),
        ]);
    }

    push_all(&mut args, &["-map", "0:v:0"]);
    match plan.audio {
        AudioPlan::None => {}
        AudioPlan::Source { .. } => push_all(&mut args, &["-map", "0:a:0"]),
        AudioPlan::Silence { .. } => push_all(&mut args, &["-map", "1:a:0"]),
    }

    args.extend([
        "-vf".to_string(),
        video_filter_chain(plan.canvas, plan.crop_mode, plan.profile),
    ]);
    push_video_profile(&mut args, plan.profile);

    match plan.audio {
        AudioPlan::None => args.push("-an".to_string()),
        AudioPlan::Source { duration_secs } => {
            args.extend([
                "-af".to_string(),
                fitted_audio_filter(plan.profile, duration_secs),
            ]);
            push_audio_profile(&mut args, plan.profile);
            // Padded audio is endless; the picture decides where the artifact ends.
            args.push("-shortest".to_string());
        }
        AudioPlan::Silence { .. } => {
            push_all(&mut args, &["-af", "asetpts=PTS-STARTPTS"]);
            push_audio_profile(&mut args, plan.profile);
            // The generator must never outlast the picture.
            args.push("-shortest".to_string());
        }
    }

    push_all(
        &mut args,
        &["-map_metadata", "-1", "-map_chapters", "-1", "-sn", "-dn"],
    );
    push_mp4_output(&mut args, output);
    args
}

/// Stream-copy the first `duration_secs` of a zero-based artifact.
pub fn build_trim_args(input: &str, output: &str, duration_secs: f64) -> Vec<String> {
    let mut args = Vec::with_capacity(20);
    push_all(&mut args, &["-nostdin", "-hide_banner", "-y"]);
    args.extend([
        "-i".to_string(),
        input.to_string(),
        "-t".to_string(),
        format!("{:.3}", duration_secs),
    ]);
    push_all(&mut args, &["-map", "0", "-c", "copy"]);
    push_mp4_output(&mut args, output);
    args
}

/// Stream-copy join of every file listed in a concat demuxer manifest.
pub fn build_concat_args(manifest: &str, output: &str) -> Vec<String> {
    let mut args = Vec::with_capacity(20);
    push_all(
        &mut args,
        &["-nostdin", "-hide_banner", "-y", "-f", "concat", "-safe", "0"],
    );
    args.extend(["-i".to_string(), manifest.to_string()]);
    push_all(&mut args, &["-map", "0", "-c", "copy"]);
    push_mp4_output(&mut args, output);
    args
}

/// Re-encode a joined file with the same profile. Only used when a caller asks for repair.
pub fn build_repair_args(
    input: &str,
    output: &str,
    has_audio: bool,
    profile: &EncodeProfile,
) -> Vec<String> {
    let mut args = Vec::with_capacity(48);
    push_all(&mut args, &["-nostdin", "-hide_banner", "-y", "-progress", "pipe:1"]);
    args.extend(["-i".to_string(), input.to_string()]);
    push_all(&mut args, &["-map", "0:v:0"]);
    if has_audio {
        push_all(&mut args, &["-map", "0:a:0"]);
    }
    args.extend([
        "-vf".to_string(),
        format!(
            "setpts=PTS-STARTPTS,fps={},format={}",
            profile.fps, profile.pix_fmt
        ),
    ]);
    push_video_profile(&mut args, profile);
    if has_audio {
        args.extend(["-af".to_string(), source_audio_filter(profile)]);
        push_audio_profile(&mut args, profile);
    } else {
        args.push("-an".to_string());
    }
    push_mp4_output(&mut args, output);
    args
}

/// Quote a path for the concat demuxer: single-quoted, embedded quotes closed and escaped.
fn escape_concat_path(path: &Path) -> String {
    path_to_string(path).replace('\'', r"'\''")
}

/// Concat demuxer manifest listing segments in order.
pub fn concat_manifest(paths: &[impl AsRef<Path>]) -> String {
    paths
        .iter()
        .map(|p| format!("file '{}'\n", escape_concat_path(p.as_ref())))
        .collect()
}

/// One flag (and its value) per line, for error details and logs.
pub fn format_args_for_display_multiline(args: &[String]) -> String {
    let mut lines = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match iter.peek() {
            Some(value) if arg.starts_with('-') && !value.starts_with('-') => {
                lines.push(format!("  {} {}", arg, value));
                iter.next();
            }
            _ => lines.push(format!("  {}", arg)),
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canvas() -> Canvas {
        Canvas {
            width: 1080,
            height: 1920,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    fn plan(profile: &EncodeProfile, crop_mode: CropMode, audio: AudioPlan) -> NormalizePlan<'_> {
        NormalizePlan {
            canvas: canvas(),
            crop_mode,
            audio,
            profile,
        }
    }

    #[test]
    fn geometry_per_crop_mode() {
        let p = EncodeProfile::default();
        let center = video_filter_chain(canvas(), CropMode::Center, &p);
        assert!(center.contains("force_original_aspect_ratio=increase"));
        assert!(center.contains("crop=1080:1920"));
        let fit = video_filter_chain(canvas(), CropMode::Fit, &p);
        assert!(fit.contains("force_original_aspect_ratio=decrease"));
        assert!(fit.contains("pad=1080:1920:(ow-iw)/2:(oh-ih)/2"));
        let fill = video_filter_chain(canvas(), CropMode::Fill, &p);
        assert!(fill.contains("scale=1080:1920,setsar=1"));
        assert!(!fill.contains("crop") && !fill.contains("pad"));
    }

    #[test]
    fn video_timestamps_reset_before_anything_else() {
        let chain = video_filter_chain(canvas(), CropMode::Center, &EncodeProfile::default());
        assert!(chain.starts_with("setpts=PTS-STARTPTS,"));
        assert!(chain.ends_with("fps=30,format=yuv420p"));
    }

    #[test]
    fn strip_has_no_audio() {
        let p = EncodeProfile::default();
        let strip = plan(&p, CropMode::Center, AudioPlan::None);
        let args = build_normalize_args("in.mov", "out.mp4", &strip);
        assert!(args.contains(&"-an".to_string()));
        assert!(!args.iter().any(|a| a == "-af" || a == "0:a:0" || a.contains("anullsrc")));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn keep_with_source_audio_resets_audio_separately() {
        let p = EncodeProfile::default();
        let source = AudioPlan::Source { duration_secs: 4.0 };
        let args = build_normalize_args("in.mov", "out.mp4", &plan(&p, CropMode::Fit, source));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "0:a:0"));
        let filter = value_after(&args, "-af").expect("audio filter");
        assert!(filter.starts_with("aresample=48000:async=1:first_pts=0,asetpts=PTS-STARTPTS"));
        assert_eq!(value_after(&args, "-ar"), Some("48000"));
        assert_eq!(value_after(&args, "-ac"), Some("2"));
    }

    #[test]
    fn source_audio_is_fitted_to_the_video_length() {
        let p = EncodeProfile::default();
        let source = AudioPlan::Source { duration_secs: 4.25 };
        let args =
            build_normalize_args("in.mov", "out.mp4", &plan(&p, CropMode::Center, source));
        let filter = value_after(&args, "-af").expect("audio filter");
        assert!(filter.ends_with(",apad,atrim=end=4.250"), "filter was {filter}");
        assert!(args.contains(&"-shortest".to_string()));
    }

    #[test]
    fn unknown_video_length_still_pads_and_stops_with_the_video() {
        let p = EncodeProfile::default();
        let source = AudioPlan::Source { duration_secs: 0.0 };
        let args =
            build_normalize_args("in.mov", "out.mp4", &plan(&p, CropMode::Center, source));
        let filter = value_after(&args, "-af").expect("audio filter");
        assert!(filter.ends_with(",apad"));
        assert!(!filter.contains("atrim"));
        assert!(args.contains(&"-shortest".to_string()));
    }

    #[test]
    fn keep_without_source_audio_synthesizes_silence() {
        let p = EncodeProfile::default();
        let args = build_normalize_args(
            "in.mov",
            "out.mp4",
            &plan(&p, CropMode::Center, AudioPlan::Silence { duration_secs: 4.25 }),
        );
        assert_eq!(value_after(&args, "-t"), Some("4.250"));
        assert!(args.contains(&"anullsrc=r=48000:cl=stereo".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "1:a:0"));
        assert_eq!(value_after(&args, "-af"), Some("asetpts=PTS-STARTPTS"));
        assert!(args.contains(&"-shortest".to_string()));
    }

    #[test]
    fn fixed_profile_flags_present() {
        let p = EncodeProfile::default();
        let strip = plan(&p, CropMode::Center, AudioPlan::None);
        let args = build_normalize_args("in.mov", "out.mp4", &strip);
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-pix_fmt"), Some("yuv420p"));
        assert_eq!(value_after(&args, "-g"), Some("60"));
        assert_eq!(value_after(&args, "-keyint_min"), Some("60"));
        assert_eq!(value_after(&args, "-sc_threshold"), Some("0"));
        assert_eq!(value_after(&args, "-video_track_timescale"), Some("15360"));
        assert_eq!(value_after(&args, "-movflags"), Some("+faststart"));
        assert_eq!(value_after(&args, "-avoid_negative_ts"), Some("make_zero"));
    }

    #[test]
    fn trim_and_concat_are_stream_copies() {
        let trim = build_trim_args("a.mp4", "a.trim.mp4", 2.5);
        assert_eq!(value_after(&trim, "-t"), Some("2.500"));
        assert_eq!(value_after(&trim, "-c"), Some("copy"));
        assert!(!trim.iter().any(|a| a == "-vf" || a == "-c:v"));

        let concat = build_concat_args("list.txt", "joined.mp4");
        assert_eq!(value_after(&concat, "-f"), Some("concat"));
        assert_eq!(value_after(&concat, "-safe"), Some("0"));
        assert_eq!(value_after(&concat, "-c"), Some("copy"));
        assert_eq!(value_after(&concat, "-movflags"), Some("+faststart"));
    }

    #[test]
    fn repair_reencodes_with_profile() {
        let p = EncodeProfile::default();
        let args = build_repair_args("joined.mp4", "fixed.mp4", false, &p);
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert!(args.contains(&"-an".to_string()));
        let with_audio = build_repair_args("joined.mp4", "fixed.mp4", true, &p);
        assert_eq!(value_after(&with_audio, "-c:a"), Some("aac"));
    }

    #[test]
    fn manifest_lists_paths_in_order_and_escapes_quotes() {
        let manifest = concat_manifest(&["/tmp/seg0.mp4", "/tmp/it's.mp4"]);
        assert_eq!(
            manifest,
            "file '/tmp/seg0.mp4'\nfile '/tmp/it'\\''s.mp4'\n"
        );
    }

    #[test]
    fn display_pairs_flags_with_values() {
        let args: Vec<String> = ["-y", "-i", "in.mp4", "-an", "out.mp4"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            format_args_for_display_multiline(&args),
            "  -y\n  -i in.mp4\n  -an out.mp4"
        );
    }
}
