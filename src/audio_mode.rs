use crate::request::AudioMode;

/// Maps the user's original-audio volume to the audio handling for a whole build.
///
/// Only an exact zero means "voiceover only"; any other value (including NaN) keeps the
/// source audio, synthesizing silence for clips that have none so the batch stays uniform.
pub fn select_audio_mode(original_volume: f64) -> AudioMode {
    if original_volume == 0.0 {
        AudioMode::Strip
    } else {
        AudioMode::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_volume_strips() {
        assert_eq!(select_audio_mode(0.0), AudioMode::Strip);
        assert_eq!(select_audio_mode(-0.0), AudioMode::Strip);
    }

    #[test]
    fn any_other_volume_keeps() {
        for v in [0.0001, 0.5, 1.0, 1.5, -0.2, f64::NAN] {
            assert_eq!(select_audio_mode(v), AudioMode::Keep, "volume {v}");
        }
    }
}
