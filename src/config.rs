//! Pipeline settings: JSON file named by `CLIPJOIN_CONFIG`, then environment overrides.
//! `FFMPEG_PATH` is read by ffmpeg discovery, not here.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cache::{CacheConfig, DEFAULT_CAPACITY_BYTES, DEFAULT_LOW_WATERMARK_RATIO};
use crate::error::AppError;
use crate::request::EncodeProfile;

pub const CONFIG_ENV: &str = "CLIPJOIN_CONFIG";
pub const CACHE_DIR_ENV: &str = "CLIPJOIN_CACHE_DIR";

const DEFAULT_MAX_CONCURRENT_NORMALIZATIONS: usize = 2;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// `None` means the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    pub capacity_bytes: u64,
    pub low_watermark_ratio: f64,
    pub max_concurrent_normalizations: usize,
    /// Decode the joined file once before publishing it.
    pub verify_output: bool,
    pub profile: EncodeProfile,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            low_watermark_ratio: DEFAULT_LOW_WATERMARK_RATIO,
            max_concurrent_normalizations: DEFAULT_MAX_CONCURRENT_NORMALIZATIONS,
            verify_output: false,
            profile: EncodeProfile::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults, overlaid with the file at `$CLIPJOIN_CONFIG` if set, then
    /// `$CLIPJOIN_CACHE_DIR`.
    pub fn load() -> Result<Self, AppError> {
        let mut config = match env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        if let Some(dir) = env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let text = fs::read_to_string(path).map_err(|e| {
            AppError::InvalidRequest(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            AppError::InvalidRequest(format!("invalid config {}: {}", path.display(), e))
        })?;
        log::info!(target: "clipjoin::config", "Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_concurrent_normalizations == 0 {
            return Err(AppError::InvalidRequest(
                "maxConcurrentNormalizations must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.low_watermark_ratio) {
            return Err(AppError::InvalidRequest(format!(
                "lowWatermarkRatio {} is outside 0..=1",
                self.low_watermark_ratio
            )));
        }
        self.profile.validate()
    }

    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::with_capacity(
            self.resolved_cache_dir(),
            self.capacity_bytes,
            self.low_watermark_ratio,
        )
    }
}

/// `$XDG_CACHE_HOME/clipjoin`, else `$HOME/.cache/clipjoin` (`%LOCALAPPDATA%` on Windows),
/// else the system temp directory.
pub fn default_cache_dir() -> PathBuf {
    let base = env::var_os("XDG_CACHE_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            if cfg!(windows) {
                env::var_os("LOCALAPPDATA").map(PathBuf::from)
            } else {
                env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache"))
            }
        })
        .unwrap_or_else(env::temp_dir);
    base.join("clipjoin")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard(Vec<(&'static str, Option<std::ffi::OsString>)>);

    impl EnvGuard {
        fn set(vars: &[(&'static str, Option<&str>)]) -> Self {
            let saved = vars.iter().map(|(k, _)| (*k, env::var_os(k))).collect();
            for (key, value) in vars {
                // SAFETY: tests touching the environment are serialized.
                unsafe {
                    match value {
                        Some(v) => env::set_var(key, v),
                        None => env::remove_var(key),
                    }
                }
            }
            Self(saved)
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.0 {
                // SAFETY: see `EnvGuard::set`.
                unsafe {
                    match value {
                        Some(v) => env::set_var(key, v),
                        None => env::remove_var(key),
                    }
                }
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_without_file_or_env() {
        let _env = EnvGuard::set(&[(CONFIG_ENV, None), (CACHE_DIR_ENV, None)]);
        let config = PipelineConfig::load().expect("load");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.max_concurrent_normalizations, 2);
        assert_eq!(config.capacity_bytes, 10 * 1024 * 1024 * 1024);
        assert!(config.resolved_cache_dir().ends_with("clipjoin"));
    }

    #[test]
    #[serial]
    fn file_values_then_env_override() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("clipjoin.json");
        fs::write(
            &file,
            r#"{ "cacheDir": "/from/file", "capacityBytes": 1000, "maxConcurrentNormalizations": 4,
                 "profile": { "fps": 25 } }"#,
        )
        .expect("write config");
        let file_str = file.to_string_lossy().to_string();

        let _env = EnvGuard::set(&[(CONFIG_ENV, Some(&file_str)), (CACHE_DIR_ENV, None)]);
        let config = PipelineConfig::load().expect("load");
        assert_eq!(config.cache_dir, Some(PathBuf::from("/from/file")));
        assert_eq!(config.capacity_bytes, 1000);
        assert_eq!(config.max_concurrent_normalizations, 4);
        assert_eq!(config.profile.fps, 25);
        assert_eq!(config.profile.crf, EncodeProfile::default().crf);
        assert_eq!(config.cache_config().low_watermark_bytes, 800);
        drop(_env);

        let _env = EnvGuard::set(&[
            (CONFIG_ENV, Some(&file_str)),
            (CACHE_DIR_ENV, Some("/from/env")),
        ]);
        let config = PipelineConfig::load().expect("load");
        assert_eq!(config.resolved_cache_dir(), PathBuf::from("/from/env"));
    }

    #[test]
    #[serial]
    fn unreadable_or_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.json").to_string_lossy().to_string();
        let _env = EnvGuard::set(&[(CONFIG_ENV, Some(&missing))]);
        assert!(matches!(
            PipelineConfig::load(),
            Err(AppError::InvalidRequest(_))
        ));
        drop(_env);

        let bad = dir.path().join("bad.json");
        fs::write(&bad, r#"{ "maxConcurrentNormalizations": 0 }"#).expect("write");
        let bad_str = bad.to_string_lossy().to_string();
        let _env = EnvGuard::set(&[(CONFIG_ENV, Some(&bad_str))]);
        assert!(PipelineConfig::load().is_err());
    }

    #[test]
    #[serial]
    fn default_cache_dir_prefers_xdg() {
        let _env = EnvGuard::set(&[("XDG_CACHE_HOME", Some("/xdg/cache"))]);
        assert_eq!(default_cache_dir(), PathBuf::from("/xdg/cache/clipjoin"));
    }
}
