use presence_core::{RetryPolicy, DEFAULT_MATCH_THRESHOLD};
use presence_hw::VideoConstraints;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Runtime configuration.
///
/// Sources, lowest priority first: built-in defaults, the TOML config file,
/// `PRESENCE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// SCRFD ONNX model file.
    pub model_path: PathBuf,
    /// SQLite database holding profiles and attendance records.
    pub db_path: PathBuf,
    /// Cosine similarity required to accept a match.
    pub similarity_threshold: f32,
    /// Minimum time between two accepted attendance events.
    pub cooldown_secs: u64,
    /// Pause between monitoring iterations.
    pub tick_interval_ms: u64,
    /// Detection attempts per capture when no face is found.
    pub detect_attempts: u32,
    pub retry_delay_ms: u64,
    /// Bound on waiting for the first decoded frame.
    pub ready_timeout_secs: u64,
    pub ideal_width: u32,
    pub ideal_height: u32,
    /// Frames discarded after opening the camera (auto-exposure settling).
    pub warmup_frames: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            model_path: data_dir.join("models").join("det_10g.onnx"),
            db_path: data_dir.join("presence.db"),
            similarity_threshold: DEFAULT_MATCH_THRESHOLD,
            cooldown_secs: 300,
            tick_interval_ms: 1000,
            detect_attempts: 3,
            retry_delay_ms: 500,
            ready_timeout_secs: 5,
            ideal_width: 640,
            ideal_height: 480,
            warmup_frames: 4,
        }
    }
}

impl Config {
    /// Load from `explicit`, else `PRESENCE_CONFIG`, else the XDG config file
    /// if it exists, then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let file = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("PRESENCE_CONFIG").ok().map(PathBuf::from));

        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => {
                let default_path = config_dir().join("config.toml");
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `PRESENCE_*` overrides. Unparseable values are rejected rather
    /// than silently falling back to defaults.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PRESENCE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("PRESENCE_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&lookup, "PRESENCE_SIMILARITY_THRESHOLD", &mut self.similarity_threshold)?;
        override_parsed(&lookup, "PRESENCE_COOLDOWN_SECS", &mut self.cooldown_secs)?;
        override_parsed(&lookup, "PRESENCE_TICK_INTERVAL_MS", &mut self.tick_interval_ms)?;
        override_parsed(&lookup, "PRESENCE_DETECT_ATTEMPTS", &mut self.detect_attempts)?;
        override_parsed(&lookup, "PRESENCE_RETRY_DELAY_MS", &mut self.retry_delay_ms)?;
        override_parsed(&lookup, "PRESENCE_READY_TIMEOUT_SECS", &mut self.ready_timeout_secs)?;
        override_parsed(&lookup, "PRESENCE_IDEAL_WIDTH", &mut self.ideal_width)?;
        override_parsed(&lookup, "PRESENCE_IDEAL_HEIGHT", &mut self.ideal_height)?;
        override_parsed(&lookup, "PRESENCE_WARMUP_FRAMES", &mut self.warmup_frames)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid {
                key: "similarity_threshold",
                reason: format!("{} is outside [-1, 1]", self.similarity_threshold),
            });
        }
        if self.detect_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "detect_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "tick_interval_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.detect_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ready_timeout: self.ready_timeout(),
        }
    }

    pub fn video_constraints(&self) -> VideoConstraints {
        VideoConstraints {
            ideal_width: self.ideal_width,
            ideal_height: self.ideal_height,
            ..VideoConstraints::default()
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("{raw:?}: {e}"),
        })?;
    }
    Ok(())
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("presence")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("presence")
}
