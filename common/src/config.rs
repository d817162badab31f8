use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub stream: StreamConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the camera lives and how the caller talks to it.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Tuning for the downscale + frame-difference motion detector.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_downscale_width")]
    pub downscale_width: u32,
    #[serde(default = "default_downscale_height")]
    pub downscale_height: u32,
    /// Fraction of pixels (0..=1) that must change for a frame to count as motion.
    #[serde(default = "default_difference_threshold_ratio")]
    pub difference_threshold_ratio: f32,
    /// A pixel is changed when any channel moves by strictly more than this.
    #[serde(default = "default_per_channel_threshold")]
    pub per_channel_threshold: u8,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Upper bound on a single pending frame in the accumulator.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            downscale_width: default_downscale_width(),
            downscale_height: default_downscale_height(),
            difference_threshold_ratio: default_difference_threshold_ratio(),
            per_channel_threshold: default_per_channel_threshold(),
            cooldown_ms: default_cooldown_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DetectorConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.downscale_width == 0 || self.downscale_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "downscale raster must be non-empty, got {}x{}",
                self.downscale_width, self.downscale_height
            )));
        }
        if !(0.0..=1.0).contains(&self.difference_threshold_ratio) {
            return Err(ConfigError::Invalid(format!(
                "difference_threshold_ratio must be within 0..=1, got {}",
                self.difference_threshold_ratio
            )));
        }
        // SOI + EOI alone take four bytes.
        if self.max_frame_bytes < 4 {
            return Err(ConfigError::Invalid(format!(
                "max_frame_bytes must be at least 4, got {}",
                self.max_frame_bytes
            )));
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), url = %config.stream.url, "loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.detector.validate()?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_user_agent() -> String {
    "camwatch/0.1 (MJPEG)".into()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_downscale_width() -> u32 {
    96
}
fn default_downscale_height() -> u32 {
    72
}
fn default_difference_threshold_ratio() -> f32 {
    0.015
}
fn default_per_channel_threshold() -> u8 {
    18
}
fn default_cooldown_ms() -> u64 {
    2000
}
fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_initial_backoff() -> u64 {
    2
}
fn default_max_backoff() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}
