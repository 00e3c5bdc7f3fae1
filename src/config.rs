//! Monitor configuration
//!
//! Every tunable of the detection and dispatch pipeline lives in
//! [`MonitorConfig`]. Values come from the built-in defaults, optionally a JSON
//! file, and finally `SURAKSHA_*` environment variables.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for the monitor, the detector and the dispatcher
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Calibrated level at or above which a frame counts as loud
    pub threshold_db: f32,

    /// Number of consecutive loud frames that make a sustained event
    pub required_consecutive_frames: u32,

    /// Duration of one sampling frame in milliseconds
    pub sampling_interval_ms: u64,

    /// Length of the cancellable warning countdown
    pub countdown_seconds: u32,

    /// Fixed linear gain applied before RMS
    pub gain_multiplier: f32,

    /// Added to `20·log10(rms)` so the practical noise floor lands near zero
    pub db_offset: f32,

    /// Upper bound for a one-shot location fix during dispatch
    pub location_timeout_ms: u64,

    /// Upper bound for a single notification send
    pub send_timeout_ms: u64,

    /// Cadence of the continuous location watch while in an emergency
    pub location_watch_interval_ms: u64,

    /// Whether nearby community members are alerted as well
    pub notify_community: bool,

    /// Capture sample rate used by the live sampler
    pub sample_rate: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            threshold_db: 80.0,
            required_consecutive_frames: 5, // 5 x 250ms = 1.25s of sustained noise
            sampling_interval_ms: 250,
            countdown_seconds: 10,
            gain_multiplier: 50.0,
            db_offset: 100.0,
            location_timeout_ms: 15_000,
            send_timeout_ms: 10_000,
            location_watch_interval_ms: 5_000,
            notify_community: true,
            sample_rate: 16_000,
        }
    }
}

impl MonitorConfig {
    /// Load from a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Defaults, then the optional file, then environment overrides, validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SURAKSHA_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &'static str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key, value: raw })
        }

        macro_rules! env_override {
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    $field = parse($key, raw)?;
                    debug!("{} overridden from environment", $key);
                }
            };
        }

        env_override!("SURAKSHA_THRESHOLD_DB", self.threshold_db);
        env_override!("SURAKSHA_REQUIRED_FRAMES", self.required_consecutive_frames);
        env_override!("SURAKSHA_SAMPLING_INTERVAL_MS", self.sampling_interval_ms);
        env_override!("SURAKSHA_COUNTDOWN_SECONDS", self.countdown_seconds);
        env_override!("SURAKSHA_GAIN", self.gain_multiplier);
        env_override!("SURAKSHA_DB_OFFSET", self.db_offset);
        env_override!("SURAKSHA_LOCATION_TIMEOUT_MS", self.location_timeout_ms);
        env_override!("SURAKSHA_SEND_TIMEOUT_MS", self.send_timeout_ms);
        env_override!("SURAKSHA_LOCATION_WATCH_INTERVAL_MS", self.location_watch_interval_ms);
        env_override!("SURAKSHA_NOTIFY_COMMUNITY", self.notify_community);
        env_override!("SURAKSHA_SAMPLE_RATE", self.sample_rate);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.threshold_db.is_finite() || self.threshold_db < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "thresholdDb must be a non-negative number, got {}",
                self.threshold_db
            )));
        }
        if self.required_consecutive_frames == 0 {
            return Err(ConfigError::Invalid(
                "requiredConsecutiveFrames must be at least 1".to_string(),
            ));
        }
        if self.sampling_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "samplingIntervalMs must be positive".to_string(),
            ));
        }
        if self.countdown_seconds == 0 {
            return Err(ConfigError::Invalid(
                "countdownSeconds must be at least 1".to_string(),
            ));
        }
        if !self.gain_multiplier.is_finite() || self.gain_multiplier <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "gainMultiplier must be positive, got {}",
                self.gain_multiplier
            )));
        }
        for (key, value) in [
            ("locationTimeoutMs", self.location_timeout_ms),
            ("sendTimeoutMs", self.send_timeout_ms),
            ("locationWatchIntervalMs", self.location_watch_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", key)));
            }
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sampleRate must be positive".to_string()));
        }
        Ok(())
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn location_watch_interval(&self) -> Duration {
        Duration::from_millis(self.location_watch_interval_ms)
    }

    /// Samples per sampling frame at the configured rate.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as u64 * self.sampling_interval_ms / 1000) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.threshold_db, 80.0);
        assert_eq!(cfg.required_consecutive_frames, 5);
        assert_eq!(cfg.sampling_interval_ms, 250);
        assert_eq!(cfg.countdown_seconds, 10);
        assert_eq!(cfg.gain_multiplier, 50.0);
        assert_eq!(cfg.samples_per_frame(), 4000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: MonitorConfig =
            serde_json::from_str(r#"{"thresholdDb": 70, "countdownSeconds": 3}"#).unwrap();
        assert_eq!(cfg.threshold_db, 70.0);
        assert_eq!(cfg.countdown_seconds, 3);
        assert_eq!(cfg.required_consecutive_frames, 5);
        assert!(cfg.notify_community);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SURAKSHA_THRESHOLD_DB", "65.5"),
            ("SURAKSHA_REQUIRED_FRAMES", "3"),
            ("SURAKSHA_NOTIFY_COMMUNITY", "false"),
        ]
        .into_iter()
        .collect();

        let mut cfg = MonitorConfig::default();
        cfg.apply_env(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.threshold_db, 65.5);
        assert_eq!(cfg.required_consecutive_frames, 3);
        assert!(!cfg.notify_community);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut cfg = MonitorConfig::default();
        let err = cfg
            .apply_env(|key| (key == "SURAKSHA_COUNTDOWN_SECONDS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { key: "SURAKSHA_COUNTDOWN_SECONDS", .. }
        ));
    }

    #[test]
    fn test_validation_rejects_zero_frames() {
        let cfg = MonitorConfig {
            required_consecutive_frames: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_zero_durations() {
        let cfg: MonitorConfig = serde_json::from_str(r#"{"locationWatchIntervalMs": 0}"#).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("locationWatchIntervalMs"), "{err}");

        for cfg in [
            MonitorConfig {
                send_timeout_ms: 0,
                ..Default::default()
            },
            MonitorConfig {
                location_timeout_ms: 0,
                ..Default::default()
            },
        ] {
            assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_watch_interval_env_override() {
        let mut cfg = MonitorConfig::default();
        cfg.apply_env(|key| (key == "SURAKSHA_LOCATION_WATCH_INTERVAL_MS").then(|| "2000".to_string()))
            .unwrap();
        assert_eq!(cfg.location_watch_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = MonitorConfig::from_json_file(Path::new("/nonexistent/suraksha.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
