use crate::error::{Result, SentryError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub models: ModelConfig,
    pub detection: DetectionConfig,
    pub scanner: ScannerConfig,
    pub fetch: FetchConfig,
    pub cache_path: PathBuf,
    pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub weapons_path: PathBuf,
    pub pistols_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub input_size: u32,
    pub min_score: f64,
    pub not_ready_retry_ms: u64,
    pub not_ready_max_attempts: u32, // 0 = poll forever
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub min_image_size_px: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_image_bytes: usize,
    pub min_canvas_size_px: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            min_score: 0.34,
            not_ready_retry_ms: 5000,
            not_ready_max_attempts: 120,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { min_image_size_px: 20 }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_image_bytes: 20 * 1024 * 1024,
            min_canvas_size_px: 416,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let weapons_path = env::var("WEAPONS_MODEL_PATH")
            .unwrap_or_else(|_| "models/weapons.onnx".to_string());
        let pistols_path = env::var("PISTOLS_MODEL_PATH")
            .unwrap_or_else(|_| "models/pistols.onnx".to_string());

        let detection_defaults = DetectionConfig::default();
        let detection = DetectionConfig {
            input_size: env_or("MODEL_INPUT_SIZE", detection_defaults.input_size),
            min_score: env_or("MIN_SCORE_TO_FILTER", detection_defaults.min_score),
            not_ready_retry_ms: env_or("NOT_READY_RETRY_MS", detection_defaults.not_ready_retry_ms),
            not_ready_max_attempts: env_or(
                "NOT_READY_MAX_ATTEMPTS",
                detection_defaults.not_ready_max_attempts,
            ),
        };

        let fetch_defaults = FetchConfig::default();
        let fetch = FetchConfig {
            timeout_secs: env_or("FETCH_TIMEOUT_SECS", fetch_defaults.timeout_secs),
            max_image_bytes: env_or("MAX_IMAGE_BYTES", fetch_defaults.max_image_bytes),
            min_canvas_size_px: env_or("MIN_CANVAS_SIZE_PX", fetch_defaults.min_canvas_size_px),
        };

        let scanner = ScannerConfig {
            min_image_size_px: env_or(
                "MIN_IMAGE_SIZE_PX",
                ScannerConfig::default().min_image_size_px,
            ),
        };

        let cache_path = env::var("CACHE_PATH").unwrap_or_else(|_| "./data/verdicts".to_string());

        // Empty string disables the listener
        let metrics_bind = match env::var("METRICS_BIND") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(v.trim().to_string()),
            Err(_) => Some("127.0.0.1:9464".to_string()),
        };

        let config = Self {
            models: ModelConfig {
                weapons_path: PathBuf::from(weapons_path),
                pistols_path: PathBuf::from(pistols_path),
            },
            detection,
            scanner,
            fetch,
            cache_path: PathBuf::from(cache_path),
            metrics_bind,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let score = self.detection.min_score;
        if !(0.0..=1.0).contains(&score) {
            return Err(SentryError::Config(format!(
                "MIN_SCORE_TO_FILTER must be within [0, 1], got {}",
                score
            )));
        }
        if self.detection.input_size == 0 {
            return Err(SentryError::Config("MODEL_INPUT_SIZE must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "WEAPONS_MODEL_PATH",
            "PISTOLS_MODEL_PATH",
            "MODEL_INPUT_SIZE",
            "MIN_SCORE_TO_FILTER",
            "NOT_READY_RETRY_MS",
            "NOT_READY_MAX_ATTEMPTS",
            "MIN_IMAGE_SIZE_PX",
            "MIN_CANVAS_SIZE_PX",
            "FETCH_TIMEOUT_SECS",
            "MAX_IMAGE_BYTES",
            "CACHE_PATH",
            "METRICS_BIND",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_match_reference_behavior() {
        clear_env();
        let config = Config::load().unwrap();
        assert_eq!(config.detection.input_size, 640);
        assert_eq!(config.detection.min_score, 0.34);
        assert_eq!(config.detection.not_ready_retry_ms, 5000);
        assert_eq!(config.scanner.min_image_size_px, 20);
        assert_eq!(config.fetch.min_canvas_size_px, 416);
        assert_eq!(config.metrics_bind.as_deref(), Some("127.0.0.1:9464"));
    }

    #[test]
    #[serial]
    fn unparsable_numbers_fall_back() {
        clear_env();
        env::set_var("NOT_READY_RETRY_MS", "soon");
        env::set_var("METRICS_BIND", "");
        let config = Config::load().unwrap();
        assert_eq!(config.detection.not_ready_retry_ms, 5000);
        assert!(config.metrics_bind.is_none());
        clear_env();
    }

    #[test]
    #[serial]
    fn threshold_out_of_range_is_rejected() {
        clear_env();
        env::set_var("MIN_SCORE_TO_FILTER", "1.5");
        let err = Config::load().unwrap_err();
        assert!(matches!(err, SentryError::Config(_)));
        clear_env();
    }
}
