use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actuator::{ActuatorAngles, MAX_ANGLE};
use crate::capture::CaptureParams;
use crate::drop_analyzer::AnalyzerParams;
use crate::tuning::{ParameterError, Tuning};
use crate::types::{
    DEFAULT_AVG_THRESHOLD, DEFAULT_CHANNEL_THRESHOLD, DEFAULT_CLUSTER_SIMILARITY,
    DEFAULT_ENVELOPE_POINTS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_RECORDINGS,
    DEFAULT_MEASUREMENT_COUNT, DEFAULT_TRIGGER_THRESHOLD,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Config expects {expected} {what}, hardware has {found}")]
    HardwareMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

/// Configuración completa del dispensador (JSON, todos los campos opcionales)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispenserConfig {
    /// Etiquetas de los canales piezo, en orden de lectura
    pub channels: Vec<String>,
    pub actuator_count: usize,
    pub envelope_points: usize,
    /// Grabaciones de aprendizaje por dispensador (impar)
    pub max_recordings: usize,
    pub cluster_similarity: f32,
    pub avg_threshold: f32,
    pub channel_threshold: f32,
    pub measurement_count: usize,
    pub trigger_threshold: i32,
    pub capture_timeout_ms: u64,
    pub min_capture_window_ms: u64,
    pub poll_interval_ms: u64,
    pub default_max_attempts: u32,
    pub rest_angle: u16,
    pub dispense_angle: u16,
    pub reset_angle: u16,
    pub dispense_lock_timeout_ms: u64,
    pub model_dir: PathBuf,
}

impl Default for DispenserConfig {
    fn default() -> Self {
        Self {
            channels: vec!["GREEN".to_string()],
            actuator_count: 2,
            envelope_points: DEFAULT_ENVELOPE_POINTS,
            max_recordings: DEFAULT_MAX_RECORDINGS,
            cluster_similarity: DEFAULT_CLUSTER_SIMILARITY,
            avg_threshold: DEFAULT_AVG_THRESHOLD,
            channel_threshold: DEFAULT_CHANNEL_THRESHOLD,
            measurement_count: DEFAULT_MEASUREMENT_COUNT,
            trigger_threshold: DEFAULT_TRIGGER_THRESHOLD,
            capture_timeout_ms: 1000,
            min_capture_window_ms: 800,
            poll_interval_ms: 1,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            rest_angle: 0,
            dispense_angle: 80,
            reset_angle: 180,
            dispense_lock_timeout_ms: 5000,
            model_dir: PathBuf::from("models"),
        }
    }
}

impl DispenserConfig {
    /// Lee la configuración de un JSON; los campos ausentes toman su valor por defecto
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Comprueba rangos y que el hardware descubierto coincide con la configuración
    pub fn validate(&self, sensor_channels: usize, actuators: usize) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::Invalid("at least one channel is required".into()));
        }
        if self.channels.iter().any(|c| c.is_empty()) {
            return Err(ConfigError::Invalid("channel labels must not be empty".into()));
        }
        if self.actuator_count == 0 {
            return Err(ConfigError::Invalid("actuator_count must be >= 1".into()));
        }
        if self.envelope_points == 0 {
            return Err(ConfigError::Invalid("envelope_points must be >= 1".into()));
        }
        if self.max_recordings == 0 || self.max_recordings % 2 == 0 {
            return Err(ConfigError::Invalid(format!(
                "max_recordings must be odd and >= 1, got {}",
                self.max_recordings
            )));
        }
        if !(0.0..=1.0).contains(&self.cluster_similarity) {
            return Err(ConfigError::Invalid(format!(
                "cluster_similarity must be 0.0-1.0, got {}",
                self.cluster_similarity
            )));
        }
        for angle in [self.rest_angle, self.dispense_angle, self.reset_angle] {
            if angle > MAX_ANGLE {
                return Err(ConfigError::Invalid(format!(
                    "angle {} out of range (0-{})",
                    angle, MAX_ANGLE
                )));
            }
        }
        if self.rest_angle == self.dispense_angle {
            return Err(ConfigError::Invalid(
                "rest_angle and dispense_angle must differ".into(),
            ));
        }
        self.tuning()?;

        if sensor_channels != self.channels.len() {
            return Err(ConfigError::HardwareMismatch {
                what: "sensor channels",
                expected: self.channels.len(),
                found: sensor_channels,
            });
        }
        if actuators != self.actuator_count {
            return Err(ConfigError::HardwareMismatch {
                what: "actuators",
                expected: self.actuator_count,
                found: actuators,
            });
        }
        Ok(())
    }

    pub fn tuning(&self) -> Result<Tuning, ParameterError> {
        Tuning::new(
            self.avg_threshold,
            self.channel_threshold,
            self.measurement_count,
            self.default_max_attempts,
        )
    }

    pub fn analyzer_params(&self) -> AnalyzerParams {
        AnalyzerParams {
            actuator_count: self.actuator_count,
            channel_labels: self.channels.clone(),
            envelope_points: self.envelope_points,
            max_recordings: self.max_recordings,
            cluster_similarity: self.cluster_similarity,
        }
    }

    pub fn capture_params(&self) -> CaptureParams {
        CaptureParams {
            trigger_threshold: self.trigger_threshold,
            timeout: Duration::from_millis(self.capture_timeout_ms),
            min_window: Duration::from_millis(self.min_capture_window_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn angles(&self) -> ActuatorAngles {
        ActuatorAngles {
            rest: self.rest_angle,
            dispense: self.dispense_angle,
            reset: self.reset_angle,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.dispense_lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Valida contra un hardware que coincide con la configuración
    fn validate_matching(config: &DispenserConfig) -> Result<(), ConfigError> {
        config.validate(config.channels.len(), config.actuator_count)
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DispenserConfig::default();
        assert!(validate_matching(&config).is_ok());
        assert_eq!(config.max_recordings, 9);
        assert_eq!(config.capture_params().timeout, Duration::from_millis(1000));
        assert_eq!(config.angles(), ActuatorAngles::default());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = DispenserConfig::from_json(
            r#"{"channels": ["GREEN", "BLUE", "RED"], "avg_threshold": 0.8}"#,
        )
        .unwrap();
        assert_eq!(config.channels.len(), 3);
        assert!((config.avg_threshold - 0.8).abs() < 1e-6);
        assert_eq!(config.measurement_count, 500);
        assert_eq!(config.model_dir, PathBuf::from("models"));
    }

    #[test]
    fn test_even_recordings_rejected() {
        let config = DispenserConfig {
            max_recordings: 8,
            ..DispenserConfig::default()
        };
        assert!(matches!(
            validate_matching(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_threshold_rejected() {
        let config = DispenserConfig {
            channel_threshold: 1.5,
            ..DispenserConfig::default()
        };
        assert!(matches!(
            validate_matching(&config),
            Err(ConfigError::Parameter(ParameterError::Threshold { .. }))
        ));
    }

    #[test]
    fn test_oversized_measurement_count_rejected() {
        let config = DispenserConfig::from_json(r#"{"measurement_count": 1099511627776}"#).unwrap();
        assert!(matches!(
            validate_matching(&config),
            Err(ConfigError::Parameter(ParameterError::MeasurementCount(_)))
        ));
    }

    #[test]
    fn test_hardware_mismatch() {
        let config = DispenserConfig::default();
        assert!(matches!(
            config.validate(3, config.actuator_count),
            Err(ConfigError::HardwareMismatch {
                what: "sensor channels",
                expected: 1,
                found: 3
            })
        ));
        assert!(matches!(
            config.validate(1, config.actuator_count + 1),
            Err(ConfigError::HardwareMismatch {
                what: "actuators",
                ..
            })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispenser.json");
        fs::write(&path, r#"{"actuator_count": 4, "model_dir": "/tmp/x"}"#).unwrap();
        let config = DispenserConfig::load(&path).unwrap();
        assert_eq!(config.actuator_count, 4);

        assert!(matches!(
            DispenserConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
