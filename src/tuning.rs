use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use thiserror::Error;

use crate::types::{
    DEFAULT_AVG_THRESHOLD, DEFAULT_CHANNEL_THRESHOLD, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MEASUREMENT_COUNT, MAX_MEASUREMENT_COUNT,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Invalid {kind} threshold: {value} (must be 0.0-1.0)")]
    Threshold { kind: ThresholdKind, value: f32 },

    #[error("Invalid measurement count: {0} (must be 1-{max})", max = MAX_MEASUREMENT_COUNT)]
    MeasurementCount(usize),

    #[error("Invalid max attempts: {0} (must be >= 1)")]
    MaxAttempts(u32),

    #[error("Unknown threshold kind: {0}")]
    UnknownThresholdKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    /// Umbral de similitud media (también decide el mejor canal)
    Average,
    /// Umbral individual por canal, sólo diagnóstico
    Channel,
}

impl fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdKind::Average => write!(f, "average"),
            ThresholdKind::Channel => write!(f, "channel"),
        }
    }
}

impl FromStr for ThresholdKind {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "avg" | "average" => Ok(ThresholdKind::Average),
            "channel" | "min" => Ok(ThresholdKind::Channel),
            other => Err(ParameterError::UnknownThresholdKind(other.to_string())),
        }
    }
}

/// Copia coherente de los dos umbrales
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdSnapshot {
    pub avg_threshold: f32,
    pub channel_threshold: f32,
}

/// Parámetros ajustables en caliente. Se escriben desde la capa de comandos
/// y se leen desde la captura sin cerrojos (atómicos).
#[derive(Debug)]
pub struct Tuning {
    avg_threshold: AtomicU32,
    channel_threshold: AtomicU32,
    measurement_count: AtomicUsize,
    default_max_attempts: AtomicU32,
}

impl Tuning {
    pub fn new(
        avg_threshold: f32,
        channel_threshold: f32,
        measurement_count: usize,
        default_max_attempts: u32,
    ) -> Result<Self, ParameterError> {
        let tuning = Self::default();
        tuning.set_threshold(ThresholdKind::Average, avg_threshold)?;
        tuning.set_threshold(ThresholdKind::Channel, channel_threshold)?;
        tuning.set_measurement_count(measurement_count)?;
        tuning.set_default_max_attempts(default_max_attempts)?;
        Ok(tuning)
    }

    pub fn thresholds(&self) -> ThresholdSnapshot {
        ThresholdSnapshot {
            avg_threshold: self.avg_threshold(),
            channel_threshold: self.channel_threshold(),
        }
    }

    pub fn avg_threshold(&self) -> f32 {
        f32::from_bits(self.avg_threshold.load(Ordering::Acquire))
    }

    pub fn channel_threshold(&self) -> f32 {
        f32::from_bits(self.channel_threshold.load(Ordering::Acquire))
    }

    /// Valida [0, 1]; con un valor inválido no se toca nada
    pub fn set_threshold(&self, kind: ThresholdKind, value: f32) -> Result<(), ParameterError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(ParameterError::Threshold { kind, value });
        }

        let slot = match kind {
            ThresholdKind::Average => &self.avg_threshold,
            ThresholdKind::Channel => &self.channel_threshold,
        };
        slot.store(value.to_bits(), Ordering::Release);
        Ok(())
    }

    pub fn measurement_count(&self) -> usize {
        self.measurement_count.load(Ordering::Acquire)
    }

    pub fn set_measurement_count(&self, count: usize) -> Result<(), ParameterError> {
        if !(1..=MAX_MEASUREMENT_COUNT).contains(&count) {
            return Err(ParameterError::MeasurementCount(count));
        }
        self.measurement_count.store(count, Ordering::Release);
        Ok(())
    }

    pub fn default_max_attempts(&self) -> u32 {
        self.default_max_attempts.load(Ordering::Acquire)
    }

    pub fn set_default_max_attempts(&self, attempts: u32) -> Result<(), ParameterError> {
        if attempts < 1 {
            return Err(ParameterError::MaxAttempts(attempts));
        }
        self.default_max_attempts.store(attempts, Ordering::Release);
        Ok(())
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            avg_threshold: AtomicU32::new(DEFAULT_AVG_THRESHOLD.to_bits()),
            channel_threshold: AtomicU32::new(DEFAULT_CHANNEL_THRESHOLD.to_bits()),
            measurement_count: AtomicUsize::new(DEFAULT_MEASUREMENT_COUNT),
            default_max_attempts: AtomicU32::new(DEFAULT_MAX_ATTEMPTS),
        }
    }
}
