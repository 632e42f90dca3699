//! Verbos de la capa de comandos sobre un dispensador completo.
//! Los índices de dispensador son base 0.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::actuator::{Actuator, ActuatorBank};
use crate::capture::{CaptureSource, SensorCaptureSource};
use crate::config::{ConfigError, DispenserConfig};
use crate::drop_analyzer::{AnalyzeError, DropAnalyzer};
use crate::model_store::ModelStore;
use crate::orchestrator::{DispenseError, DispenseOrchestrator, DispenseReport};
use crate::sensor::SharedSensors;
use crate::telemetry::LogSink;
use crate::tuning::{ParameterError, ThresholdKind, ThresholdSnapshot, Tuning};

/// Qué datos de aprendizaje borrar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    One(usize),
    All,
}

pub struct Dispenser {
    tuning: Arc<Tuning>,
    analyzer: Arc<Mutex<DropAnalyzer>>,
    orchestrator: DispenseOrchestrator,
    sink: Arc<dyn LogSink>,
}

impl Dispenser {
    pub fn new(
        tuning: Arc<Tuning>,
        analyzer: Arc<Mutex<DropAnalyzer>>,
        orchestrator: DispenseOrchestrator,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            tuning,
            analyzer,
            orchestrator,
            sink,
        }
    }

    /// Valida la configuración contra el hardware y monta todo el dispensador
    pub fn from_hardware(
        config: &DispenserConfig,
        sensors: SharedSensors,
        actuators: Vec<Box<dyn Actuator>>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, ConfigError> {
        let sensor_channels = sensors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .channel_count();
        config.validate(sensor_channels, actuators.len())?;

        let tuning = Arc::new(config.tuning()?);
        let analyzer = Arc::new(Mutex::new(DropAnalyzer::new(
            config.analyzer_params(),
            tuning.clone(),
            ModelStore::new(&config.model_dir),
            sink.clone(),
        )));
        let source: Box<dyn CaptureSource> = Box::new(SensorCaptureSource::new(
            sensors,
            analyzer.clone(),
            tuning.clone(),
            config.capture_params(),
            sink.clone(),
        ));
        let orchestrator = DispenseOrchestrator::new(
            source,
            ActuatorBank::new(actuators, config.angles()),
            config.lock_timeout(),
            sink.clone(),
        );

        Ok(Self::new(tuning, analyzer, orchestrator, sink))
    }

    fn analyzer(&self) -> MutexGuard<'_, DropAnalyzer> {
        self.analyzer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shared_analyzer(&self) -> Arc<Mutex<DropAnalyzer>> {
        self.analyzer.clone()
    }

    pub fn actuator_count(&self) -> usize {
        self.orchestrator.actuator_count()
    }

    pub fn reset_actuators(&self) -> Result<(), DispenseError> {
        let result = self.orchestrator.reset_actuators();
        match &result {
            Ok(()) => self.log("[CMD] Servos reiniciados".to_string()),
            Err(e) => self.log(format!("[ERR] Reinicio de servos fallido: {}", e)),
        }
        result
    }

    pub fn reset_attempt_counter(&self) {
        self.orchestrator.reset_counter();
        self.log("[CMD] Contador de movimientos a cero".to_string());
    }

    pub fn attempt_counter(&self) -> u32 {
        self.orchestrator.move_counter()
    }

    /// Sin `max_attempts` se usa el valor por defecto de `Tuning`
    pub fn dispense(
        &self,
        actuator: usize,
        max_attempts: Option<u32>,
    ) -> Result<DispenseReport, DispenseError> {
        let max_attempts = max_attempts.unwrap_or_else(|| self.tuning.default_max_attempts());
        self.log(format!("[CMD] Dispensando desde el dispensador {}", actuator + 1));

        let result = self.orchestrator.dispense(actuator, max_attempts);
        match &result {
            Ok(report) if report.success => self.log(format!(
                "[CMD] Pastilla dispensada desde el dispensador {}",
                actuator + 1
            )),
            Ok(_) => self.log(format!(
                "[CMD] No se pudo dispensar desde el dispensador {}: ¿frasco vacío?",
                actuator + 1
            )),
            Err(e) => self.log(format!("[ERR] {}", e)),
        }
        result
    }

    pub fn set_measurement_count(&self, count: usize) -> Result<(), ParameterError> {
        self.logged(self.tuning.set_measurement_count(count))?;
        self.log(format!("[CMD] Muestras por captura: {}", count));
        Ok(())
    }

    pub fn set_default_max_attempts(&self, attempts: u32) -> Result<(), ParameterError> {
        self.logged(self.tuning.set_default_max_attempts(attempts))?;
        self.log(format!("[CMD] Intentos por defecto: {}", attempts));
        Ok(())
    }

    pub fn thresholds(&self) -> ThresholdSnapshot {
        self.tuning.thresholds()
    }

    pub fn set_threshold(&self, kind: ThresholdKind, value: f32) -> Result<(), ParameterError> {
        self.logged(self.tuning.set_threshold(kind, value))?;
        self.log(format!("[CMD] Umbral {} = {:.2}", kind, value));
        Ok(())
    }

    pub fn reset_learning_data(&self, target: ResetTarget) -> Result<(), AnalyzeError> {
        match target {
            ResetTarget::All => {
                self.analyzer().reset_all();
                Ok(())
            }
            ResetTarget::One(actuator) => {
                let result = self.analyzer().reset(actuator);
                if let Err(e) = &result {
                    self.log(format!("[ERR] {}", e));
                }
                result
            }
        }
    }

    pub fn analysis_report(&self, actuator: usize) -> String {
        self.analyzer().analysis_report(actuator)
    }

    fn logged<T>(&self, result: Result<T, ParameterError>) -> Result<T, ParameterError> {
        if let Err(e) = &result {
            self.log(format!("[ERR] {}", e));
        }
        result
    }

    fn log(&self, line: String) {
        self.sink.log_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::SimulatedActuator;
    use crate::drop_analyzer::Verdict;
    use crate::sensor::{shared, DropProfile, DropTrigger, SimulatedSensorBank};
    use crate::telemetry::{ChannelSink, NullSink, TelemetryEvent};
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn fast_config(dir: &std::path::Path) -> DispenserConfig {
        DispenserConfig {
            measurement_count: 40,
            capture_timeout_ms: 60,
            min_capture_window_ms: 20,
            dispense_lock_timeout_ms: 2000,
            model_dir: dir.to_path_buf(),
            ..DispenserConfig::default()
        }
    }

    /// Servos simulados que provocan una caída cuando se mueve `drops_on`
    fn servos(trigger: &DropTrigger, count: usize, drops_on: Option<usize>) -> Vec<Box<dyn Actuator>> {
        (0..count)
            .map(|i| {
                let mut servo = SimulatedActuator::new(Duration::ZERO);
                if drops_on == Some(i) {
                    let trigger = trigger.clone();
                    servo.set_callback(move |_| {
                        let mut profile = DropProfile::single_pill(1);
                        profile.delay = Duration::from_millis(5);
                        trigger.schedule(profile);
                    });
                }
                Box::new(servo) as Box<dyn Actuator>
            })
            .collect()
    }

    fn dispenser(dir: &std::path::Path, drops_on: Option<usize>, sink: Arc<dyn LogSink>) -> Dispenser {
        let bank = SimulatedSensorBank::new(1, 10);
        let trigger = bank.trigger();
        Dispenser::from_hardware(
            &fast_config(dir),
            shared(bank),
            servos(&trigger, 2, drops_on),
            sink,
        )
        .unwrap()
    }

    #[test]
    fn test_dispense_learns_from_drop() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(dir.path(), Some(0), Arc::new(NullSink));

        let report = d.dispense(0, Some(3)).unwrap();
        assert!(report.success);
        assert_eq!(report.attempts, 1);
        assert_eq!(
            report.verdict,
            Some(Verdict::Learning {
                collected: 1,
                capacity: 9
            })
        );
        assert_eq!(d.attempt_counter(), 1);
        assert!(d.analysis_report(0).contains("Grabaciones: 1/9"));
    }

    #[test]
    fn test_empty_bottle_uses_default_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(dir.path(), None, Arc::new(NullSink));
        d.set_default_max_attempts(2).unwrap();

        let report = d.dispense(1, None).unwrap();
        assert!(!report.success);
        assert_eq!(report.attempts, 2);
        assert_eq!(d.attempt_counter(), 2);

        d.reset_attempt_counter();
        assert_eq!(d.attempt_counter(), 0);
    }

    #[test]
    fn test_invalid_parameters_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        let d = dispenser(dir.path(), None, Arc::new(ChannelSink::new(tx)));

        assert_eq!(
            d.set_threshold(ThresholdKind::Average, 1.2),
            Err(ParameterError::Threshold {
                kind: ThresholdKind::Average,
                value: 1.2
            })
        );
        assert_eq!(
            d.set_measurement_count(0),
            Err(ParameterError::MeasurementCount(0))
        );
        assert!((d.thresholds().avg_threshold - 0.75).abs() < 1e-6);

        let errors = rx
            .try_iter()
            .filter(|e| matches!(e, TelemetryEvent::Line(l) if l.starts_with("[ERR]")))
            .count();
        assert_eq!(errors, 2);

        d.set_threshold(ThresholdKind::Channel, 0.4).unwrap();
        assert!((d.thresholds().channel_threshold - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_dispenser_index() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(dir.path(), None, Arc::new(NullSink));
        assert_eq!(
            d.dispense(5, Some(1)),
            Err(DispenseError::InvalidActuator { index: 5, count: 2 })
        );
        assert!(d.reset_learning_data(ResetTarget::One(5)).is_err());
    }

    #[test]
    fn test_reset_learning_data() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(dir.path(), Some(0), Arc::new(NullSink));
        d.dispense(0, Some(2)).unwrap();
        assert!(ModelStore::new(dir.path()).exists(0));

        d.reset_learning_data(ResetTarget::One(0)).unwrap();
        assert_eq!(d.shared_analyzer().lock().unwrap().recording_count(0), 0);
        assert!(!ModelStore::new(dir.path()).exists(0));
        d.reset_learning_data(ResetTarget::All).unwrap();
    }

    #[test]
    fn test_hardware_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bank = SimulatedSensorBank::new(3, 10);
        let trigger = bank.trigger();
        let result = Dispenser::from_hardware(
            &fast_config(dir.path()),
            shared(bank),
            servos(&trigger, 2, None),
            Arc::new(NullSink),
        );
        assert!(matches!(result, Err(ConfigError::HardwareMismatch { .. })));
    }

    #[test]
    fn test_reset_actuators() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(dir.path(), None, Arc::new(NullSink));
        d.reset_actuators().unwrap();
        assert_eq!(d.attempt_counter(), 0);
        assert_eq!(d.actuator_count(), 2);
    }
}
