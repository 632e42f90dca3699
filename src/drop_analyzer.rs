use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;

use crate::anomaly_classifier::{AnomalyClassifier, Classification};
use crate::envelope::EnvelopeExtractor;
use crate::model_store::ModelStore;
use crate::reference_builder::ReferenceModelBuilder;
use crate::similarity::mean_channel_similarity;
use crate::telemetry::LogSink;
use crate::tuning::Tuning;
use crate::types::{
    now_ms, ActuatorLearningState, DispensingRecord, SampleWindow, DEFAULT_CLUSTER_SIMILARITY,
    DEFAULT_ENVELOPE_POINTS, DEFAULT_MAX_RECORDINGS,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyzeError {
    #[error("Unknown actuator index {index} (have {count})")]
    UnknownActuator { index: usize, count: usize },

    #[error("Expected {expected} channels, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
}

/// Parámetros fijos del aprendizaje
#[derive(Debug, Clone)]
pub struct AnalyzerParams {
    pub actuator_count: usize,
    pub channel_labels: Vec<String>,
    pub envelope_points: usize,
    pub max_recordings: usize,
    pub cluster_similarity: f32,
}

impl Default for AnalyzerParams {
    fn default() -> Self {
        Self {
            actuator_count: 2,
            channel_labels: vec!["GREEN".to_string()],
            envelope_points: DEFAULT_ENVELOPE_POINTS,
            max_recordings: DEFAULT_MAX_RECORDINGS,
            cluster_similarity: DEFAULT_CLUSTER_SIMILARITY,
        }
    }
}

/// Veredicto sobre una caída
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Grabación añadida al aprendizaje
    Learning { collected: usize, capacity: usize },
    Normal(Classification),
    Anomalous(Classification),
    /// Sin referencia (consenso insuficiente): no se puede puntuar
    Unscored,
}

impl Verdict {
    /// Sólo una caída puntuada y rechazada cuenta como anómala
    pub fn is_normal(&self) -> bool {
        !matches!(self, Verdict::Anomalous(_))
    }

    pub fn classification(&self) -> Option<&Classification> {
        match self {
            Verdict::Normal(c) | Verdict::Anomalous(c) => Some(c),
            _ => None,
        }
    }
}

/// Pipeline de aprendizaje y clasificación de todos los dispensadores
pub struct DropAnalyzer {
    params: AnalyzerParams,
    states: Vec<ActuatorLearningState>,
    extractor: EnvelopeExtractor,
    builder: ReferenceModelBuilder,
    tuning: Arc<Tuning>,
    store: ModelStore,
    sink: Arc<dyn LogSink>,
}

impl DropAnalyzer {
    /// Crea el analizador y restaura el progreso guardado
    pub fn new(
        params: AnalyzerParams,
        tuning: Arc<Tuning>,
        store: ModelStore,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let mut analyzer = Self {
            states: vec![ActuatorLearningState::new(); params.actuator_count],
            extractor: EnvelopeExtractor::new(params.envelope_points),
            builder: ReferenceModelBuilder::new(params.max_recordings, params.cluster_similarity),
            params,
            tuning,
            store,
            sink,
        };
        analyzer.load_all();
        analyzer
    }

    pub fn actuator_count(&self) -> usize {
        self.states.len()
    }

    pub fn channel_labels(&self) -> &[String] {
        &self.params.channel_labels
    }

    pub fn capacity(&self) -> usize {
        self.builder.capacity()
    }

    pub fn state(&self, actuator: usize) -> Option<&ActuatorLearningState> {
        self.states.get(actuator)
    }

    /// Envolvente por canal a partir de las ventanas crudas
    pub fn build_record(&self, windows: &[SampleWindow], trigger_channel: &str) -> DispensingRecord {
        let channels = windows
            .iter()
            .map(|raw| {
                let mut envelope = self.extractor.extract(raw);
                envelope.trigger_channel = trigger_channel.to_string();
                envelope
            })
            .collect();

        DispensingRecord {
            channels,
            is_valid: true,
            timestamp_ms: now_ms(),
        }
    }

    /// Atajo: extrae envolventes y analiza
    pub fn analyze_windows(
        &mut self,
        actuator: usize,
        windows: &[SampleWindow],
        trigger_channel: &str,
    ) -> Result<Verdict, AnalyzeError> {
        let record = self.build_record(windows, trigger_channel);
        self.analyze(actuator, record)
    }

    /// Aprende mientras haya sitio; al llenar intenta construir la referencia
    /// una sola vez; con referencia, clasifica sin añadir datos.
    pub fn analyze(
        &mut self,
        actuator: usize,
        record: DispensingRecord,
    ) -> Result<Verdict, AnalyzeError> {
        self.check_actuator(actuator)?;
        let expected = self.params.channel_labels.len();
        if record.channel_count() != expected {
            return Err(AnalyzeError::ChannelMismatch {
                expected,
                actual: record.channel_count(),
            });
        }

        let capacity = self.builder.capacity();
        let trigger = record
            .channels
            .first()
            .map(|e| e.trigger_channel.clone())
            .unwrap_or_default();

        let state = &self.states[actuator];

        if state.has_reference() {
            return Ok(self.classify(actuator, &record));
        }

        if state.is_frozen_unscored(capacity) {
            self.log(format!(
                "[PATTERN] Dispensador {} sin referencia ({} grabaciones, consenso insuficiente) - caída sin puntuar",
                actuator + 1,
                capacity
            ));
            return Ok(Verdict::Unscored);
        }

        let state = &mut self.states[actuator];
        state.push_recording(record.clone(), capacity);
        let collected = state.recording_count();

        if collected < capacity {
            self.save(actuator);
            self.log(format!(
                "[PATTERN] Fase de aprendizaje: {}/{} grabaciones (disparo: {})",
                collected, capacity, trigger
            ));
            return Ok(Verdict::Learning {
                collected,
                capacity,
            });
        }

        // La grabación que llena la lista dispara el único intento de construcción
        self.log(format!(
            "[PATTERN] Aprendizaje completo. Construyendo referencia con {} grabaciones...",
            capacity
        ));
        let built = self.build_reference(actuator);
        self.save(actuator);

        if built {
            Ok(self.classify(actuator, &record))
        } else {
            Ok(Verdict::Unscored)
        }
    }

    fn build_reference(&mut self, actuator: usize) -> bool {
        let state = &self.states[actuator];
        match self.builder.build(state.recordings()) {
            Ok((reference, group)) => {
                let total = state.recording_count();
                self.states[actuator].set_reference(reference);
                self.log(format!(
                    "[PATTERN] Referencia creada para dispensador {} con {}/{} grabaciones",
                    actuator + 1,
                    group.len(),
                    total
                ));
                self.log(format!(
                    "[PATTERN] Calidad de referencia: {:.3}",
                    self.reference_quality(actuator)
                ));
                true
            }
            Err(e) => {
                self.log(format!(
                    "[PATTERN] No se pudo crear la referencia del dispensador {}: {}",
                    actuator + 1,
                    e
                ));
                false
            }
        }
    }

    fn classify(&mut self, actuator: usize, record: &DispensingRecord) -> Verdict {
        let thresholds = self.tuning.thresholds();
        let classifier = AnomalyClassifier::new(thresholds.avg_threshold);

        let classification = match self.states[actuator].reference() {
            Some(reference) => classifier.evaluate(record, reference),
            None => return Verdict::Unscored,
        };

        let labels = &self.params.channel_labels;
        let details = classification
            .channel_similarities
            .iter()
            .zip(labels)
            .map(|(sim, label)| format!("{}: {:.3}", label, sim))
            .collect::<Vec<_>>()
            .join(", ");
        let best_label = labels
            .get(classification.best_channel)
            .cloned()
            .unwrap_or_default();

        self.log(format!(
            "[PATTERN] Similitud media: {:.3}, mejor: {} {:.3} ({}) - {}",
            classification.avg_similarity,
            best_label,
            classification.max_similarity,
            details,
            if classification.accepted { "NORMAL" } else { "ANORMAL" }
        ));

        let weak: Vec<&str> = classification
            .weak_channels(thresholds.channel_threshold)
            .into_iter()
            .filter_map(|i| labels.get(i).map(String::as_str))
            .collect();
        if !weak.is_empty() {
            self.log(format!(
                "[PATTERN] Canales débiles (< {:.2}): {}",
                thresholds.channel_threshold,
                weak.join(", ")
            ));
        }

        if classification.accepted_via_best_channel(thresholds.avg_threshold) {
            self.log(format!(
                "[PATTERN] Aceptada por el mejor canal: el sensor {} muestra buena similitud",
                best_label
            ));
        }

        if classification.accepted {
            return Verdict::Normal(classification);
        }

        self.log(format!(
            "[PATTERN] Motivo de rechazo: media ({:.3} < {:.2}) y mejor canal {} ({:.3} < {:.2}) bajo el umbral",
            classification.avg_similarity,
            thresholds.avg_threshold,
            best_label,
            classification.max_similarity,
            thresholds.avg_threshold
        ));

        let failed = self.states[actuator].record_failure();
        self.log(format!(
            "[PATTERN] ¡DISPENSADO DEFECTUOSO detectado! Total fallidos: {}",
            failed
        ));
        self.save(actuator);

        Verdict::Anomalous(classification)
    }

    // ========== Estadísticas ==========

    pub fn failed_count(&self, actuator: usize) -> u32 {
        self.states.get(actuator).map(|s| s.failed_count()).unwrap_or(0)
    }

    pub fn recording_count(&self, actuator: usize) -> usize {
        self.states.get(actuator).map(|s| s.recording_count()).unwrap_or(0)
    }

    pub fn has_reference(&self, actuator: usize) -> bool {
        self.states.get(actuator).map(|s| s.has_reference()).unwrap_or(false)
    }

    /// Similitud media de las grabaciones guardadas contra la referencia
    pub fn reference_quality(&self, actuator: usize) -> f32 {
        let Some(state) = self.states.get(actuator) else {
            return 0.0;
        };
        let Some(reference) = state.reference() else {
            return 0.0;
        };
        if state.recordings().is_empty() {
            return 0.0;
        }

        let total: f32 = state
            .recordings()
            .iter()
            .map(|r| mean_channel_similarity(&r.channels, &reference.channels))
            .sum();
        total / state.recording_count() as f32
    }

    pub fn analysis_report(&self, actuator: usize) -> String {
        if actuator >= self.states.len() {
            return "Índice de dispensador inválido".to_string();
        }

        let mut report = String::new();
        let _ = writeln!(report, "[ANALYSIS] Informe del dispensador {}:", actuator + 1);
        let _ = writeln!(
            report,
            "  Grabaciones: {}/{}",
            self.recording_count(actuator),
            self.capacity()
        );
        let _ = writeln!(report, "  Dispensados fallidos: {}", self.failed_count(actuator));
        let has_reference = self.has_reference(actuator);
        let _ = writeln!(
            report,
            "  Tiene referencia: {}",
            if has_reference { "Sí" } else { "No" }
        );
        if has_reference {
            let _ = writeln!(
                report,
                "  Calidad de referencia: {:.3}",
                self.reference_quality(actuator)
            );
        }
        report
    }

    // ========== Persistencia ==========

    /// Guarda un dispensador. Un error se registra y el estado en memoria
    /// sigue siendo el válido.
    pub fn save(&self, actuator: usize) {
        let Some(state) = self.states.get(actuator) else {
            return;
        };
        if let Err(e) = self.store.save(actuator, state) {
            self.log(format!(
                "[PATTERN] Error guardando progreso del dispensador {}: {}",
                actuator + 1,
                e
            ));
        }
    }

    pub fn save_all(&self) {
        for actuator in 0..self.states.len() {
            self.save(actuator);
        }
    }

    pub fn load_all(&mut self) {
        let channels = self.params.channel_labels.len();
        for actuator in 0..self.states.len() {
            match self.store.load(actuator, channels) {
                Ok(Some(state)) => {
                    self.log(format!(
                        "[PATTERN] Progreso cargado del dispensador {}: {} grabaciones, modelo: {}",
                        actuator + 1,
                        state.recording_count(),
                        if state.has_reference() { "Sí" } else { "No" }
                    ));
                    self.states[actuator] = state;
                }
                Ok(None) => {
                    self.log(format!(
                        "[PATTERN] Sin progreso guardado para el dispensador {}",
                        actuator + 1
                    ));
                }
                Err(e) => {
                    // Se trata como pérdida de datos: el dispensador empieza vacío
                    self.log(format!(
                        "[PATTERN] Progreso ilegible del dispensador {} ({}); se empieza de cero",
                        actuator + 1,
                        e
                    ));
                    self.states[actuator] = ActuatorLearningState::new();
                }
            }
        }
    }

    // ========== Reset ==========

    pub fn reset(&mut self, actuator: usize) -> Result<(), AnalyzeError> {
        self.check_actuator(actuator)?;
        self.states[actuator] = ActuatorLearningState::new();

        if let Err(e) = self.store.remove(actuator) {
            self.log(format!(
                "[PATTERN] No se pudo borrar el archivo del dispensador {}: {}",
                actuator + 1,
                e
            ));
        }
        self.log(format!(
            "[PATTERN] RESET: datos borrados del dispensador {}",
            actuator + 1
        ));
        Ok(())
    }

    pub fn reset_all(&mut self) {
        self.log("[PATTERN] RESET: borrando datos de todos los dispensadores...".to_string());
        for actuator in 0..self.states.len() {
            let _ = self.reset(actuator);
        }
    }

    fn check_actuator(&self, actuator: usize) -> Result<(), AnalyzeError> {
        if actuator >= self.states.len() {
            return Err(AnalyzeError::UnknownActuator {
                index: actuator,
                count: self.states.len(),
            });
        }
        Ok(())
    }

    fn log(&self, line: String) {
        self.sink.log_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{ChannelSink, NullSink, TelemetryEvent};
    use crate::types::Envelope;
    use crossbeam_channel::{unbounded, Receiver};
    use tempfile::tempdir;

    fn drop_shape(scale: f32) -> Vec<f32> {
        vec![0.0, 1.0, 4.0 * scale, 9.0, 6.0, 3.0, 1.5, 0.5, 0.0, 0.0]
    }

    fn record(channels: Vec<Vec<f32>>) -> DispensingRecord {
        DispensingRecord::new(channels.into_iter().map(Envelope::from_points).collect())
    }

    fn analyzer(dir: &std::path::Path, channels: usize) -> DropAnalyzer {
        analyzer_with_sink(dir, channels, Arc::new(NullSink))
    }

    fn analyzer_with_sink(
        dir: &std::path::Path,
        channels: usize,
        sink: Arc<dyn LogSink>,
    ) -> DropAnalyzer {
        let params = AnalyzerParams {
            actuator_count: 2,
            channel_labels: (0..channels).map(|i| format!("CH{}", i)).collect(),
            ..Default::default()
        };
        DropAnalyzer::new(
            params,
            Arc::new(Tuning::default()),
            ModelStore::new(dir),
            sink,
        )
    }

    fn lines(rx: &Receiver<TelemetryEvent>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|e| match e {
                TelemetryEvent::Line(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    /// 9 grabaciones con similitud > 0.9 entre sí en 2 canales
    fn learn_consistent(a: &mut DropAnalyzer) -> Vec<f32> {
        let mut sum = vec![0.0f32; 10];
        for i in 0..9 {
            let shape = drop_shape(1.0 + (i % 3) as f32 * 0.05);
            for (acc, v) in sum.iter_mut().zip(&shape) {
                *acc += v;
            }
            a.analyze(0, record(vec![shape.clone(), shape])).unwrap();
        }
        sum.iter().map(|v| v / 9.0).collect()
    }

    #[test]
    fn test_learning_then_reference() {
        let dir = tempdir().unwrap();
        let mut a = analyzer(dir.path(), 2);

        for i in 0..8 {
            let v = a.analyze(0, record(vec![drop_shape(1.0), drop_shape(1.0)])).unwrap();
            assert_eq!(
                v,
                Verdict::Learning {
                    collected: i + 1,
                    capacity: 9
                }
            );
        }
        assert!(!a.has_reference(0));

        let v = a.analyze(0, record(vec![drop_shape(1.0), drop_shape(1.0)])).unwrap();
        assert!(matches!(v, Verdict::Normal(_)));
        assert!(a.has_reference(0));
        assert_eq!(a.recording_count(0), 9);
    }

    #[test]
    fn test_reference_is_average_and_scenario() {
        let dir = tempdir().unwrap();
        let mut a = analyzer(dir.path(), 2);
        let expected = learn_consistent(&mut a);

        let reference = a.state(0).unwrap().reference().unwrap().clone();
        for (got, want) in reference.channels[0].points.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-4);
        }

        // Décima caída idéntica a la referencia
        let same = reference.channels[0].points.clone();
        let v = a.analyze(0, record(vec![same.clone(), same.clone()])).unwrap();
        let c = v.classification().unwrap();
        assert!(v.is_normal());
        assert!((c.avg_similarity - 1.0).abs() < 1e-4);

        // Canal 2 a cero: media 0.5 pero el mejor canal rescata
        let v = a.analyze(0, record(vec![same, vec![0.0; 10]])).unwrap();
        let c = v.classification().unwrap();
        assert!(v.is_normal());
        assert!((c.avg_similarity - 0.5).abs() < 1e-4);
        assert!((c.max_similarity - 1.0).abs() < 1e-4);

        // Clasificar no añade datos de entrenamiento
        assert_eq!(a.recording_count(0), 9);
        assert_eq!(a.failed_count(0), 0);
    }

    #[test]
    fn test_rejection_increments_failed_once() {
        let dir = tempdir().unwrap();
        let mut a = analyzer(dir.path(), 2);
        learn_consistent(&mut a);

        let reversed: Vec<f32> = drop_shape(1.0).into_iter().rev().collect();
        let v = a.analyze(0, record(vec![reversed.clone(), reversed])).unwrap();
        assert!(!v.is_normal());
        assert_eq!(a.failed_count(0), 1);
    }

    #[test]
    fn test_insufficient_consensus_freezes() {
        let dir = tempdir().unwrap();
        let mut a = analyzer(dir.path(), 1);
        let shapes = [
            vec![0.0, 9.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 9.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 9.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 9.0, 0.0, 0.0],
        ];
        for i in 0..8 {
            a.analyze(0, record(vec![shapes[i % 4].clone()])).unwrap();
        }
        let v = a.analyze(0, record(vec![shapes[0].clone()])).unwrap();
        assert_eq!(v, Verdict::Unscored);
        assert!(!a.has_reference(0));

        // Congelado: no aprende más ni reintenta
        let v = a.analyze(0, record(vec![shapes[0].clone()])).unwrap();
        assert_eq!(v, Verdict::Unscored);
        assert_eq!(a.recording_count(0), 9);
        assert!(!a.has_reference(0));
    }

    #[test]
    fn test_persisted_progress_restored() {
        let dir = tempdir().unwrap();
        {
            let mut a = analyzer(dir.path(), 2);
            learn_consistent(&mut a);
            let reversed: Vec<f32> = drop_shape(1.0).into_iter().rev().collect();
            a.analyze(0, record(vec![reversed.clone(), reversed])).unwrap();
            a.analyze(1, record(vec![drop_shape(1.0), drop_shape(1.0)])).unwrap();
        }

        let a = analyzer(dir.path(), 2);
        assert!(a.has_reference(0));
        assert_eq!(a.recording_count(0), 9);
        assert_eq!(a.failed_count(0), 1);
        assert_eq!(a.recording_count(1), 1);
        assert!(!a.has_reference(1));
    }

    #[test]
    fn test_unwritable_store_keeps_learning_in_memory() {
        // El directorio del modelo es un archivo normal: toda escritura falla
        let dir = tempdir().unwrap();
        let blocked = dir.path().join("models");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let (tx, rx) = unbounded();
        let mut a = analyzer_with_sink(&blocked, 2, Arc::new(ChannelSink::new(tx)));
        learn_consistent(&mut a);

        assert!(a.has_reference(0));
        assert_eq!(a.recording_count(0), 9);
        let errors = lines(&rx)
            .into_iter()
            .filter(|l| l.starts_with("[PATTERN] Error guardando progreso del dispensador 1"))
            .count();
        assert!(errors >= 1);
    }

    #[test]
    fn test_corrupt_progress_starts_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("actuator0_progress.dat"), b"garbage, not a model").unwrap();

        let (tx, rx) = unbounded();
        let a = analyzer_with_sink(dir.path(), 2, Arc::new(ChannelSink::new(tx)));

        assert_eq!(a.recording_count(0), 0);
        assert!(!a.has_reference(0));
        assert_eq!(a.failed_count(0), 0);
        let lines = lines(&rx);
        assert!(lines
            .iter()
            .any(|l| l.starts_with("[PATTERN] Progreso ilegible del dispensador 1")));
        assert!(lines
            .iter()
            .any(|l| l == "[PATTERN] Sin progreso guardado para el dispensador 2"));
    }

    #[test]
    fn test_reset_single_and_all() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let mut a = analyzer(dir.path(), 2);
        learn_consistent(&mut a);
        a.analyze(1, record(vec![drop_shape(1.0), drop_shape(1.0)])).unwrap();
        assert!(store.exists(0) && store.exists(1));

        a.reset(0).unwrap();
        assert_eq!(a.state(0), Some(&ActuatorLearningState::new()));
        assert!(!store.exists(0));
        assert_eq!(a.recording_count(1), 1);

        a.reset_all();
        assert_eq!(a.recording_count(1), 0);
        assert!(!store.exists(1));
        assert!(a.reset(5).is_err());
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let mut a = analyzer(dir.path(), 2);
        let err = a.analyze(0, record(vec![drop_shape(1.0)])).unwrap_err();
        assert_eq!(
            err,
            AnalyzeError::ChannelMismatch {
                expected: 2,
                actual: 1
            }
        );
        assert!(matches!(
            a.analyze(7, record(vec![drop_shape(1.0), drop_shape(1.0)])),
            Err(AnalyzeError::UnknownActuator { index: 7, .. })
        ));
    }

    #[test]
    fn test_report_mentions_counts() {
        let dir = tempdir().unwrap();
        let mut a = analyzer(dir.path(), 2);
        learn_consistent(&mut a);
        let report = a.analysis_report(0);
        assert!(report.contains("Grabaciones: 9/9"));
        assert!(report.contains("Tiene referencia: Sí"));
        assert!(a.reference_quality(0) > 0.9);
    }
}
