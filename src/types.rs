use std::time::{SystemTime, UNIX_EPOCH};

/// Lecturas crudas de un canal piezo durante una caída (valores ADC)
pub type SampleWindow = Vec<i32>;

/// Constantes por defecto del sistema
pub const DEFAULT_ENVELOPE_POINTS: usize = 50;
pub const DEFAULT_MAX_RECORDINGS: usize = 9; // Impar para que la mayoría sea limpia
pub const DEFAULT_CLUSTER_SIMILARITY: f32 = 0.7;
pub const DEFAULT_AVG_THRESHOLD: f32 = 0.75;
pub const DEFAULT_CHANNEL_THRESHOLD: f32 = 0.6;
pub const DEFAULT_MEASUREMENT_COUNT: usize = 500;
/// Tope de muestras por canal y captura
pub const MAX_MEASUREMENT_COUNT: usize = 100_000;
pub const DEFAULT_TRIGGER_THRESHOLD: i32 = 50;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Envolvente de una ventana: máximo por sub-ventana + características escalares
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub points: Vec<f32>,
    pub max_value: f32,
    pub total_area: f32,
    /// Índice del primer máximo
    pub peak_index: usize,
    /// Canal que disparó la captura
    pub trigger_channel: String,
    pub timestamp_ms: u64,
}

impl Envelope {
    /// Construye una envolvente y calcula max, área y pico
    pub fn from_points(points: Vec<f32>) -> Self {
        let mut envelope = Self {
            points,
            ..Default::default()
        };
        envelope.recompute_features();
        envelope
    }

    /// Recalcula max_value, total_area y peak_index desde `points`
    pub fn recompute_features(&mut self) {
        let mut max_value = f32::NEG_INFINITY;
        let mut peak_index = 0;
        for (i, &v) in self.points.iter().enumerate() {
            if v > max_value {
                max_value = v;
                peak_index = i;
            }
        }

        self.max_value = if self.points.is_empty() { 0.0 } else { max_value };
        self.peak_index = peak_index;
        self.total_area = self.points.iter().sum();
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Una caída observada: una envolvente por canal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispensingRecord {
    pub channels: Vec<Envelope>,
    pub is_valid: bool,
    pub timestamp_ms: u64,
}

impl DispensingRecord {
    pub fn new(channels: Vec<Envelope>) -> Self {
        Self {
            channels,
            is_valid: true,
            timestamp_ms: now_ms(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Patrón de referencia aprendido: una envolvente promediada por canal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferencePattern {
    pub channels: Vec<Envelope>,
}

/// Estado de aprendizaje de un dispensador.
///
/// Las grabaciones sólo crecen hasta la capacidad; la referencia se fija una
/// sola vez y el contador de fallos nunca baja (salvo reset explícito).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActuatorLearningState {
    recordings: Vec<DispensingRecord>,
    reference: Option<ReferencePattern>,
    failed_count: u32,
}

impl ActuatorLearningState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruye un estado leído de disco
    pub fn restore(
        recordings: Vec<DispensingRecord>,
        reference: Option<ReferencePattern>,
        failed_count: u32,
    ) -> Self {
        Self {
            recordings,
            reference,
            failed_count,
        }
    }

    pub fn recordings(&self) -> &[DispensingRecord] {
        &self.recordings
    }

    pub fn recording_count(&self) -> usize {
        self.recordings.len()
    }

    pub fn reference(&self) -> Option<&ReferencePattern> {
        self.reference.as_ref()
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    /// Lleno sin referencia: ya no aprende ni clasifica hasta un reset
    pub fn is_frozen_unscored(&self, capacity: usize) -> bool {
        self.recordings.len() >= capacity && self.reference.is_none()
    }

    /// Añade una grabación si queda sitio. Devuelve false si está llena.
    pub fn push_recording(&mut self, record: DispensingRecord, capacity: usize) -> bool {
        if self.recordings.len() >= capacity {
            return false;
        }
        self.recordings.push(record);
        true
    }

    /// Fija la referencia. Sólo la primera llamada tiene efecto.
    pub fn set_reference(&mut self, reference: ReferencePattern) -> bool {
        if self.reference.is_some() {
            return false;
        }
        self.reference = Some(reference);
        true
    }

    pub fn record_failure(&mut self) -> u32 {
        self.failed_count = self.failed_count.saturating_add(1);
        self.failed_count
    }
}

/// Milisegundos desde UNIX epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
