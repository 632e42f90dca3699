//! Salida de log y telemetría. Se inyecta en cada componente como
//! `Arc<dyn LogSink>`; no existe una instancia global.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Ventana cruda de un canal para el gráfico del panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphChannel {
    pub label: String,
    /// Lista literal de enteros separados por comas
    pub values: String,
}

/// Mensaje de gráfico emitido una vez por captura completada
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "graph")]
pub struct GraphMessage {
    pub trigger: String,
    pub channels: Vec<GraphChannel>,
}

impl GraphMessage {
    pub fn new(trigger: &str, labels: &[String], windows: &[Vec<i32>]) -> Self {
        let channels = labels
            .iter()
            .zip(windows)
            .map(|(label, window)| GraphChannel {
                label: label.clone(),
                values: window
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            })
            .collect();

        Self {
            trigger: trigger.to_string(),
            channels,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Evento que viaja por un `ChannelSink`
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Line(String),
    Graph(GraphMessage),
}

/// Destino de líneas de log y telemetría. Fire-and-forget.
pub trait LogSink: Send + Sync {
    fn log_line(&self, line: &str);

    fn graph(&self, message: &GraphMessage) {
        self.log_line(&format!("[GRAPH] {}", message.to_json()));
    }
}

/// Reenvía todo a `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log_line(&self, line: &str) {
        info!("{}", line);
    }

    fn graph(&self, message: &GraphMessage) {
        debug!(target: "dropsense::graph", "{}", message.to_json());
    }
}

/// Publica eventos en un canal (panel web, tests). Si el canal está lleno
/// o cerrado el evento se descarta.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<TelemetryEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<TelemetryEvent>) -> Self {
        Self { tx }
    }
}

impl LogSink for ChannelSink {
    fn log_line(&self, line: &str) {
        let _ = self.tx.try_send(TelemetryEvent::Line(line.to_string()));
    }

    fn graph(&self, message: &GraphMessage) {
        let _ = self.tx.try_send(TelemetryEvent::Graph(message.clone()));
    }
}

/// Descarta todo
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log_line(&self, _line: &str) {}
    fn graph(&self, _message: &GraphMessage) {}
}
