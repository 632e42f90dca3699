use crate::types::{now_ms, Envelope, DEFAULT_ENVELOPE_POINTS};

/// Reduce una ventana cruda a una envolvente de longitud fija
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeExtractor {
    target_points: usize,
}

impl EnvelopeExtractor {
    pub fn new(target_points: usize) -> Self {
        Self {
            target_points: target_points.max(1),
        }
    }

    pub fn target_points(&self) -> usize {
        self.target_points
    }

    /// Toma el máximo de cada sub-ventana `i*len/N .. (i+1)*len/N`.
    /// Una ventana vacía produce una envolvente vacía (similitud 0 con todo).
    pub fn extract(&self, raw: &[i32]) -> Envelope {
        if raw.is_empty() {
            return Envelope::default();
        }

        let len = raw.len();
        let n = self.target_points;
        let mut points = Vec::with_capacity(n);

        for i in 0..n {
            let start = i * len / n;
            // Con menos muestras que puntos el rango puede quedar vacío:
            // se usa al menos la muestra de inicio
            let end = ((i + 1) * len / n).max(start + 1).min(len);

            let max_in_window = raw[start..end].iter().copied().max().unwrap_or(raw[start]);
            points.push(max_in_window as f32);
        }

        let mut envelope = Envelope::from_points(points);
        envelope.timestamp_ms = now_ms();
        envelope
    }
}

impl Default for EnvelopeExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_ENVELOPE_POINTS)
    }
}
