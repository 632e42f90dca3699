use crate::similarity::similarity;
use crate::types::{DispensingRecord, ReferencePattern};

/// Resultado de comparar una caída contra la referencia
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Similitud por canal, en el orden de los canales
    pub channel_similarities: Vec<f32>,
    pub avg_similarity: f32,
    pub max_similarity: f32,
    /// Índice del canal con mayor similitud
    pub best_channel: usize,
    pub accepted: bool,
}

impl Classification {
    /// Aceptada sólo gracias al mejor canal (la media no llegaba)
    pub fn accepted_via_best_channel(&self, avg_threshold: f32) -> bool {
        self.accepted && self.avg_similarity < avg_threshold
    }

    /// Canales por debajo del umbral individual (sólo diagnóstico)
    pub fn weak_channels(&self, channel_threshold: f32) -> Vec<usize> {
        self.channel_similarities
            .iter()
            .enumerate()
            .filter(|(_, &s)| s < channel_threshold)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Regla "lo mejor de ambos": se acepta si la media O el mejor canal
/// alcanzan `avg_threshold`. Cubre la pastilla que cae de lado y golpea
/// sobre todo un sensor.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyClassifier {
    avg_threshold: f32,
}

impl AnomalyClassifier {
    pub fn new(avg_threshold: f32) -> Self {
        Self { avg_threshold }
    }

    pub fn avg_threshold(&self) -> f32 {
        self.avg_threshold
    }

    pub fn evaluate(&self, record: &DispensingRecord, reference: &ReferencePattern) -> Classification {
        let channel_similarities: Vec<f32> = record
            .channels
            .iter()
            .zip(&reference.channels)
            .map(|(observed, expected)| similarity(observed, expected))
            .collect();

        let avg_similarity = if channel_similarities.is_empty() {
            0.0
        } else {
            channel_similarities.iter().sum::<f32>() / channel_similarities.len() as f32
        };

        let (best_channel, max_similarity) = channel_similarities
            .iter()
            .copied()
            .enumerate()
            .fold((0, 0.0f32), |(bi, bs), (i, s)| if s > bs { (i, s) } else { (bi, bs) });

        let accepted =
            avg_similarity >= self.avg_threshold || max_similarity >= self.avg_threshold;

        Classification {
            channel_similarities,
            avg_similarity,
            max_similarity,
            best_channel,
            accepted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Envelope;

    fn shape() -> Vec<f32> {
        vec![0.0, 3.0, 10.0, 7.0, 4.0, 2.0, 1.0, 0.0]
    }

    fn record(channels: Vec<Vec<f32>>) -> DispensingRecord {
        DispensingRecord::new(channels.into_iter().map(Envelope::from_points).collect())
    }

    fn reference() -> ReferencePattern {
        ReferencePattern {
            channels: vec![Envelope::from_points(shape()), Envelope::from_points(shape())],
        }
    }

    #[test]
    fn test_identical_accepted() {
        let c = AnomalyClassifier::new(0.75).evaluate(&record(vec![shape(), shape()]), &reference());
        assert!(c.accepted);
        assert!((c.avg_similarity - 1.0).abs() < 1e-5);
        assert!(!c.accepted_via_best_channel(0.75));
    }

    #[test]
    fn test_best_channel_rescues_low_average() {
        let c = AnomalyClassifier::new(0.75)
            .evaluate(&record(vec![shape(), vec![0.0; 8]]), &reference());
        assert!(c.accepted);
        assert!((c.avg_similarity - 0.5).abs() < 1e-5);
        assert!((c.max_similarity - 1.0).abs() < 1e-5);
        assert_eq!(c.best_channel, 0);
        assert!(c.accepted_via_best_channel(0.75));
        assert_eq!(c.weak_channels(0.6), vec![1]);
    }

    #[test]
    fn test_both_below_rejected() {
        let reversed: Vec<f32> = shape().into_iter().rev().collect();
        let flat = vec![0.0; 8];
        let c = AnomalyClassifier::new(0.75).evaluate(&record(vec![flat, reversed]), &reference());
        assert!(c.max_similarity < 0.75);
        assert!(!c.accepted);
    }
}
