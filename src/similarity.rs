use crate::types::Envelope;

/// Similitud de forma entre dos envolventes en [0, 1].
///
/// Cada envolvente se normaliza por su propio máximo (1.0 si el máximo es <= 0)
/// y se calcula la correlación de Pearson. La correlación negativa se recorta a 0.
/// Longitudes distintas dan 0 sin calcular nada.
pub fn similarity(a: &Envelope, b: &Envelope) -> f32 {
    if a.points.len() != b.points.len() || a.points.is_empty() {
        return 0.0;
    }

    let max_a = if a.max_value > 0.0 { a.max_value } else { 1.0 } as f64;
    let max_b = if b.max_value > 0.0 { b.max_value } else { 1.0 } as f64;

    let mut sum_a = 0.0f64;
    let mut sum_b = 0.0f64;
    let mut sum_a_sq = 0.0f64;
    let mut sum_b_sq = 0.0f64;
    let mut sum_prod = 0.0f64;

    for (&x, &y) in a.points.iter().zip(&b.points) {
        let x = x as f64 / max_a;
        let y = y as f64 / max_b;
        sum_a += x;
        sum_b += y;
        sum_a_sq += x * x;
        sum_b_sq += y * y;
        sum_prod += x * y;
    }

    let n = a.points.len() as f64;
    let numerator = n * sum_prod - sum_a * sum_b;
    let denominator = ((n * sum_a_sq - sum_a * sum_a) * (n * sum_b_sq - sum_b * sum_b)).sqrt();

    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }

    let correlation = (numerator / denominator) as f32;
    correlation.clamp(0.0, 1.0)
}

/// Similitud media sobre todos los canales de dos conjuntos de envolventes
pub fn mean_channel_similarity(a: &[Envelope], b: &[Envelope]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let total: f32 = a.iter().zip(b).map(|(x, y)| similarity(x, y)).sum();
    total / a.len() as f32
}
