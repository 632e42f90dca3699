use thiserror::Error;

use crate::similarity::mean_channel_similarity;
use crate::types::{DispensingRecord, Envelope, ReferencePattern, DEFAULT_CLUSTER_SIMILARITY};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Not enough recordings to build a reference: have {have}, need {need}")]
    NotEnoughRecordings { have: usize, need: usize },

    #[error("Insufficient consensus: largest similar group {found}, need {needed}")]
    InsufficientConsensus { found: usize, needed: usize },
}

/// Construye el patrón de referencia a partir del grupo mayoritario de grabaciones
#[derive(Debug, Clone, Copy)]
pub struct ReferenceModelBuilder {
    capacity: usize,
    cluster_similarity: f32,
}

impl ReferenceModelBuilder {
    pub fn new(capacity: usize, cluster_similarity: f32) -> Self {
        Self {
            capacity: capacity.max(1),
            cluster_similarity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mayoría estricta: ceil((cap + 1) / 2)
    pub fn required_majority(&self) -> usize {
        (self.capacity + 2) / 2
    }

    /// Matriz simétrica n×n de similitud media por canal, diagonal = 1
    pub fn similarity_matrix(&self, records: &[DispensingRecord]) -> Vec<Vec<f32>> {
        let n = records.len();
        let mut matrix = vec![vec![0.0f32; n]; n];

        for i in 0..n {
            matrix[i][i] = 1.0;
            for j in (i + 1)..n {
                let sim = mean_channel_similarity(&records[i].channels, &records[j].channels);
                matrix[i][j] = sim;
                matrix[j][i] = sim;
            }
        }

        matrix
    }

    /// Agrupamiento voraz: cada registro libre abre un grupo y absorbe los
    /// siguientes libres que sean similares a TODOS los miembros actuales.
    /// Devuelve el grupo más grande (el primero en caso de empate).
    pub fn largest_group(&self, matrix: &[Vec<f32>]) -> Vec<usize> {
        let n = matrix.len();
        let mut used = vec![false; n];
        let mut best_group: Vec<usize> = Vec::new();

        for i in 0..n {
            if used[i] {
                continue;
            }

            let mut group = vec![i];
            used[i] = true;

            for j in (i + 1)..n {
                if used[j] {
                    continue;
                }

                let similar_to_all = group
                    .iter()
                    .all(|&member| matrix[member][j] >= self.cluster_similarity);

                if similar_to_all {
                    group.push(j);
                    used[j] = true;
                }
            }

            if group.len() > best_group.len() {
                best_group = group;
            }
        }

        best_group
    }

    /// Intenta construir la referencia. Devuelve también el grupo usado.
    pub fn build(
        &self,
        records: &[DispensingRecord],
    ) -> Result<(ReferencePattern, Vec<usize>), ConsensusError> {
        if records.len() < self.capacity {
            return Err(ConsensusError::NotEnoughRecordings {
                have: records.len(),
                need: self.capacity,
            });
        }

        let matrix = self.similarity_matrix(records);
        let group = self.largest_group(&matrix);
        let needed = self.required_majority();

        if group.len() < needed {
            return Err(ConsensusError::InsufficientConsensus {
                found: group.len(),
                needed,
            });
        }

        let members: Vec<&DispensingRecord> = group.iter().map(|&idx| &records[idx]).collect();
        let channel_count = members[0].channels.len();

        let channels = (0..channel_count)
            .map(|ch| average_channel(&members, ch))
            .collect();

        Ok((ReferencePattern { channels }, group))
    }
}

impl Default for ReferenceModelBuilder {
    fn default() -> Self {
        Self::new(crate::types::DEFAULT_MAX_RECORDINGS, DEFAULT_CLUSTER_SIMILARITY)
    }
}

/// Promedio posición a posición del canal `ch` de los miembros
fn average_channel(members: &[&DispensingRecord], ch: usize) -> Envelope {
    let len = members[0].channels.get(ch).map(|e| e.len()).unwrap_or(0);
    let mut sums = vec![0.0f32; len];

    for record in members {
        if let Some(envelope) = record.channels.get(ch) {
            for (acc, &v) in sums.iter_mut().zip(&envelope.points) {
                *acc += v;
            }
        }
    }

    let count = members.len() as f32;
    for acc in sums.iter_mut() {
        *acc /= count;
    }

    Envelope::from_points(sums)
}
