use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use bincode::Options;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::types::{ActuatorLearningState, DispensingRecord, Envelope, ReferencePattern};

const MAGIC: [u8; 4] = *b"DRPM";
const FORMAT_VERSION: u16 = 1;
/// Cota de lectura: un archivo corrupto no puede pedir más memoria que esto
const MAX_STATE_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Bad magic header in {path:?}")]
    BadMagic { path: PathBuf },

    #[error("Unsupported model format version {found}")]
    UnsupportedVersion { found: u16 },

    #[error("Channel count mismatch: file has {found}, system has {expected}")]
    ChannelMismatch { expected: usize, found: usize },

    #[error("Truncated model file {path:?}")]
    Truncated { path: PathBuf },

    #[error("Corrupt model data: {0}")]
    Corrupt(String),
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                StoreError::Truncated {
                    path: PathBuf::new(),
                }
            }
            bincode::ErrorKind::Io(e) => StoreError::Io(e),
            other => StoreError::Corrupt(other.to_string()),
        }
    }
}

/// Little-endian con enteros de ancho fijo
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_STATE_BYTES)
}

// ========== Formato en disco ==========

#[derive(Serialize, Deserialize)]
struct FileHeader {
    magic: [u8; 4],
    version: u16,
    channel_count: u16,
}

#[derive(Serialize, Deserialize)]
struct StateSnapshot {
    failed_count: u32,
    recordings: Vec<RecordSnapshot>,
    reference: Option<Vec<ShapeSnapshot>>,
}

#[derive(Serialize, Deserialize)]
struct RecordSnapshot {
    timestamp_ms: u64,
    is_valid: bool,
    channels: Vec<ChannelSnapshot>,
}

#[derive(Serialize, Deserialize)]
struct ChannelSnapshot {
    shape: ShapeSnapshot,
    timestamp_ms: u64,
    trigger_channel: String,
}

/// Puntos y rasgos; la referencia no guarda marca de tiempo ni etiqueta
#[derive(Serialize, Deserialize)]
struct ShapeSnapshot {
    points: Vec<f32>,
    max_value: f32,
    total_area: f32,
    peak_index: u32,
}

impl ShapeSnapshot {
    fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            points: envelope.points.clone(),
            max_value: envelope.max_value,
            total_area: envelope.total_area,
            peak_index: envelope.peak_index as u32,
        }
    }

    fn into_envelope(self) -> Envelope {
        Envelope {
            points: self.points,
            max_value: self.max_value,
            total_area: self.total_area,
            peak_index: self.peak_index as usize,
            ..Default::default()
        }
    }
}

impl StateSnapshot {
    fn from_state(state: &ActuatorLearningState) -> Self {
        let recordings = state
            .recordings()
            .iter()
            .map(|record| RecordSnapshot {
                timestamp_ms: record.timestamp_ms,
                is_valid: record.is_valid,
                channels: record
                    .channels
                    .iter()
                    .map(|envelope| ChannelSnapshot {
                        shape: ShapeSnapshot::from_envelope(envelope),
                        timestamp_ms: envelope.timestamp_ms,
                        trigger_channel: envelope.trigger_channel.clone(),
                    })
                    .collect(),
            })
            .collect();
        let reference = state
            .reference()
            .map(|r| r.channels.iter().map(ShapeSnapshot::from_envelope).collect());

        Self {
            failed_count: state.failed_count(),
            recordings,
            reference,
        }
    }

    /// Todos los registros y la referencia deben tener `channel_count` canales
    fn into_state(self, channel_count: usize) -> Result<ActuatorLearningState, StoreError> {
        let consistent = self
            .recordings
            .iter()
            .all(|r| r.channels.len() == channel_count)
            && self
                .reference
                .as_ref()
                .map_or(true, |r| r.len() == channel_count);
        if !consistent {
            return Err(StoreError::Corrupt(
                "channel count differs from header".to_string(),
            ));
        }

        let recordings = self
            .recordings
            .into_iter()
            .map(|record| DispensingRecord {
                channels: record
                    .channels
                    .into_iter()
                    .map(|channel| {
                        let mut envelope = channel.shape.into_envelope();
                        envelope.timestamp_ms = channel.timestamp_ms;
                        envelope.trigger_channel = channel.trigger_channel;
                        envelope
                    })
                    .collect(),
                is_valid: record.is_valid,
                timestamp_ms: record.timestamp_ms,
            })
            .collect();
        let reference = self.reference.map(|channels| ReferencePattern {
            channels: channels.into_iter().map(ShapeSnapshot::into_envelope).collect(),
        });

        Ok(ActuatorLearningState::restore(
            recordings,
            reference,
            self.failed_count,
        ))
    }
}

/// Persistencia binaria por dispensador: un archivo `actuator<N>_progress.dat`
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, actuator: usize) -> PathBuf {
        self.dir.join(format!("actuator{}_progress.dat", actuator))
    }

    /// Escribe a un temporal del mismo directorio y lo renombra encima.
    /// Si algo falla, el temporal se borra al soltarlo.
    pub fn save(&self, actuator: usize, state: &ActuatorLearningState) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut w = BufWriter::new(&mut tmp);
            encode_state(&mut w, state)?;
            w.flush()?;
        }
        tmp.persist(self.path_for(actuator))
            .map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    /// Lee el estado. Un archivo inexistente no es error: `Ok(None)`.
    pub fn load(
        &self,
        actuator: usize,
        channel_count: usize,
    ) -> Result<Option<ActuatorLearningState>, StoreError> {
        let path = self.path_for(actuator);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut r = BufReader::new(file);
        decode_state(&mut r, channel_count).map(Some).map_err(|e| match e {
            StoreError::Truncated { .. } => StoreError::Truncated { path: path.clone() },
            StoreError::BadMagic { .. } => StoreError::BadMagic { path: path.clone() },
            other => other,
        })
    }

    /// Borra el archivo del dispensador (no existir no es error)
    pub fn remove(&self, actuator: usize) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(actuator)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, actuator: usize) -> bool {
        self.path_for(actuator).exists()
    }
}

// ========== Codificación ==========

pub fn encode_state<W: Write>(w: &mut W, state: &ActuatorLearningState) -> Result<(), StoreError> {
    let channel_count = state
        .recordings()
        .first()
        .map(|r| r.channels.len())
        .or_else(|| state.reference().map(|r| r.channels.len()))
        .unwrap_or(0);
    let header = FileHeader {
        magic: MAGIC,
        version: FORMAT_VERSION,
        channel_count: u16::try_from(channel_count)
            .map_err(|_| StoreError::Corrupt(format!("{} channels", channel_count)))?,
    };

    codec().serialize_into(&mut *w, &header)?;
    codec().serialize_into(&mut *w, &StateSnapshot::from_state(state))?;
    Ok(())
}

pub fn decode_state<R: Read>(
    r: &mut R,
    expected_channels: usize,
) -> Result<ActuatorLearningState, StoreError> {
    let header: FileHeader = codec().deserialize_from(&mut *r)?;
    if header.magic != MAGIC {
        return Err(StoreError::BadMagic {
            path: PathBuf::new(),
        });
    }
    if header.version != FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: header.version,
        });
    }

    let snapshot: StateSnapshot = codec().deserialize_from(&mut *r)?;
    let channel_count = header.channel_count as usize;

    // Un estado vacío se guarda con 0 canales
    let stores_channels = !snapshot.recordings.is_empty() || snapshot.reference.is_some();
    if stores_channels && channel_count != expected_channels {
        return Err(StoreError::ChannelMismatch {
            expected: expected_channels,
            found: channel_count,
        });
    }

    snapshot.into_state(channel_count)
}
