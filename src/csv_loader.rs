use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use csv::ReaderBuilder;

use crate::types::SampleWindow;

/// Carga una captura en formato `sample,channel,value` (con cabecera) y
/// devuelve una ventana por canal. `channel` es el índice base 0.
pub fn load_capture_from_csv(path: impl AsRef<Path>, channels: usize) -> Result<Vec<SampleWindow>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("No se pudo abrir el CSV {:?}", path))?;
    load_capture(file, channels).with_context(|| format!("CSV inválido: {:?}", path))
}

pub fn load_capture<R: Read>(source: R, channels: usize) -> Result<Vec<SampleWindow>> {
    ensure!(channels > 0, "Se necesita al menos un canal");

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(source);

    let mut samples: Vec<BTreeMap<usize, i32>> = vec![BTreeMap::new(); channels];

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Fila {} inválida", row_idx + 1))?;
        if record.len() < 3 {
            bail!("La fila {} no tiene 3 columnas", row_idx + 1);
        }

        let sample: usize = record[0]
            .parse()
            .with_context(|| format!("sample inválido en fila {}", row_idx + 1))?;
        let channel: usize = record[1]
            .parse()
            .with_context(|| format!("channel inválido en fila {}", row_idx + 1))?;
        let value: i32 = record[2]
            .parse()
            .with_context(|| format!("value inválido en fila {}", row_idx + 1))?;

        if channel >= channels {
            bail!("Canal {} fuera de rango (fila {})", channel, row_idx + 1);
        }
        samples[channel].insert(sample, value);
    }

    ensure!(
        samples.iter().any(|s| !s.is_empty()),
        "La captura no contiene datos"
    );

    Ok(samples.into_iter().map(fill_gaps).collect())
}

/// Los huecos repiten la última muestra válida; un canal vacío queda vacío
fn fill_gaps(samples: BTreeMap<usize, i32>) -> SampleWindow {
    let Some(&max_sample) = samples.keys().next_back() else {
        return Vec::new();
    };

    let mut window = Vec::with_capacity(max_sample + 1);
    let mut last = 0;
    for sample in 0..=max_sample {
        if let Some(&value) = samples.get(&sample) {
            last = value;
        }
        window.push(last);
    }
    window
}
