use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use dropsense::capture::{CaptureOutcome, CaptureParams, CaptureSource, SensorCaptureSource};
use dropsense::csv_loader::load_capture_from_csv;
use dropsense::drop_analyzer::{AnalyzerParams, DropAnalyzer, Verdict};
use dropsense::model_store::ModelStore;
use dropsense::sensor::{shared, ReplaySensorBank};
use dropsense::telemetry::{LogSink, TracingSink};
use dropsense::tuning::Tuning;

const USAGE: &str = "Uso: replay_capture [--model-dir <dir>] [--actuator <n>] \
                     [--channels GREEN,BLUE] [--trigger <adc>] [--measurements <n>] \
                     <captura.csv>...";

/// Plazo de disparo por archivo; tras el último dato la reproducción queda a cero
const REPLAY_TIMEOUT: Duration = Duration::from_millis(200);

struct ReplayOptions {
    model_dir: Option<PathBuf>,
    /// Índice base 0
    actuator: usize,
    channels: Vec<String>,
    trigger_threshold: i32,
    /// `None`: toda la captura a partir del disparo
    measurements: Option<usize>,
    captures: Vec<PathBuf>,
}

fn parse_args() -> Result<ReplayOptions> {
    let mut opts = ReplayOptions {
        model_dir: None,
        actuator: 0,
        channels: AnalyzerParams::default().channel_labels,
        trigger_threshold: CaptureParams::default().trigger_threshold,
        measurements: None,
        captures: Vec::new(),
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--model-dir" => {
                let dir = args.next().ok_or_else(|| anyhow!("--model-dir necesita un valor"))?;
                opts.model_dir = Some(PathBuf::from(dir));
            }
            "--actuator" => {
                let n: usize = args
                    .next()
                    .ok_or_else(|| anyhow!("--actuator necesita un valor"))?
                    .parse()
                    .context("--actuator debe ser un número")?;
                if n == 0 {
                    bail!("Los dispensadores se numeran desde 1");
                }
                opts.actuator = n - 1;
            }
            "--channels" => {
                let list = args.next().ok_or_else(|| anyhow!("--channels necesita un valor"))?;
                opts.channels = list.split(',').map(|s| s.trim().to_string()).collect();
            }
            "--trigger" => {
                opts.trigger_threshold = args
                    .next()
                    .ok_or_else(|| anyhow!("--trigger necesita un valor"))?
                    .parse()
                    .context("--trigger debe ser un valor ADC")?;
            }
            "--measurements" => {
                let n: usize = args
                    .next()
                    .ok_or_else(|| anyhow!("--measurements necesita un valor"))?
                    .parse()
                    .context("--measurements debe ser un número")?;
                opts.measurements = Some(n);
            }
            flag if flag.starts_with("--") => bail!("Opción desconocida {}\n{}", flag, USAGE),
            _ => opts.captures.push(PathBuf::from(arg)),
        }
    }

    if opts.captures.is_empty() {
        bail!("Debes especificar al menos un archivo CSV\n{}", USAGE);
    }
    Ok(opts)
}

fn describe(verdict: &Verdict) -> String {
    match verdict {
        Verdict::Learning {
            collected,
            capacity,
        } => format!("📚 Aprendiendo ({}/{})", collected, capacity),
        Verdict::Normal(c) => format!(
            "✅ Normal (media {:.3}, mejor canal {} = {:.3})",
            c.avg_similarity, c.best_channel, c.max_similarity
        ),
        Verdict::Anomalous(c) => format!(
            "⚠️  Anómala (media {:.3}, mejor canal {} = {:.3})",
            c.avg_similarity, c.best_channel, c.max_similarity
        ),
        Verdict::Unscored => "❔ Sin referencia (consenso insuficiente)".to_string(),
    }
}

fn describe_outcome(outcome: &CaptureOutcome) -> String {
    match (&outcome.trigger, &outcome.verdict) {
        (Some(trigger), Some(verdict)) => format!(
            "{} [disparo en {} = {}]",
            describe(verdict),
            trigger.label,
            trigger.value
        ),
        (Some(trigger), None) => format!("🚫 Análisis descartado [disparo en {}]", trigger.label),
        (None, _) => "🔇 Ningún canal supera el umbral de disparo".to_string(),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dropsense=warn".into()),
        )
        .init();

    let opts = parse_args()?;

    // Sin --model-dir se aprende en un directorio temporal desechable
    let scratch;
    let model_dir = match &opts.model_dir {
        Some(dir) => dir.clone(),
        None => {
            scratch = tempfile::tempdir().context("No se pudo crear el directorio temporal")?;
            scratch.path().to_path_buf()
        }
    };

    let params = AnalyzerParams {
        actuator_count: opts.actuator + 1,
        channel_labels: opts.channels.clone(),
        ..AnalyzerParams::default()
    };
    let tuning = Arc::new(Tuning::default());
    let sink: Arc<dyn LogSink> = Arc::new(TracingSink);
    let analyzer = Arc::new(Mutex::new(DropAnalyzer::new(
        params,
        tuning.clone(),
        ModelStore::new(&model_dir),
        sink.clone(),
    )));
    let capture_params = CaptureParams {
        trigger_threshold: opts.trigger_threshold,
        timeout: REPLAY_TIMEOUT,
        min_window: Duration::ZERO,
        poll_interval: Duration::ZERO,
    };

    println!(
        "🎞️  Reproduciendo {} capturas en el dispensador {} (modelos en {})\n",
        opts.captures.len(),
        opts.actuator + 1,
        model_dir.display()
    );

    for path in &opts.captures {
        let windows = load_capture_from_csv(path, opts.channels.len())?;
        // La muestra de disparo abre la ventana; el resto son lecturas en ronda
        let longest = windows.iter().map(Vec::len).max().unwrap_or(0);
        let count = opts.measurements.unwrap_or(longest.saturating_sub(1).max(1));
        tuning
            .set_measurement_count(count)
            .with_context(|| format!("Número de muestras inválido para {:?}", path))?;

        let source = SensorCaptureSource::new(
            shared(ReplaySensorBank::new(windows)),
            analyzer.clone(),
            tuning.clone(),
            capture_params.clone(),
            sink.clone(),
        );
        let outcome = source.begin(opts.actuator).join();
        println!("{:?}: {}", path, describe_outcome(&outcome));
    }

    println!();
    let analyzer = analyzer
        .lock()
        .map_err(|_| anyhow!("El analizador quedó envenenado"))?;
    print!("{}", analyzer.analysis_report(opts.actuator));
    Ok(())
}
