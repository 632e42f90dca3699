/*
Verificación de dispensado en tiempo real - hardware simulado

Daemon de demostración:
1. Carga la configuración (JSON opcional como primer argumento)
2. Monta sensores piezo y servos simulados del tamaño configurado
3. Lee comandos de stdin y los ejecuta sobre el Dispenser

Para ejecutar:
    RUST_LOG=dropsense=debug ./target/release/dropsense dispenser.json

Los números de dispensador en los comandos empiezan en 1.
*/

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, select, Receiver};
use rand::Rng;
use std::env;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use dropsense::actuator::{Actuator, SimulatedActuator};
use dropsense::config::DispenserConfig;
use dropsense::dispenser::{Dispenser, ResetTarget};
use dropsense::drop_analyzer::Verdict;
use dropsense::sensor::{shared, DropProfile, DropTrigger, SimulatedSensorBank};
use dropsense::telemetry::TracingSink;
use dropsense::tuning::ThresholdKind;

const SERVO_SETTLE: Duration = Duration::from_millis(500);
const NOISE_FLOOR: i32 = 12;
const PILLS_PER_BOTTLE: u32 = 30;
/// Probabilidad de que un movimiento a dispensado suelte una pastilla
const DROP_PROBABILITY: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Dispense { index: usize, attempts: Option<u32> },
    Reset,
    Test,
    Measurements(usize),
    Attempts(u32),
    Thresholds,
    Threshold(ThresholdKind, f32),
    Forget(ResetTarget),
    Report(usize),
    Refill { index: usize, pills: u32 },
    Help,
    Quit,
}

/// Convierte un número de dispensador (base 1) en índice
fn parse_index(arg: Option<&str>) -> Result<usize> {
    let arg = arg.ok_or_else(|| anyhow!("Falta el número de dispensador"))?;
    let number: usize = arg
        .parse()
        .with_context(|| format!("Número de dispensador inválido: {}", arg))?;
    if number == 0 {
        bail!("Los dispensadores se numeran desde 1");
    }
    Ok(number - 1)
}

fn parse_value<T: std::str::FromStr>(arg: Option<&str>, what: &str) -> Result<T> {
    let arg = arg.ok_or_else(|| anyhow!("Falta {}", what))?;
    arg.parse()
        .map_err(|_| anyhow!("Valor inválido para {}: {}", what, arg))
}

fn parse_command(line: &str) -> Result<Command> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or("").to_lowercase();

    let command = match verb.as_str() {
        "dispense" | "fast" => Command::Dispense {
            index: parse_index(parts.next())?,
            attempts: match parts.next() {
                Some(n) => Some(parse_value(Some(n), "intentos")?),
                None => None,
            },
        },
        "reset" => Command::Reset,
        "test" => Command::Test,
        "measurements" => Command::Measurements(parse_value(parts.next(), "muestras")?),
        "attempts" => Command::Attempts(parse_value(parts.next(), "intentos")?),
        "thresholds" => Command::Thresholds,
        "threshold" => {
            let kind = parts
                .next()
                .ok_or_else(|| anyhow!("Falta el tipo de umbral (avg|channel)"))?
                .parse::<ThresholdKind>()?;
            Command::Threshold(kind, parse_value(parts.next(), "umbral")?)
        }
        "forget" => match parts.next() {
            Some(arg) if arg.eq_ignore_ascii_case("all") => Command::Forget(ResetTarget::All),
            arg => Command::Forget(ResetTarget::One(parse_index(arg)?)),
        },
        "report" => Command::Report(parse_index(parts.next())?),
        "refill" => Command::Refill {
            index: parse_index(parts.next())?,
            pills: parse_value(parts.next(), "pastillas")?,
        },
        "help" | "" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("Comando desconocido: {}", other),
    };
    Ok(command)
}

fn print_help() {
    println!("Comandos:");
    println!("  dispense <n> [intentos]      → dispensa desde el dispensador n");
    println!("  reset                        → servos a posición de reinicio");
    println!("  test                         → contador de movimientos a cero");
    println!("  measurements <n>             → muestras por captura");
    println!("  attempts <n>                 → intentos por defecto");
    println!("  thresholds                   → muestra los umbrales");
    println!("  threshold <avg|channel> <v>  → cambia un umbral (0.0-1.0)");
    println!("  forget <n|all>               → borra el aprendizaje");
    println!("  report <n>                   → informe de análisis");
    println!("  refill <n> <pastillas>       → rellena el frasco simulado");
    println!("  quit");
}

/// Servos simulados: cada movimiento a dispensado puede soltar una pastilla
fn simulated_servos(
    config: &DispenserConfig,
    trigger: &DropTrigger,
    bottles: &[Arc<AtomicU32>],
) -> Vec<Box<dyn Actuator>> {
    let channels = config.channels.len();
    let dispense_angle = config.dispense_angle;

    bottles
        .iter()
        .enumerate()
        .map(|(i, bottle)| {
            let mut servo = SimulatedActuator::new(SERVO_SETTLE);
            let trigger = trigger.clone();
            let bottle = Arc::clone(bottle);
            servo.set_callback(move |angle| {
                if angle != dispense_angle {
                    return;
                }
                let mut rng = rand::thread_rng();
                let has_pill = bottle
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if has_pill && rng.gen_bool(DROP_PROBABILITY) {
                    let mut profile = DropProfile::single_pill(channels);
                    // Cada caída es algo distinta
                    for amp in profile.amplitudes.iter_mut() {
                        *amp *= rng.gen_range(0.85f32..1.15);
                    }
                    profile.delay = Duration::from_millis(rng.gen_range(40..120));
                    trigger.schedule(profile);
                } else if has_pill {
                    // La pastilla se quedó atascada
                    bottle.fetch_add(1, Ordering::SeqCst);
                }
            });
            Box::new(servo) as Box<dyn Actuator>
        })
        .collect()
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = bounded::<String>(16);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("❌ Error leyendo stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

fn execute(dispenser: &Dispenser, bottles: &[Arc<AtomicU32>], command: Command) -> bool {
    match command {
        Command::Dispense { index, attempts } => match dispenser.dispense(index, attempts) {
            Ok(report) if report.success => {
                let verdict = match &report.verdict {
                    Some(Verdict::Learning { collected, capacity }) => {
                        format!("aprendiendo {}/{}", collected, capacity)
                    }
                    Some(Verdict::Normal(c)) => format!("normal (media {:.2})", c.avg_similarity),
                    Some(Verdict::Anomalous(c)) => {
                        format!("⚠️  ANÓMALA (media {:.2})", c.avg_similarity)
                    }
                    Some(Verdict::Unscored) => "sin referencia".to_string(),
                    None => "sin análisis".to_string(),
                };
                println!(
                    "✅ Dispensador {}: pastilla en el intento {} ({} movimientos) - {}",
                    index + 1,
                    report.attempts,
                    report.moves,
                    verdict
                );
            }
            Ok(report) => println!(
                "❌ Dispensador {}: sin caída tras {} intentos, ¿frasco vacío?",
                index + 1,
                report.attempts
            ),
            Err(e) => eprintln!("❌ {}", e),
        },
        Command::Reset => {
            if let Err(e) = dispenser.reset_actuators() {
                eprintln!("❌ {}", e);
            }
        }
        Command::Test => dispenser.reset_attempt_counter(),
        Command::Measurements(n) => {
            if let Err(e) = dispenser.set_measurement_count(n) {
                eprintln!("❌ {}", e);
            }
        }
        Command::Attempts(n) => {
            if let Err(e) = dispenser.set_default_max_attempts(n) {
                eprintln!("❌ {}", e);
            }
        }
        Command::Thresholds => {
            let t = dispenser.thresholds();
            println!(
                "🎚️  Umbral medio: {:.2} | Umbral por canal: {:.2} | Movimientos: {}",
                t.avg_threshold,
                t.channel_threshold,
                dispenser.attempt_counter()
            );
        }
        Command::Threshold(kind, value) => {
            if let Err(e) = dispenser.set_threshold(kind, value) {
                eprintln!("❌ {}", e);
            }
        }
        Command::Forget(target) => {
            if let Err(e) = dispenser.reset_learning_data(target) {
                eprintln!("❌ {}", e);
            }
        }
        Command::Report(index) => print!("{}", dispenser.analysis_report(index)),
        Command::Refill { index, pills } => match bottles.get(index) {
            Some(bottle) => {
                bottle.store(pills, Ordering::SeqCst);
                println!("💊 Dispensador {}: {} pastillas", index + 1, pills);
            }
            None => eprintln!("❌ Dispensador inválido: {}", index + 1),
        },
        Command::Help => print_help(),
        Command::Quit => return false,
    }
    true
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "dropsense=info".into()),
        )
        .init();

    println!("💊 DropSense - verificación de dispensado por vibración\n");

    let args: Vec<String> = env::args().collect();
    let config = match args.get(1) {
        Some(path) => {
            println!("🔧 Configuración: {}", path);
            DispenserConfig::load(path)
                .with_context(|| format!("No se pudo cargar la configuración {}", path))?
        }
        None => {
            println!("🔧 Configuración por defecto");
            DispenserConfig::default()
        }
    };

    let sensors = SimulatedSensorBank::new(config.channels.len(), NOISE_FLOOR);
    let trigger = sensors.trigger();
    let bottles: Vec<Arc<AtomicU32>> = (0..config.actuator_count)
        .map(|_| Arc::new(AtomicU32::new(PILLS_PER_BOTTLE)))
        .collect();
    let servos = simulated_servos(&config, &trigger, &bottles);

    let dispenser = Dispenser::from_hardware(&config, shared(sensors), servos, Arc::new(TracingSink))
        .context("La configuración no coincide con el hardware")?;

    println!(
        "✅ {} dispensadores, canales: {}",
        dispenser.actuator_count(),
        config.channels.join(", ")
    );
    println!("📂 Modelos en {}\n", config.model_dir.display());
    print_help();

    let commands = spawn_stdin_reader();
    loop {
        select! {
            recv(commands) -> msg => {
                let Ok(line) = msg else {
                    println!("\n👋 stdin cerrado");
                    break;
                };
                match parse_command(&line) {
                    Ok(command) => {
                        if !execute(&dispenser, &bottles, command) {
                            break;
                        }
                    }
                    Err(e) => eprintln!("❌ {}", e),
                }
            }
        }
    }

    dispenser
        .shared_analyzer()
        .lock()
        .map_err(|_| anyhow!("Analizador envenenado"))?
        .save_all();
    println!("💾 Progreso guardado");
    Ok(())
}
