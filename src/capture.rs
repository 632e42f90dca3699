//! Tarea de captura de una caída: se arma antes de mover el servo, espera el
//! disparo del piezo, muestrea todos los canales y entrega el veredicto.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::drop_analyzer::{DropAnalyzer, Verdict};
use crate::sensor::{SensorBank, SensorError, SharedSensors};
use crate::signal::{signal, ReleaseOnDrop, SignalRelease, SignalWait};
use crate::telemetry::{GraphMessage, LogSink};
use crate::tuning::Tuning;
use crate::types::{SampleWindow, DEFAULT_TRIGGER_THRESHOLD};

/// Reserva inicial por canal; el resto crece bajo demanda
const PREALLOC_SAMPLES: usize = 4096;

/// Parámetros de temporización de la captura
#[derive(Debug, Clone)]
pub struct CaptureParams {
    /// Valor ADC que hay que superar para disparar (default: 50)
    pub trigger_threshold: i32,
    /// Tiempo máximo esperando el disparo (default: 1000 ms)
    pub timeout: Duration,
    /// Duración mínima de la tarea, también con disparo inmediato (default: 800 ms)
    pub min_window: Duration,
    /// Pausa entre barridos de los canales (default: 1 ms)
    pub poll_interval: Duration,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            trigger_threshold: DEFAULT_TRIGGER_THRESHOLD,
            timeout: Duration::from_millis(1000),
            min_window: Duration::from_millis(800),
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Estados de la máquina de estados de captura
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Creada, sin sensores todavía
    Idle,
    /// Sensores tomados, esperando disparo
    Armed,
    /// Disparo detectado, leyendo la ventana completa
    Sampling,
    /// Ventana capturada y analizada
    Completed,
    /// Sin disparo dentro del plazo (o lectura fallida)
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    pub channel: usize,
    pub label: String,
    pub value: i32,
}

/// Resultado que entrega la tarea al terminar
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub state: CaptureState,
    pub trigger: Option<TriggerInfo>,
    /// `None` si no hubo disparo o el análisis falló
    pub verdict: Option<Verdict>,
    pub elapsed: Duration,
}

impl CaptureOutcome {
    pub fn completed(trigger: TriggerInfo, verdict: Option<Verdict>, elapsed: Duration) -> Self {
        Self {
            state: CaptureState::Completed,
            trigger: Some(trigger),
            verdict,
            elapsed,
        }
    }

    pub fn timed_out(elapsed: Duration) -> Self {
        Self {
            state: CaptureState::TimedOut,
            trigger: None,
            verdict: None,
            elapsed,
        }
    }

    pub fn triggered(&self) -> bool {
        self.state == CaptureState::Completed && self.trigger.is_some()
    }
}

/// Lo que el orquestador ve de una captura en marcha
pub struct CaptureHandle {
    ready: SignalWait,
    finished: SignalWait,
    join: JoinHandle<CaptureOutcome>,
}

impl CaptureHandle {
    pub fn new(ready: SignalWait, finished: SignalWait, join: JoinHandle<CaptureOutcome>) -> Self {
        Self {
            ready,
            finished,
            join,
        }
    }

    /// `false` si la tarea murió antes de armarse
    pub fn wait_ready(&self) -> bool {
        self.ready.wait().is_ok()
    }

    pub fn wait_finished(&self) -> bool {
        self.finished.wait().is_ok()
    }

    /// Un pánico en la tarea cuenta como captura sin disparo
    pub fn join(self) -> CaptureOutcome {
        self.join
            .join()
            .unwrap_or_else(|_| CaptureOutcome::timed_out(Duration::ZERO))
    }
}

/// Fuente de capturas: el orquestador pide una por intento
pub trait CaptureSource: Send + Sync {
    fn begin(&self, actuator: usize) -> CaptureHandle;
}

/// Capturas reales sobre los sensores piezo compartidos
pub struct SensorCaptureSource {
    sensors: SharedSensors,
    analyzer: Arc<Mutex<DropAnalyzer>>,
    tuning: Arc<Tuning>,
    params: CaptureParams,
    sink: Arc<dyn LogSink>,
}

impl SensorCaptureSource {
    pub fn new(
        sensors: SharedSensors,
        analyzer: Arc<Mutex<DropAnalyzer>>,
        tuning: Arc<Tuning>,
        params: CaptureParams,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            sensors,
            analyzer,
            tuning,
            params,
            sink,
        }
    }
}

impl CaptureSource for SensorCaptureSource {
    fn begin(&self, actuator: usize) -> CaptureHandle {
        let labels = lock(&self.analyzer).channel_labels().to_vec();
        let task = CaptureTask {
            actuator,
            labels,
            params: self.params.clone(),
            state: CaptureState::Idle,
            sensors: self.sensors.clone(),
            analyzer: self.analyzer.clone(),
            tuning: self.tuning.clone(),
            sink: self.sink.clone(),
        };
        task.spawn()
    }
}

/// Una captura individual; vive en su propio hilo
pub struct CaptureTask {
    actuator: usize,
    labels: Vec<String>,
    params: CaptureParams,
    state: CaptureState,
    sensors: SharedSensors,
    analyzer: Arc<Mutex<DropAnalyzer>>,
    tuning: Arc<Tuning>,
    sink: Arc<dyn LogSink>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CaptureTask {
    pub fn spawn(self) -> CaptureHandle {
        let (ready_tx, ready_rx) = signal();
        let (finished_tx, finished_rx) = signal();
        let join = thread::spawn(move || {
            let mut task = self;
            task.run(ready_tx, finished_tx)
        });
        CaptureHandle::new(ready_rx, finished_rx, join)
    }

    fn enter(&mut self, next: CaptureState) {
        debug!(actuator = self.actuator + 1, from = ?self.state, to = ?next, "captura");
        self.state = next;
    }

    fn run(&mut self, ready: SignalRelease, finished: SignalRelease) -> CaptureOutcome {
        let _finished = ReleaseOnDrop(finished);
        let started = Instant::now();

        let sensors_arc = self.sensors.clone();
        let mut sensors = lock(&sensors_arc);
        self.enter(CaptureState::Armed);
        ready.release();

        let windows = match self.wait_trigger(&mut **sensors, started) {
            Ok(Some(trigger)) => {
                self.enter(CaptureState::Sampling);
                match self.sample(&mut **sensors, &trigger) {
                    Ok(windows) => Some((trigger, windows)),
                    Err(e) => {
                        self.log(format!("[PIEZO] Error leyendo la ventana: {}", e));
                        None
                    }
                }
            }
            Ok(None) => {
                self.log(format!(
                    "[PIEZO] Sin caída en dispensador {} tras {} ms",
                    self.actuator + 1,
                    self.params.timeout.as_millis()
                ));
                None
            }
            Err(e) => {
                self.log(format!("[PIEZO] Error de sensor: {}", e));
                None
            }
        };
        drop(sensors);

        match windows {
            Some((trigger, windows)) => {
                let verdict = self.analyze(&trigger, &windows);
                self.enter(CaptureState::Completed);
                self.pad_min_window(started);
                CaptureOutcome::completed(trigger, verdict, started.elapsed())
            }
            None => {
                self.enter(CaptureState::TimedOut);
                self.pad_min_window(started);
                CaptureOutcome::timed_out(started.elapsed())
            }
        }
    }

    /// Barre todos los canales hasta que uno supere el umbral o venza el plazo
    fn wait_trigger(
        &self,
        sensors: &mut dyn SensorBank,
        started: Instant,
    ) -> Result<Option<TriggerInfo>, SensorError> {
        let channels = self.labels.len().min(sensors.channel_count());
        loop {
            for channel in 0..channels {
                let value = sensors.read(channel)?;
                if value > self.params.trigger_threshold {
                    return Ok(Some(TriggerInfo {
                        channel,
                        label: self.labels[channel].clone(),
                        value,
                    }));
                }
            }

            if started.elapsed() >= self.params.timeout {
                return Ok(None);
            }
            if !self.params.poll_interval.is_zero() {
                thread::sleep(self.params.poll_interval);
            }
        }
    }

    /// El valor de disparo abre su canal; después N lecturas de cada canal en ronda
    fn sample(
        &self,
        sensors: &mut dyn SensorBank,
        trigger: &TriggerInfo,
    ) -> Result<Vec<SampleWindow>, SensorError> {
        let count = self.tuning.measurement_count();
        let channels = self.labels.len();
        let mut windows: Vec<SampleWindow> =
            vec![Vec::with_capacity(count.min(PREALLOC_SAMPLES) + 1); channels];
        windows[trigger.channel].push(trigger.value);

        for _ in 0..count {
            for (channel, window) in windows.iter_mut().enumerate() {
                window.push(sensors.read(channel)?);
            }
        }
        Ok(windows)
    }

    fn analyze(&self, trigger: &TriggerInfo, windows: &[SampleWindow]) -> Option<Verdict> {
        self.log(format!(
            "[PIEZO] Disparo en {} (valor {}), {} muestras por canal",
            trigger.label,
            trigger.value,
            self.tuning.measurement_count()
        ));
        self.sink
            .graph(&GraphMessage::new(&trigger.label, &self.labels, windows));

        let result = lock(&self.analyzer).analyze_windows(self.actuator, windows, &trigger.label);
        match result {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                self.log(format!("[PATTERN] Análisis descartado: {}", e));
                None
            }
        }
    }

    fn pad_min_window(&self, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed < self.params.min_window {
            thread::sleep(self.params.min_window - elapsed);
        }
    }

    fn log(&self, line: String) {
        self.sink.log_line(&line);
    }
}
