//! Dispensado con verificación: por cada intento arma una captura, mueve el
//! servo cuando la captura está lista y espera su resultado.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;

use crate::actuator::{ActuatorBank, ActuatorError};
use crate::capture::CaptureSource;
use crate::drop_analyzer::Verdict;
use crate::telemetry::LogSink;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispenseError {
    #[error("Invalid actuator index {index} (have {count})")]
    InvalidActuator { index: usize, count: usize },

    #[error("Max attempts must be at least 1")]
    NoAttempts,

    #[error("Dispenser busy: lock not acquired within {0:?}")]
    Busy(Duration),

    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispenseReport {
    pub actuator: usize,
    pub success: bool,
    /// Intentos consumidos (el del éxito incluido)
    pub attempts: u32,
    /// Movimientos de servo durante esta operación
    pub moves: u32,
    /// Veredicto de la caída que confirmó el éxito
    pub verdict: Option<Verdict>,
}

/// Cerrojo de dispensado: un testigo en un canal de un hueco, con plazo de espera
struct DispenseLock {
    tx: Sender<()>,
    rx: Receiver<()>,
}

struct DispenseGuard<'a> {
    tx: &'a Sender<()>,
}

impl DispenseLock {
    fn new() -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.try_send(());
        Self { tx, rx }
    }

    fn acquire(&self, timeout: Duration) -> Option<DispenseGuard<'_>> {
        self.rx
            .recv_timeout(timeout)
            .ok()
            .map(|()| DispenseGuard { tx: &self.tx })
    }
}

impl Drop for DispenseGuard<'_> {
    fn drop(&mut self) {
        let _ = self.tx.try_send(());
    }
}

pub struct DispenseOrchestrator {
    capture: Box<dyn CaptureSource>,
    actuators: Mutex<ActuatorBank>,
    lock: DispenseLock,
    lock_timeout: Duration,
    sink: Arc<dyn LogSink>,
}

impl DispenseOrchestrator {
    pub fn new(
        capture: Box<dyn CaptureSource>,
        actuators: ActuatorBank,
        lock_timeout: Duration,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            capture,
            actuators: Mutex::new(actuators),
            lock: DispenseLock::new(),
            lock_timeout,
            sink,
        }
    }

    fn bank(&self) -> MutexGuard<'_, ActuatorBank> {
        self.actuators.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn actuator_count(&self) -> usize {
        self.bank().len()
    }

    pub fn move_counter(&self) -> u32 {
        self.bank().move_counter()
    }

    pub fn reset_counter(&self) {
        self.bank().reset_counter();
    }

    /// Lleva todos los servos al ángulo de reinicio sin pisar un dispensado en curso
    pub fn reset_actuators(&self) -> Result<(), DispenseError> {
        let _guard = self
            .lock
            .acquire(self.lock_timeout)
            .ok_or(DispenseError::Busy(self.lock_timeout))?;
        self.bank().reset_all()?;
        self.log("[SERVO] Servos en posición de reinicio".to_string());
        Ok(())
    }

    /// Mueve el servo hasta que una captura confirme la caída o se agoten los intentos
    pub fn dispense(&self, actuator: usize, max_attempts: u32) -> Result<DispenseReport, DispenseError> {
        let count = self.actuator_count();
        if actuator >= count {
            self.log(format!("[ERR] Dispensador inválido: {}", actuator));
            return Err(DispenseError::InvalidActuator {
                index: actuator,
                count,
            });
        }
        if max_attempts == 0 {
            return Err(DispenseError::NoAttempts);
        }

        let Some(_guard) = self.lock.acquire(self.lock_timeout) else {
            self.log(format!(
                "[ERR] Dispensador ocupado, sin cerrojo tras {} ms",
                self.lock_timeout.as_millis()
            ));
            return Err(DispenseError::Busy(self.lock_timeout));
        };

        self.log(format!(
            "[SERVO] Dispensado desde {} (máx {} intentos)",
            actuator + 1,
            max_attempts
        ));

        let mut moves = 0;
        for attempt in 1..=max_attempts {
            self.log(format!("[SERVO] Intento {}/{}", attempt, max_attempts));

            let handle = self.capture.begin(actuator);
            if !handle.wait_ready() {
                self.log("[ERR] La captura terminó antes de armarse".to_string());
                handle.join();
                continue;
            }

            let moved = self.bank().toggle(actuator);
            if moved.is_ok() {
                moves += 1;
            }

            // El cerrojo no se suelta hasta que la captura ha terminado del todo
            handle.wait_finished();
            let outcome = handle.join();

            if let Err(e) = moved {
                self.log(format!("[ERR] Fallo del servo {}: {}", actuator + 1, e));
                return Err(DispenseError::Actuator(e));
            }

            if outcome.triggered() {
                self.log(format!(
                    "[SUCCESS] Caída detectada en el intento {} ({} movimientos)",
                    attempt, moves
                ));
                return Ok(DispenseReport {
                    actuator,
                    success: true,
                    attempts: attempt,
                    moves,
                    verdict: outcome.verdict,
                });
            }
        }

        self.log(format!(
            "[FAILED] Sin caída tras {} intentos en dispensador {}",
            max_attempts,
            actuator + 1
        ));
        Ok(DispenseReport {
            actuator,
            success: false,
            attempts: max_attempts,
            moves,
            verdict: None,
        })
    }

    fn log(&self, line: String) {
        self.sink.log_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{Actuator, ActuatorAngles, SimulatedActuator};
    use crate::capture::{CaptureHandle, CaptureOutcome, TriggerInfo};
    use crate::signal::signal;
    use crate::telemetry::NullSink;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    type EventLog = Arc<Mutex<Vec<&'static str>>>;

    /// Captura de guion: dispara en el intento `trigger_on` (contando desde 1)
    struct ScriptedSource {
        trigger_on: Option<u32>,
        started: Arc<AtomicU32>,
        duration: Duration,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        events: EventLog,
    }

    impl ScriptedSource {
        fn new(trigger_on: Option<u32>, duration: Duration) -> Self {
            Self {
                trigger_on,
                started: Arc::new(AtomicU32::new(0)),
                duration,
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::new(AtomicUsize::new(0)),
                events: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl CaptureSource for ScriptedSource {
        fn begin(&self, _actuator: usize) -> CaptureHandle {
            let attempt = self.started.fetch_add(1, Ordering::SeqCst) + 1;
            let fires = self.trigger_on == Some(attempt);
            let (ready_tx, ready_rx) = signal();
            let (finished_tx, finished_rx) = signal();
            let duration = self.duration;
            let active = self.active.clone();
            let max_active = self.max_active.clone();
            let events = self.events.clone();

            let join = thread::spawn(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                events.lock().unwrap().push("ready");
                ready_tx.release();
                thread::sleep(duration);
                active.fetch_sub(1, Ordering::SeqCst);
                events.lock().unwrap().push("finished");
                finished_tx.release();

                if fires {
                    let trigger = TriggerInfo {
                        channel: 0,
                        label: "GREEN".to_string(),
                        value: 300,
                    };
                    CaptureOutcome::completed(trigger, None, duration)
                } else {
                    CaptureOutcome::timed_out(duration)
                }
            });
            CaptureHandle::new(ready_rx, finished_rx, join)
        }
    }

    fn bank(count: usize, events: Option<EventLog>) -> ActuatorBank {
        let actuators = (0..count)
            .map(|i| {
                let mut servo = SimulatedActuator::new(Duration::ZERO);
                if let Some(events) = events.clone() {
                    servo.set_callback(move |_| events.lock().unwrap().push("move"));
                }
                Box::new(servo) as Box<dyn Actuator>
            })
            .collect();
        ActuatorBank::new(actuators, ActuatorAngles::default())
    }

    fn orchestrator(source: ScriptedSource, lock_timeout: Duration) -> DispenseOrchestrator {
        let events = source.events.clone();
        DispenseOrchestrator::new(
            Box::new(source),
            bank(2, Some(events)),
            lock_timeout,
            Arc::new(NullSink),
        )
    }

    #[test]
    fn test_success_on_third_attempt() {
        let source = ScriptedSource::new(Some(3), Duration::from_millis(5));
        let started = source.started.clone();
        let orch = orchestrator(source, Duration::from_secs(5));

        let report = orch.dispense(0, 20).unwrap();
        assert!(report.success);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.moves, 3);
        assert_eq!(orch.move_counter(), 3);
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausts_attempts() {
        let source = ScriptedSource::new(None, Duration::from_millis(2));
        let orch = orchestrator(source, Duration::from_secs(5));

        let report = orch.dispense(1, 4).unwrap();
        assert!(!report.success);
        assert_eq!(report.attempts, 4);
        assert_eq!(report.moves, 4);
        assert!(report.verdict.is_none());
    }

    #[test]
    fn test_moves_only_after_ready() {
        let source = ScriptedSource::new(Some(2), Duration::from_millis(5));
        let events = source.events.clone();
        let orch = orchestrator(source, Duration::from_secs(5));
        orch.dispense(0, 5).unwrap();

        let events = events.lock().unwrap().clone();
        let readies = events.iter().filter(|e| **e == "ready").count();
        let moves = events.iter().filter(|e| **e == "move").count();
        assert_eq!((readies, moves), (2, 2));

        // Cada movimiento va precedido por un "ready" no consumido
        let mut pending_ready = 0;
        for event in events {
            match event {
                "ready" => pending_ready += 1,
                "move" => {
                    assert!(pending_ready > 0, "servo movido antes de armar la captura");
                    pending_ready -= 1;
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_invalid_actuator_and_zero_attempts() {
        let orch = orchestrator(ScriptedSource::new(Some(1), Duration::ZERO), Duration::from_secs(1));
        assert_eq!(
            orch.dispense(2, 3),
            Err(DispenseError::InvalidActuator { index: 2, count: 2 })
        );
        assert_eq!(orch.dispense(0, 0), Err(DispenseError::NoAttempts));
        assert_eq!(orch.move_counter(), 0);
    }

    #[test]
    fn test_concurrent_dispenses_are_serialized() {
        let source = ScriptedSource::new(None, Duration::from_millis(10));
        let max_active = source.max_active.clone();
        let orch = Arc::new(orchestrator(source, Duration::from_secs(5)));

        let workers: Vec<_> = (0..2)
            .map(|i| {
                let orch = orch.clone();
                thread::spawn(move || orch.dispense(i, 3))
            })
            .collect();
        for worker in workers {
            let report = worker.join().unwrap().unwrap();
            assert_eq!(report.attempts, 3);
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(orch.move_counter(), 6);
    }

    #[test]
    fn test_busy_when_lock_times_out() {
        let source = ScriptedSource::new(None, Duration::from_millis(200));
        let orch = Arc::new(orchestrator(source, Duration::from_millis(20)));

        let long = {
            let orch = orch.clone();
            thread::spawn(move || orch.dispense(0, 1))
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let err = orch.dispense(1, 1).unwrap_err();
        assert_eq!(err, DispenseError::Busy(Duration::from_millis(20)));
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(long.join().unwrap().is_ok());
    }

    #[test]
    fn test_reset_actuators_and_counter() {
        let orch = orchestrator(ScriptedSource::new(Some(1), Duration::ZERO), Duration::from_secs(1));
        orch.dispense(0, 1).unwrap();
        assert_eq!(orch.move_counter(), 1);
        orch.reset_actuators().unwrap();
        orch.reset_counter();
        assert_eq!(orch.move_counter(), 0);
        assert_eq!(orch.bank().position(1), Some(180));
    }
}
