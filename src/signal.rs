//! Señal de finalización de un solo hueco (semáforo binario sin carga).
//! Liberar dos veces deja un único permiso; recibir lo consume.

use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;

/// El lado que libera desapareció sin liberar (tarea caída)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("signal abandoned before release")]
pub struct SignalAbandoned;

#[derive(Debug)]
pub struct SignalRelease {
    tx: Sender<()>,
}

#[derive(Debug)]
pub struct SignalWait {
    rx: Receiver<()>,
}

pub fn signal() -> (SignalRelease, SignalWait) {
    let (tx, rx) = bounded(1);
    (SignalRelease { tx }, SignalWait { rx })
}

impl SignalRelease {
    /// Despierta como mucho a un esperador
    pub fn release(&self) {
        let _ = self.tx.try_send(());
    }
}

impl SignalWait {
    /// Bloquea hasta recibir el permiso
    pub fn wait(&self) -> Result<(), SignalAbandoned> {
        self.rx.recv().map_err(|_| SignalAbandoned)
    }
}

/// Libera la señal al salir de ámbito, también en un pánico
#[derive(Debug)]
pub struct ReleaseOnDrop(pub SignalRelease);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}
