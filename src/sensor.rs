use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("Sensor channel {channel} out of range (have {count})")]
    ChannelOutOfRange { channel: usize, count: usize },

    #[error("Sensor read failed: {0}")]
    ReadFailed(String),
}

/// Banco de sensores piezo, un valor ADC por lectura
pub trait SensorBank: Send {
    fn channel_count(&self) -> usize;
    fn read(&mut self, channel: usize) -> Result<i32, SensorError>;
}

/// Una tarea de captura retiene el cerrojo durante toda su vida
pub type SharedSensors = Arc<Mutex<Box<dyn SensorBank>>>;

pub fn shared(bank: impl SensorBank + 'static) -> SharedSensors {
    Arc::new(Mutex::new(Box::new(bank)))
}

const ADC_MAX: i32 = 4095;

/// Forma de una caída simulada: ráfaga sinusoidal amortiguada
#[derive(Debug, Clone)]
pub struct DropProfile {
    /// Retardo desde que se programa hasta el primer impacto
    pub delay: Duration,
    /// Amplitud de pico por canal (0 = el canal no ve la caída)
    pub amplitudes: Vec<f32>,
    /// Muestras que dura la ráfaga
    pub length: usize,
    /// Amortiguamiento por muestra
    pub decay: f32,
    /// Ciclos por muestra
    pub frequency: f32,
}

impl DropProfile {
    pub fn single_pill(channels: usize) -> Self {
        Self {
            delay: Duration::from_millis(80),
            amplitudes: vec![900.0; channels],
            length: 600,
            decay: 0.008,
            frequency: 0.05,
        }
    }

    fn sample(&self, channel: usize, k: usize) -> f32 {
        let amp = self.amplitudes.get(channel).copied().unwrap_or(0.0);
        let t = k as f32;
        amp * (-self.decay * t).exp() * (std::f32::consts::TAU * self.frequency * t).sin().abs()
    }
}

#[derive(Debug)]
struct ScheduledDrop {
    profile: DropProfile,
    starts_at: Instant,
    cursors: Vec<usize>,
}

/// Programa caídas en un `SimulatedSensorBank` sin tocar su cerrojo
#[derive(Debug, Clone, Default)]
pub struct DropTrigger {
    slot: Arc<Mutex<Option<ScheduledDrop>>>,
}

impl DropTrigger {
    pub fn schedule(&self, profile: DropProfile) {
        let cursors = vec![0; profile.amplitudes.len()];
        let drop = ScheduledDrop {
            starts_at: Instant::now() + profile.delay,
            profile,
            cursors,
        };
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(drop);
        }
    }
}

/// Sensores simulados: ruido de fondo más las caídas programadas
#[derive(Debug)]
pub struct SimulatedSensorBank {
    channels: usize,
    noise_floor: i32,
    trigger: DropTrigger,
}

impl SimulatedSensorBank {
    pub fn new(channels: usize, noise_floor: i32) -> Self {
        Self {
            channels,
            noise_floor: noise_floor.max(0),
            trigger: DropTrigger::default(),
        }
    }

    /// Asa para programar caídas desde otro hilo (callback del servo)
    pub fn trigger(&self) -> DropTrigger {
        self.trigger.clone()
    }

    fn drop_component(&self, channel: usize) -> f32 {
        let Ok(mut slot) = self.trigger.slot.lock() else {
            return 0.0;
        };
        let Some(drop) = slot.as_mut() else {
            return 0.0;
        };
        if Instant::now() < drop.starts_at {
            return 0.0;
        }

        let Some(cursor) = drop.cursors.get_mut(channel) else {
            return 0.0;
        };
        let k = *cursor;
        *cursor += 1;
        let value = if k < drop.profile.length {
            drop.profile.sample(channel, k)
        } else {
            0.0
        };

        if drop.cursors.iter().all(|&c| c >= drop.profile.length) {
            *slot = None;
        }
        value
    }
}

impl SensorBank for SimulatedSensorBank {
    fn channel_count(&self) -> usize {
        self.channels
    }

    fn read(&mut self, channel: usize) -> Result<i32, SensorError> {
        if channel >= self.channels {
            return Err(SensorError::ChannelOutOfRange {
                channel,
                count: self.channels,
            });
        }

        let noise = if self.noise_floor > 0 {
            rand::thread_rng().gen_range(0..=self.noise_floor)
        } else {
            0
        };
        let value = self.drop_component(channel) as i32 + noise;
        Ok(value.clamp(0, ADC_MAX))
    }
}

/// Reproduce ventanas grabadas (CSV de `replay_capture`) y después queda en silencio
#[derive(Debug, Clone)]
pub struct ReplaySensorBank {
    windows: Vec<Vec<i32>>,
    cursors: Vec<usize>,
}

impl ReplaySensorBank {
    pub fn new(windows: Vec<Vec<i32>>) -> Self {
        let cursors = vec![0; windows.len()];
        Self { windows, cursors }
    }
}

impl SensorBank for ReplaySensorBank {
    fn channel_count(&self) -> usize {
        self.windows.len()
    }

    fn read(&mut self, channel: usize) -> Result<i32, SensorError> {
        let count = self.windows.len();
        let (Some(window), Some(cursor)) = (self.windows.get(channel), self.cursors.get_mut(channel))
        else {
            return Err(SensorError::ChannelOutOfRange { channel, count });
        };

        let value = window.get(*cursor).copied().unwrap_or(0);
        *cursor += 1;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_stays_below_floor() {
        let mut bank = SimulatedSensorBank::new(2, 10);
        for _ in 0..200 {
            let v = bank.read(1).unwrap();
            assert!((0..=10).contains(&v));
        }
        assert!(bank.read(2).is_err());
    }

    #[test]
    fn test_scheduled_drop_rises_above_noise() {
        let mut bank = SimulatedSensorBank::new(1, 5);
        let mut profile = DropProfile::single_pill(1);
        profile.delay = Duration::ZERO;
        bank.trigger().schedule(profile);

        let peak = (0..100).map(|_| bank.read(0).unwrap()).max().unwrap();
        assert!(peak > 500, "pico demasiado bajo: {}", peak);
    }

    #[test]
    fn test_drop_ends_after_length() {
        let mut bank = SimulatedSensorBank::new(1, 0);
        let mut profile = DropProfile::single_pill(1);
        profile.delay = Duration::ZERO;
        profile.length = 10;
        bank.trigger().schedule(profile);

        for _ in 0..10 {
            bank.read(0).unwrap();
        }
        assert_eq!(bank.read(0).unwrap(), 0);
        assert!(bank.trigger.slot.lock().unwrap().is_none());
    }

    #[test]
    fn test_replay_then_silence() {
        let mut bank = ReplaySensorBank::new(vec![vec![5, 60, 7], vec![1]]);
        assert_eq!(bank.channel_count(), 2);
        assert_eq!(bank.read(0).unwrap(), 5);
        assert_eq!(bank.read(0).unwrap(), 60);
        assert_eq!(bank.read(1).unwrap(), 1);
        assert_eq!(bank.read(1).unwrap(), 0);
        assert_eq!(bank.read(0).unwrap(), 7);
        assert_eq!(bank.read(0).unwrap(), 0);
        assert!(bank.read(2).is_err());
    }
}
