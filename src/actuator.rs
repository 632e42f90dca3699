use std::time::Duration;

use thiserror::Error;

pub const MAX_ANGLE: u16 = 180;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActuatorError {
    #[error("Actuator {index} out of range (have {count})")]
    OutOfRange { index: usize, count: usize },

    #[error("Invalid angle {0} (0-180)")]
    InvalidAngle(u16),

    #[error("Actuator fault: {0}")]
    Fault(String),
}

/// Servo de un dispensador
pub trait Actuator: Send {
    /// Mueve a `angle` grados y vuelve cuando el movimiento se ha completado
    fn move_to(&mut self, angle: u16) -> Result<(), ActuatorError>;
}

/// Ángulos de trabajo de los servos
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorAngles {
    /// Posición de reposo (default: 0)
    pub rest: u16,
    /// Posición de dispensado (default: 80)
    pub dispense: u16,
    /// Posición de reinicio (default: 180)
    pub reset: u16,
}

impl Default for ActuatorAngles {
    fn default() -> Self {
        Self {
            rest: 0,
            dispense: 80,
            reset: 180,
        }
    }
}

impl ActuatorAngles {
    pub fn validate(&self) -> Result<(), ActuatorError> {
        for angle in [self.rest, self.dispense, self.reset] {
            if angle > MAX_ANGLE {
                return Err(ActuatorError::InvalidAngle(angle));
            }
        }
        Ok(())
    }
}

type MoveCallback = Box<dyn FnMut(u16) + Send>;

/// Servo simulado: espera el tiempo de asentamiento y avisa al callback
pub struct SimulatedActuator {
    settle: Duration,
    position: u16,
    callback: Option<MoveCallback>,
}

impl SimulatedActuator {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            position: 0,
            callback: None,
        }
    }

    /// Se invoca tras cada movimiento con el ángulo alcanzado
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    pub fn position(&self) -> u16 {
        self.position
    }
}

impl Actuator for SimulatedActuator {
    fn move_to(&mut self, angle: u16) -> Result<(), ActuatorError> {
        if angle > MAX_ANGLE {
            return Err(ActuatorError::InvalidAngle(angle));
        }
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        self.position = angle;
        if let Some(cb) = self.callback.as_mut() {
            cb(angle);
        }
        Ok(())
    }
}

/// Conjunto de servos con su posición conocida y el contador de movimientos
pub struct ActuatorBank {
    actuators: Vec<Box<dyn Actuator>>,
    positions: Vec<u16>,
    angles: ActuatorAngles,
    move_counter: u32,
}

impl ActuatorBank {
    /// Supone que todos los servos parten del reposo
    pub fn new(actuators: Vec<Box<dyn Actuator>>, angles: ActuatorAngles) -> Self {
        let positions = vec![angles.rest; actuators.len()];
        Self {
            actuators,
            positions,
            angles,
            move_counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }

    pub fn angles(&self) -> ActuatorAngles {
        self.angles
    }

    pub fn position(&self, index: usize) -> Option<u16> {
        self.positions.get(index).copied()
    }

    /// Lleva todos los servos al ángulo de reinicio
    pub fn reset_all(&mut self) -> Result<(), ActuatorError> {
        self.move_all(self.angles.reset)
    }

    fn move_all(&mut self, angle: u16) -> Result<(), ActuatorError> {
        for (actuator, position) in self.actuators.iter_mut().zip(self.positions.iter_mut()) {
            actuator.move_to(angle)?;
            *position = angle;
        }
        Ok(())
    }

    /// Alterna entre reposo y dispensado. Desde cualquier otra posición vuelve al reposo.
    pub fn toggle(&mut self, index: usize) -> Result<u16, ActuatorError> {
        let count = self.actuators.len();
        let (Some(actuator), Some(position)) =
            (self.actuators.get_mut(index), self.positions.get_mut(index))
        else {
            return Err(ActuatorError::OutOfRange { index, count });
        };

        let target = if *position == self.angles.rest {
            self.angles.dispense
        } else {
            self.angles.rest
        };
        actuator.move_to(target)?;
        *position = target;
        self.move_counter = self.move_counter.saturating_add(1);
        Ok(target)
    }

    pub fn move_counter(&self) -> u32 {
        self.move_counter
    }

    pub fn reset_counter(&mut self) {
        self.move_counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_bank(count: usize) -> (ActuatorBank, Arc<Mutex<Vec<(usize, u16)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let actuators = (0..count)
            .map(|i| {
                let mut servo = SimulatedActuator::new(Duration::ZERO);
                let log = log.clone();
                servo.set_callback(move |angle| log.lock().unwrap().push((i, angle)));
                Box::new(servo) as Box<dyn Actuator>
            })
            .collect();
        (ActuatorBank::new(actuators, ActuatorAngles::default()), log)
    }

    #[test]
    fn test_toggle_alternates() {
        let (mut bank, log) = recording_bank(2);
        assert_eq!(bank.toggle(1).unwrap(), 80);
        assert_eq!(bank.toggle(1).unwrap(), 0);
        assert_eq!(bank.toggle(1).unwrap(), 80);
        assert_eq!(bank.move_counter(), 3);
        assert_eq!(*log.lock().unwrap(), vec![(1, 80), (1, 0), (1, 80)]);
        assert_eq!(bank.position(0), Some(0));
    }

    #[test]
    fn test_toggle_out_of_range() {
        let (mut bank, _) = recording_bank(1);
        assert_eq!(
            bank.toggle(3),
            Err(ActuatorError::OutOfRange { index: 3, count: 1 })
        );
        assert_eq!(bank.move_counter(), 0);
    }

    #[test]
    fn test_reset_then_toggle_goes_to_rest() {
        let (mut bank, _) = recording_bank(2);
        bank.reset_all().unwrap();
        assert_eq!(bank.position(0), Some(180));
        assert_eq!(bank.toggle(0).unwrap(), 0);
    }

    #[test]
    fn test_reset_counter() {
        let (mut bank, _) = recording_bank(1);
        bank.toggle(0).unwrap();
        bank.toggle(0).unwrap();
        bank.reset_counter();
        assert_eq!(bank.move_counter(), 0);
    }

    #[test]
    fn test_invalid_angles() {
        let angles = ActuatorAngles {
            rest: 0,
            dispense: 200,
            reset: 180,
        };
        assert_eq!(angles.validate(), Err(ActuatorError::InvalidAngle(200)));
        let mut servo = SimulatedActuator::new(Duration::ZERO);
        servo.move_to(90).unwrap();
        assert!(servo.move_to(181).is_err());
        assert_eq!(servo.position(), 90);
    }
}
