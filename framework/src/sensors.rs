//! Sensor abstraction layer for hardware independence
//! Each sensor family implements `SensorDriver`; the manager only sees the trait.

pub mod i2c_tof;
pub mod serial_tof;

pub use i2c_tof::I2cTof;
pub use serial_tof::SerialTof;

use std::fmt;

use log::debug;

use crate::error::SensorError;
use crate::reading::{Reading, SensorState, TargetState};

/// Abstraction for ranging sensors
/// Implementations: TFMini (serial), VL53L1X (I2C)
pub trait SensorDriver: Send {
    /// Configured sensor name
    fn name(&self) -> &str;

    /// Where the sensor is attached, for diagnostics
    fn interface(&self) -> String;

    fn state(&self) -> SensorState;

    fn enable(&mut self) -> Result<(), SensorError>;

    fn disable(&mut self) -> Result<(), SensorError>;

    fn start_ranging(&mut self) -> Result<(), SensorError>;

    fn stop_ranging(&mut self) -> Result<(), SensorError>;

    /// Take one reading
    /// Never fails: problems are reported as a non-Ok status
    fn poll(&mut self) -> Reading;

    /// Walk the sensor to `target` through the intermediate states
    fn set_state(&mut self, target: TargetState) -> Result<(), SensorError> {
        // A faulted sensor restarts from scratch
        let current = match self.state() {
            SensorState::Fault => SensorState::Disabled,
            state => state,
        };
        match target {
            TargetState::Disabled => {
                if current == SensorState::Ranging {
                    self.stop_ranging()?;
                }
                if current != SensorState::Disabled {
                    self.disable()?;
                }
            }
            TargetState::Enabled => match current {
                SensorState::Disabled => self.enable()?,
                SensorState::Ranging => self.stop_ranging()?,
                _ => {}
            },
            TargetState::Ranging => {
                if current == SensorState::Disabled {
                    self.enable()?;
                }
                if current != SensorState::Ranging {
                    self.start_ranging()?;
                }
            }
        }
        Ok(())
    }
}

/// Run `op`, retrying up to `max_retries` more times on error
pub(crate) fn retry<T, E: fmt::Display>(
    sensor: &str,
    what: &str,
    max_retries: u32,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                debug!("[{}] {} failed ({}), retry {}/{}", sensor, what, e, attempt, max_retries);
            }
            Err(e) => return Err(e),
        }
    }
}
