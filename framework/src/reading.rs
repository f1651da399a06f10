//! Sensor readings and the messages exchanged with the sensor manager
//!
//! A `Reading` is produced by a driver on every poll and never modified
//! afterwards. One scan pass over all sensors yields a `SensorResponse`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::ManagerError;
use crate::units::Length;

/// Sensor identifier (configured sensor name)
pub type SensorId = String;

/// Outcome of a single poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorStatus {
    Ok,
    Weak,
    Flood,
    Saturation,
    TooClose,
    TooFar,
    NotRanging,
    /// No new measurement since the last poll
    InterruptNotReady,
    Fault,
}

/// One poll result
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub status: SensorStatus,
    /// Present only for `Ok` readings
    pub distance: Option<Length>,
    /// Chip temperature (°C), when the sensor reports one
    pub temperature: Option<f32>,
    pub timestamp: Instant,
    pub fault_reason: Option<String>,
}

impl Reading {
    /// Valid distance measurement
    pub fn range(distance: Length, temperature: Option<f32>) -> Self {
        Self {
            status: SensorStatus::Ok,
            distance: Some(distance),
            temperature,
            timestamp: Instant::now(),
            fault_reason: None,
        }
    }

    /// Reading carrying only a status
    pub fn status(status: SensorStatus) -> Self {
        Self {
            status,
            distance: None,
            temperature: None,
            timestamp: Instant::now(),
            fault_reason: None,
        }
    }

    pub fn fault(reason: impl Into<String>) -> Self {
        Self {
            fault_reason: Some(reason.into()),
            ..Self::status(SensorStatus::Fault)
        }
    }

    pub fn at(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the reading carries a distance
    pub fn is_quantity(&self) -> bool {
        self.distance.is_some()
    }
}

/// Everything read during one scan pass
///
/// All readings share the pass's timestamp.
#[derive(Debug, Clone)]
pub struct SensorResponse {
    pub timestamp: Instant,
    pub readings: HashMap<SensorId, Reading>,
    pub scan_duration: Duration,
}

impl SensorResponse {
    pub fn get(&self, sensor: &str) -> Option<&Reading> {
        self.readings.get(sensor)
    }
}

/// Actual state of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorState {
    Disabled,
    Enabled,
    Ranging,
    Fault,
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SensorState::Disabled => "disabled",
            SensorState::Enabled => "enabled",
            SensorState::Ranging => "ranging",
            SensorState::Fault => "fault",
        };
        f.write_str(s)
    }
}

/// States a sensor can be asked to enter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetState {
    Disabled,
    Enabled,
    Ranging,
}

impl FromStr for TargetState {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(TargetState::Disabled),
            "enabled" => Ok(TargetState::Enabled),
            "ranging" => Ok(TargetState::Ranging),
            _ => Err(ManagerError::UnknownState(s.to_string())),
        }
    }
}

/// Which sensors a command applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Id(SensorId),
}

/// Message on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub target: TargetState,
    pub sensor: Selector,
}

impl ControlCommand {
    pub fn all(target: TargetState) -> Self {
        Self {
            target,
            sensor: Selector::All,
        }
    }

    pub fn one(target: TargetState, sensor: impl Into<SensorId>) -> Self {
        Self {
            target,
            sensor: Selector::Id(sensor.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_state_parsing() {
        assert_eq!("Ranging".parse::<TargetState>().unwrap(), TargetState::Ranging);
        assert_eq!("disabled".parse::<TargetState>().unwrap(), TargetState::Disabled);
        assert!(matches!(
            "fault".parse::<TargetState>(),
            Err(ManagerError::UnknownState(s)) if s == "fault"
        ));
    }

    #[test]
    fn test_reading_constructors() {
        let ok = Reading::range(Length::from_cm(120.0), Some(31.0));
        assert!(ok.is_quantity());
        assert_eq!(ok.status, SensorStatus::Ok);

        let fault = Reading::fault("Did not initialize.");
        assert!(!fault.is_quantity());
        assert_eq!(fault.status, SensorStatus::Fault);
        assert_eq!(fault.fault_reason.as_deref(), Some("Did not initialize."));
    }
}
