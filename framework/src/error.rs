//! Error types for each layer of the system.
//!
//! Transient I/O is absorbed inside the drivers; what surfaces here is what
//! the caller has to act on.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::bay::BayState;

/// Sensor driver errors
#[derive(Debug, Error)]
pub enum SensorError {
    /// Serial or I2C hiccup, retried locally before surfacing
    #[error("{sensor}: transient I/O error: {source}")]
    TransientIo {
        sensor: String,
        #[source]
        source: io::Error,
    },

    /// Frame or reply failed validation
    #[error("{sensor}: protocol error: {detail}")]
    Protocol { sensor: String, detail: String },

    /// Retry bound exceeded or device misbehaving
    #[error("{sensor}: device fault: {reason}")]
    DeviceFault { sensor: String, reason: String },

    #[error("I2C bus {0} is unavailable")]
    BusUnavailable(u8),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SensorError {
    pub fn fault(sensor: &str, reason: impl Into<String>) -> Self {
        SensorError::DeviceFault {
            sensor: sensor.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transient(sensor: &str, source: io::Error) -> Self {
        SensorError::TransientIo {
            sensor: sensor.to_string(),
            source,
        }
    }
}

/// I2C bus and GPIO expander errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("I2C bus {bus} not ready after {waited:?}")]
    Timeout { bus: u8, waited: Duration },

    #[error("I2C bus {0} is unavailable")]
    Unavailable(u8),

    #[error("GPIO expander 0x{0:02X} is not configured")]
    UnknownExpander(u8),

    #[error("GPIO expander 0x{address:02X} reported chip id 0x{id:02X}")]
    InvalidExpander { address: u8, id: u8 },

    /// Expanders that could not be reset; the rest were reset and registered
    #[error("GPIO expanders failed to reset: {addresses:02X?}")]
    ExpanderReset { addresses: Vec<u8> },

    #[error("hardware I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<BusError> for SensorError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Unavailable(bus) | BusError::Timeout { bus, .. } => {
                SensorError::BusUnavailable(bus)
            }
            other => SensorError::Configuration(other.to_string()),
        }
    }
}

/// Detector calibration errors
#[derive(Debug, Error, PartialEq)]
pub enum DetectorError {
    /// Read before every required calibration field was set
    #[error("detector {0} is not ready")]
    NotReady(String),

    #[error("detector {detector} is missing calibration: {missing}")]
    Configuration { detector: String, missing: String },
}

/// Bay state machine errors
#[derive(Debug, Error, PartialEq)]
pub enum BayError {
    #[error("bay {bay}: cannot {action} while {from:?}")]
    InvalidTransition {
        bay: String,
        from: BayState,
        action: &'static str,
    },

    #[error("bay configuration error: {0}")]
    Configuration(String),
}

/// Sensor manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Construction failure propagated in strict mode
    #[error("sensor {name} failed to initialize: {source}")]
    Sensor {
        name: String,
        #[source]
        source: SensorError,
    },

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("no sensor named {0}")]
    UnknownSensor(String),

    #[error("unknown sensor state '{0}' (expected disabled, enabled or ranging)")]
    UnknownState(String),

    #[error("sensor {0} failed to initialize and cannot change state")]
    SensorFaulted(String),

    #[error("failed to start sensor thread: {0}")]
    Thread(#[source] io::Error),
}
