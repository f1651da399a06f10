//! Parking Bay Docking Framework
//!
//! Sensor management and docking guidance for garage parking bays. A
//! range sensor on the back wall and optional side sensors are polled on
//! a dedicated thread; each bay turns the readings into stop guidance,
//! motion tracking and an occupancy decision.
//!
//! ## Features
//!
//! - **Sensor Abstraction**: TFMini-class serial and VL53L1X-class I2C sensors behind one trait
//! - **Bus Management**: Powered I2C bus, AW9523 enable-line expanders, sequential address remapping
//! - **Fault Isolation**: A failed sensor stays in the pool reporting Fault readings
//! - **Newest-Wins Delivery**: The control loop never blocks on sensor data
//! - **Simulated Hardware**: Register-level device models for tests and bench runs
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Bay (state machine, occupancy)               │  control thread
//! ├──────────────────────────────────────────────┤
//! │  Detectors (range / lateral calibration)      │
//! ├────────────── SensorResponse ▲ ▼ ControlCommand
//! │  SensorManager (scan loop, fault slots)       │  sensor thread
//! ├──────────────────────────────────────────────┤
//! │  SensorDrivers │ BusResourceManager │ AW9523  │
//! ├──────────────────────────────────────────────┤
//! │  Platform (serial, I2C, GPIO)                 │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use baydock::{Bay, SensorFeed, SensorManager, SimBoard, SystemConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config: SystemConfig = serde_json::from_str(&std::fs::read_to_string("bay.json")?)?;
//! let mut board = SimBoard::from_config(&config, 400);
//!
//! let (manager, link) = SensorManager::new(&config, &mut board.platform)?;
//! let _handle = manager.spawn()?;
//!
//! let mut bay = Bay::new(&config.bays[0], link.control.clone())?;
//! let mut feed = SensorFeed::new(link.responses);
//! bay.dock()?;
//! loop {
//!     if let Some(response) = feed.poll() {
//!         bay.update(response);
//!     }
//!     bay.check_timer();
//! }
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`sensors`] - Sensor driver trait and the serial / I2C drivers
//! - [`manager`] - Sensor pool and scan loop
//! - [`feed`] - Consumer side of the scan output
//! - [`detector`] - Range and lateral calibration and classification
//! - [`bay`] - Docking state machine
//! - [`bus`] - I2C bus power and GPIO expanders
//! - [`hw`] - Hardware seam and simulated devices

pub mod bay;
pub mod bus;
pub mod config;
pub mod detector;
pub mod error;
pub mod feed;
pub mod hw;
pub mod manager;
pub mod reading;
pub mod sensors;
pub mod units;

// Re-export commonly used types
pub use bay::{Bay, BayState, Occupancy};
pub use config::{BayConfig, SensorConfig, SensorHardware, SystemConfig};
pub use detector::{Direction, LateralQuality, RangeQuality, Vector};
pub use error::{BayError, BusError, DetectorError, ManagerError, SensorError};
pub use feed::SensorFeed;
pub use hw::sim::SimBoard;
pub use hw::Platform;
pub use manager::{SensorInfo, SensorLink, SensorManager, SensorManagerHandle};
pub use reading::{
    ControlCommand, Reading, Selector, SensorId, SensorResponse, SensorState, SensorStatus,
    TargetState,
};
pub use sensors::SensorDriver;
pub use units::{Length, Speed};
