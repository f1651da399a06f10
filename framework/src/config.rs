//! Configuration structures consumed by the sensor manager and bays
//!
//! Loading and validating the file is the caller's job; these structs are
//! what it deserializes into. Lengths are centimetres, timeouts seconds.

use std::time::Duration;

use serde::{de, Deserialize, Deserializer};
use vl53l1x::TimingBudget;

use crate::detector::Side;
use crate::units::Length;

/// Whole-system configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Sensors in bring-up order
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    /// Shared I2C bus, required when any I2C sensor is configured
    #[serde(default)]
    pub i2c: Option<I2cBusConfig>,
    #[serde(default)]
    pub bays: Vec<BayConfig>,
    /// Keep running with a faulted slot when a sensor fails to initialize
    #[serde(default = "default_true")]
    pub generous_recovery: bool,
    /// Pause between scan passes (ms), 0 to scan back to back
    #[serde(default)]
    pub scan_interval_ms: u64,
}

impl SystemConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

/// One sensor entry
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    #[serde(flatten)]
    pub hardware: SensorHardware,
}

/// Hardware family, selected by `hw_type`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "hw_type")]
pub enum SensorHardware {
    #[serde(rename = "SerialTOF")]
    Serial(SerialTofConfig),
    #[serde(rename = "I2CTOF")]
    I2c(I2cTofConfig),
}

/// TFMini-class serial sensor
#[derive(Debug, Clone, Deserialize)]
pub struct SerialTofConfig {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Consecutive identical distances required, 0 to disable clustering
    #[serde(default = "default_clustering")]
    pub clustering: u16,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// VL53L1X-class I2C sensor
#[derive(Debug, Clone, Deserialize)]
pub struct I2cTofConfig {
    #[serde(default = "default_bus")]
    pub bus: u8,
    /// Address assigned after power-up
    pub address: u8,
    /// 0 for a host GPIO pin, otherwise the AW9523 address
    #[serde(default)]
    pub enable_board: u8,
    pub enable_pin: u8,
    #[serde(
        default = "default_timing_budget",
        deserialize_with = "timing_budget_ms"
    )]
    pub timing_budget: TimingBudget,
    #[serde(default)]
    pub distance_mode: DistanceModeSetting,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Keep ranging after bring-up instead of idling enabled
    #[serde(default)]
    pub always_range: bool,
    /// Settle time after toggling the enable line (ms)
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Time allowed for firmware boot after power-up (ms)
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,
}

impl I2cTofConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceModeSetting {
    #[serde(alias = "Short")]
    Short,
    #[default]
    #[serde(alias = "Long")]
    Long,
}

impl From<DistanceModeSetting> for vl53l1x::DistanceMode {
    fn from(mode: DistanceModeSetting) -> Self {
        match mode {
            DistanceModeSetting::Short => vl53l1x::DistanceMode::Short,
            DistanceModeSetting::Long => vl53l1x::DistanceMode::Long,
        }
    }
}

/// I2C bus power control
#[derive(Debug, Clone, Deserialize)]
pub struct I2cBusConfig {
    #[serde(default = "default_bus")]
    pub bus: u8,
    /// Host GPIO driving the bus enable line
    pub enable_pin: u8,
    /// Host GPIO reporting bus ready
    pub ready_pin: u8,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: f64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl I2cBusConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ready_timeout_secs.max(0.0))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// One parking bay
#[derive(Debug, Clone, Deserialize)]
pub struct BayConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Distance from the range sensor to the bay door
    pub depth: Length,
    #[serde(default)]
    pub timeouts: BayTimeouts,
    pub longitudinal: LongitudinalGroup,
    #[serde(default)]
    pub lateral: LateralGroup,
}

impl BayConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Motion timeouts (seconds)
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BayTimeouts {
    #[serde(default = "default_motion_timeout")]
    pub dock: f64,
    #[serde(default = "default_motion_timeout")]
    pub undock: f64,
}

impl BayTimeouts {
    pub fn dock_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.dock.max(0.0))
    }

    pub fn undock_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.undock.max(0.0))
    }
}

impl Default for BayTimeouts {
    fn default() -> Self {
        Self {
            dock: default_motion_timeout(),
            undock: default_motion_timeout(),
        }
    }
}

/// Longitudinal (range) sensor settings; unset fields fall back to the
/// group defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LongitudinalSettings {
    pub name: Option<String>,
    /// Distance from the sensor to the desired stop point
    pub offset: Option<Length>,
    pub spread_park: Option<Length>,
    /// Warning band, percent of usable depth
    pub pct_warn: Option<f64>,
    /// Critical band, percent of usable depth
    pub pct_crit: Option<f64>,
    /// Reading-to-reading noise tolerated before motion is reported
    pub error_margin: Option<Length>,
}

impl LongitudinalSettings {
    pub fn merged(&self, defaults: &LongitudinalSettings) -> LongitudinalSettings {
        LongitudinalSettings {
            name: self.name.clone().or_else(|| defaults.name.clone()),
            offset: self.offset.or(defaults.offset),
            spread_park: self.spread_park.or(defaults.spread_park),
            pct_warn: self.pct_warn.or(defaults.pct_warn),
            pct_crit: self.pct_crit.or(defaults.pct_crit),
            error_margin: self.error_margin.or(defaults.error_margin),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LongitudinalGroup {
    pub defaults: LongitudinalSettings,
    pub sensors: Vec<LongitudinalSettings>,
}

/// Lateral (side) sensor settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LateralSettings {
    pub name: Option<String>,
    /// Distance from the sensor to the ideal vehicle flank
    pub offset: Option<Length>,
    pub spread_ok: Option<Length>,
    pub spread_warn: Option<Length>,
    pub side: Option<Side>,
    /// Range distance at which the vehicle first reaches this sensor
    pub intercept: Option<Length>,
    /// Beyond this the sensor sees no vehicle (default 90 in)
    pub limit: Option<Length>,
}

impl LateralSettings {
    pub fn merged(&self, defaults: &LateralSettings) -> LateralSettings {
        LateralSettings {
            name: self.name.clone().or_else(|| defaults.name.clone()),
            offset: self.offset.or(defaults.offset),
            spread_ok: self.spread_ok.or(defaults.spread_ok),
            spread_warn: self.spread_warn.or(defaults.spread_warn),
            side: self.side.or(defaults.side),
            intercept: self.intercept.or(defaults.intercept),
            limit: self.limit.or(defaults.limit),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LateralGroup {
    pub defaults: LateralSettings,
    pub sensors: Vec<LateralSettings>,
}

fn timing_budget_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimingBudget, D::Error> {
    let ms = u16::deserialize(deserializer)?;
    TimingBudget::try_from(ms).map_err(de::Error::custom)
}

fn default_true() -> bool {
    true
}

fn default_baud() -> u32 {
    115_200
}

fn default_clustering() -> u16 {
    1
}

fn default_max_retries() -> u32 {
    5
}

fn default_bus() -> u8 {
    1
}

fn default_timing_budget() -> TimingBudget {
    TimingBudget::Ms200
}

fn default_settle_ms() -> u64 {
    5
}

fn default_boot_timeout_ms() -> u64 {
    1000
}

fn default_ready_timeout_secs() -> f64 {
    10.0
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_motion_timeout() -> f64 {
    120.0
}
