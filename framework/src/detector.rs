//! Detectors turn raw readings into bay positions.
//!
//! A [`RangeDetector`] watches the longitudinal sensor at the back of the
//! bay and classifies how far the vehicle still has to go; a
//! [`LateralDetector`] watches one side sensor and classifies how well the
//! vehicle is centred. Both refuse to answer until every required
//! calibration field is set.

use std::collections::VecDeque;

use log::debug;
use serde::Deserialize;

use crate::error::DetectorError;
use crate::reading::{Reading, SensorId, SensorStatus, TargetState};
use crate::units::{Length, Speed};

/// Readings kept per detector
pub const HISTORY_LEN: usize = 10;

/// Anything closer than this to the range sensor is about to hit it
const EMERGENCY_CM: f64 = 2.0 * 2.54;
/// Readings at or beyond this share of the bay depth see the open door
const NO_OBJECT_FRACTION: f64 = 0.9;
/// Default lateral limit, 90 in
const LATERAL_LIMIT_CM: f64 = 90.0 * 2.54;
const DEFAULT_ERROR_MARGIN_CM: f64 = 2.0;

/// Longitudinal position classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeQuality {
    /// About to hit the sensor
    Emergency,
    /// Past the stop point
    BackUp,
    Park,
    /// Inside the critical band
    Final,
    /// Inside the warning band
    Base,
    Ok,
    /// Nothing in the bay
    NoObject,
    /// Weak return, usually the open door
    DoorOpen,
    /// Sensor saturated or flooded
    NoReading,
    Unknown,
}

impl RangeQuality {
    /// Qualities that only a vehicle inside the bay produces
    pub fn vehicle_plausible(&self) -> bool {
        matches!(
            self,
            RangeQuality::Emergency
                | RangeQuality::BackUp
                | RangeQuality::Park
                | RangeQuality::Final
                | RangeQuality::Base
        )
    }
}

/// Direction of travel relative to the range sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Approaching the sensor
    Forward,
    /// Moving away from the sensor
    Reverse,
    Still,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vector {
    pub speed: Speed,
    pub direction: Direction,
}

/// Range detector calibration
#[derive(Debug, Clone, PartialEq)]
pub struct RangeCalibration {
    /// Sensor to door distance
    pub bay_depth: Option<Length>,
    /// Sensor to stop point distance
    pub offset: Length,
    /// Tolerance around the stop point
    pub spread_park: Option<Length>,
    /// Warning band as percent of usable depth
    pub pct_warn: Option<f64>,
    /// Critical band as percent of usable depth
    pub pct_crit: Option<f64>,
    /// Noise tolerated before motion is reported
    pub error_margin: Length,
}

impl Default for RangeCalibration {
    fn default() -> Self {
        Self {
            bay_depth: None,
            offset: Length::ZERO,
            spread_park: None,
            pct_warn: None,
            pct_crit: None,
            error_margin: Length::from_cm(DEFAULT_ERROR_MARGIN_CM),
        }
    }
}

impl RangeCalibration {
    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.bay_depth.is_none() {
            missing.push("bay_depth");
        }
        if self.spread_park.is_none() {
            missing.push("spread_park");
        }
        if self.pct_warn.is_none() {
            missing.push("pct_warn");
        }
        if self.pct_crit.is_none() {
            missing.push("pct_crit");
        }
        missing
    }
}

/// Bands derived once calibration is complete
#[derive(Debug, Clone, Copy)]
struct RangeBands {
    bay_depth: Length,
    spread_park: Length,
    dist_warn: Length,
    dist_crit: Length,
}

/// Bounded newest-first reading history
#[derive(Debug, Clone, Default)]
struct History {
    entries: VecDeque<Reading>,
}

impl History {
    /// Record a reading; "no new data" readings are not history
    fn record(&mut self, reading: &Reading) {
        if reading.status == SensorStatus::InterruptNotReady {
            return;
        }
        self.entries.push_front(reading.clone());
        self.entries.truncate(HISTORY_LEN);
    }

    fn latest(&self) -> Option<&Reading> {
        self.entries.front()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Whether a sensor whose latest reading is `latest` is delivering data
fn ranging(latest: Option<&Reading>) -> bool {
    matches!(
        latest.map(|r| r.status),
        Some(s) if s != SensorStatus::NotRanging && s != SensorStatus::Fault
    )
}

/// Longitudinal detector
pub struct RangeDetector {
    id: SensorId,
    calibration: RangeCalibration,
    bands: Option<RangeBands>,
    history: History,
    requested: TargetState,
}

impl RangeDetector {
    pub fn new(id: impl Into<SensorId>) -> Self {
        Self {
            id: id.into(),
            calibration: RangeCalibration::default(),
            bands: None,
            history: History::default(),
            requested: TargetState::Disabled,
        }
    }

    /// Replace the calibration
    ///
    /// The detector becomes ready only when every required field is set;
    /// otherwise the missing fields are reported and reads stay rejected.
    pub fn configure(&mut self, calibration: RangeCalibration) -> Result<(), DetectorError> {
        self.calibration = calibration;
        self.check_ready()
    }

    pub fn set_bay_depth(&mut self, depth: Length) -> bool {
        self.calibration.bay_depth = Some(depth);
        self.check_ready().is_ok()
    }

    pub fn set_offset(&mut self, offset: Length) -> bool {
        self.calibration.offset = offset;
        self.check_ready().is_ok()
    }

    pub fn set_spread_park(&mut self, spread: Length) -> bool {
        self.calibration.spread_park = Some(spread);
        self.check_ready().is_ok()
    }

    pub fn set_percentages(&mut self, pct_warn: f64, pct_crit: f64) -> bool {
        self.calibration.pct_warn = Some(pct_warn);
        self.calibration.pct_crit = Some(pct_crit);
        self.check_ready().is_ok()
    }

    pub fn set_error_margin(&mut self, margin: Length) {
        self.calibration.error_margin = margin;
    }

    fn check_ready(&mut self) -> Result<(), DetectorError> {
        let cal = &self.calibration;
        match (cal.bay_depth, cal.spread_park, cal.pct_warn, cal.pct_crit) {
            (Some(bay_depth), Some(spread_park), Some(pct_warn), Some(pct_crit)) => {
                let usable = bay_depth - cal.offset;
                let bands = RangeBands {
                    bay_depth,
                    spread_park,
                    dist_warn: usable.scale(pct_warn / 100.0),
                    dist_crit: usable.scale(pct_crit / 100.0),
                };
                debug!(
                    "[{}] ready: warn {} crit {} park ±{}",
                    self.id, bands.dist_warn, bands.dist_crit, bands.spread_park
                );
                self.bands = Some(bands);
                Ok(())
            }
            _ => {
                self.bands = None;
                Err(DetectorError::Configuration {
                    detector: self.id.clone(),
                    missing: cal.missing().join(", "),
                })
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.bands.is_some()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn calibration(&self) -> &RangeCalibration {
        &self.calibration
    }

    /// Usable depth between the stop point and the door
    pub fn usable_depth(&self) -> Option<Length> {
        self.calibration.bay_depth.map(|d| d - self.calibration.offset)
    }

    pub fn record(&mut self, reading: &Reading) {
        self.history.record(reading);
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.history.latest()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Whether the sensor is currently delivering data
    pub fn is_ranging(&self) -> bool {
        ranging(self.history.latest())
    }

    pub fn requested_state(&self) -> TargetState {
        self.requested
    }

    pub fn set_requested_state(&mut self, target: TargetState) {
        self.requested = target;
    }

    fn bands(&self) -> Result<RangeBands, DetectorError> {
        self.bands
            .ok_or_else(|| DetectorError::NotReady(self.id.clone()))
    }

    /// Latest raw distance, if the latest reading has one
    pub fn raw(&self) -> Option<Length> {
        self.history.latest().and_then(|r| r.distance)
    }

    /// Distance left to the stop point; negative once past it
    pub fn value(&self) -> Result<Option<Length>, DetectorError> {
        self.bands()?;
        Ok(self.raw().map(|raw| raw - self.calibration.offset))
    }

    pub fn quality(&self) -> Result<RangeQuality, DetectorError> {
        let bands = self.bands()?;
        let latest = match self.history.latest() {
            Some(reading) => reading,
            None => return Ok(RangeQuality::Unknown),
        };

        let raw = match latest.distance {
            Some(raw) => raw,
            None => {
                return Ok(match latest.status {
                    SensorStatus::Weak => RangeQuality::DoorOpen,
                    SensorStatus::TooFar => RangeQuality::NoObject,
                    SensorStatus::Flood | SensorStatus::Saturation => RangeQuality::NoReading,
                    _ => RangeQuality::Unknown,
                })
            }
        };
        let adjusted = raw - self.calibration.offset;

        // A stop point inside the emergency zone still parks
        let quality = if raw >= bands.bay_depth.scale(NO_OBJECT_FRACTION) {
            RangeQuality::NoObject
        } else if adjusted.abs() <= bands.spread_park {
            RangeQuality::Park
        } else if raw < Length::from_cm(EMERGENCY_CM) {
            RangeQuality::Emergency
        } else if adjusted < Length::ZERO {
            RangeQuality::BackUp
        } else if adjusted <= bands.dist_crit {
            RangeQuality::Final
        } else if adjusted <= bands.dist_warn {
            RangeQuality::Base
        } else {
            RangeQuality::Ok
        };
        Ok(quality)
    }

    /// Motion between the two most recent distance readings
    ///
    /// `None` when there are fewer than two distances or the newest
    /// reading carries none.
    pub fn vector(&self) -> Result<Option<Vector>, DetectorError> {
        self.bands()?;

        let mut entries = self.history.entries.iter();
        let newest = match entries.next() {
            Some(r) => r,
            None => return Ok(None),
        };
        let newest_distance = match newest.distance {
            Some(d) => d,
            None => return Ok(None),
        };
        let previous = match entries.find(|r| r.distance.is_some()) {
            Some(r) => r,
            None => return Ok(None),
        };
        let previous_distance = match previous.distance {
            Some(d) => d,
            None => return Ok(None),
        };

        let net = newest_distance - previous_distance;
        let margin = self.calibration.error_margin;
        let direction = if net > margin {
            Direction::Reverse
        } else if net < -margin {
            Direction::Forward
        } else {
            Direction::Still
        };

        let speed = match direction {
            Direction::Still => Speed::ZERO,
            _ => Speed::from_travel(
                net,
                newest.timestamp.saturating_duration_since(previous.timestamp),
            ),
        };
        Ok(Some(Vector { speed, direction }))
    }

    /// Whether the vehicle is moving, `None` when unknown
    pub fn motion(&self) -> Result<Option<bool>, DetectorError> {
        Ok(self.vector()?.map(|v| v.direction != Direction::Still))
    }
}

/// Side of the bay a lateral sensor is mounted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Side {
    L,
    R,
}

/// Lateral position classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateralQuality {
    Ok,
    Warning,
    Critical,
    /// Nothing within the limit
    NoVehicle,
    /// The vehicle has not reached this sensor yet
    NotIntercepted,
    Unknown,
}

impl LateralQuality {
    /// Whether the sensor sees the vehicle's flank
    pub fn object_present(&self) -> bool {
        matches!(
            self,
            LateralQuality::Ok | LateralQuality::Warning | LateralQuality::Critical
        )
    }
}

/// Lateral detector calibration
#[derive(Debug, Clone, PartialEq)]
pub struct LateralCalibration {
    pub offset: Length,
    pub spread_ok: Option<Length>,
    pub spread_warn: Option<Length>,
    pub side: Option<Side>,
    pub intercept: Option<Length>,
    pub limit: Length,
}

impl Default for LateralCalibration {
    fn default() -> Self {
        Self {
            offset: Length::ZERO,
            spread_ok: None,
            spread_warn: None,
            side: None,
            intercept: None,
            limit: Length::from_cm(LATERAL_LIMIT_CM),
        }
    }
}

/// Side detector
pub struct LateralDetector {
    id: SensorId,
    calibration: LateralCalibration,
    ready: bool,
    history: History,
    requested: TargetState,
}

impl LateralDetector {
    pub fn new(id: impl Into<SensorId>) -> Self {
        Self {
            id: id.into(),
            calibration: LateralCalibration::default(),
            ready: false,
            history: History::default(),
            requested: TargetState::Disabled,
        }
    }

    pub fn configure(&mut self, calibration: LateralCalibration) -> Result<(), DetectorError> {
        self.calibration = calibration;
        self.check_ready()
    }

    pub fn set_spreads(&mut self, spread_ok: Length, spread_warn: Length) -> bool {
        self.calibration.spread_ok = Some(spread_ok);
        self.calibration.spread_warn = Some(spread_warn);
        self.check_ready().is_ok()
    }

    pub fn set_side(&mut self, side: Side) -> bool {
        self.calibration.side = Some(side);
        self.check_ready().is_ok()
    }

    pub fn set_offset(&mut self, offset: Length) -> bool {
        self.calibration.offset = offset;
        self.check_ready().is_ok()
    }

    fn check_ready(&mut self) -> Result<(), DetectorError> {
        let cal = &self.calibration;
        let mut missing = Vec::new();
        if cal.side.is_none() {
            missing.push("side");
        }
        if cal.spread_ok.is_none() {
            missing.push("spread_ok");
        }
        if cal.spread_warn.is_none() {
            missing.push("spread_warn");
        }
        self.ready = missing.is_empty();
        if self.ready {
            Ok(())
        } else {
            Err(DetectorError::Configuration {
                detector: self.id.clone(),
                missing: missing.join(", "),
            })
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn side(&self) -> Option<Side> {
        self.calibration.side
    }

    pub fn intercept(&self) -> Option<Length> {
        self.calibration.intercept
    }

    pub fn record(&mut self, reading: &Reading) {
        self.history.record(reading);
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.history.latest()
    }

    pub fn is_ranging(&self) -> bool {
        ranging(self.history.latest())
    }

    pub fn requested_state(&self) -> TargetState {
        self.requested
    }

    pub fn set_requested_state(&mut self, target: TargetState) {
        self.requested = target;
    }

    /// Distance from the ideal flank position
    pub fn value(&self) -> Result<Option<Length>, DetectorError> {
        if !self.ready {
            return Err(DetectorError::NotReady(self.id.clone()));
        }
        Ok(self
            .history
            .latest()
            .and_then(|r| r.distance)
            .map(|raw| raw - self.calibration.offset))
    }

    pub fn quality(&self) -> Result<LateralQuality, DetectorError> {
        self.quality_at(None)
    }

    /// Quality given the current raw range distance
    ///
    /// While the range sensor still reads farther than this sensor's
    /// intercept the vehicle cannot be beside it yet.
    pub fn quality_at(&self, range_raw: Option<Length>) -> Result<LateralQuality, DetectorError> {
        let value = match self.value()? {
            Some(value) => value,
            None => {
                // Nothing within range means nothing beside the sensor
                let too_far = self
                    .history
                    .latest()
                    .map_or(false, |r| r.status == SensorStatus::TooFar);
                return Ok(if too_far {
                    LateralQuality::NoVehicle
                } else {
                    LateralQuality::Unknown
                });
            }
        };

        if let (Some(range), Some(intercept)) = (range_raw, self.calibration.intercept) {
            if range > intercept {
                return Ok(LateralQuality::NotIntercepted);
            }
        }

        // Ready implies both spreads are set
        let (spread_ok, spread_warn) = match (self.calibration.spread_ok, self.calibration.spread_warn) {
            (Some(ok), Some(warn)) => (ok, warn),
            _ => return Err(DetectorError::NotReady(self.id.clone())),
        };

        let quality = if value > self.calibration.limit {
            LateralQuality::NoVehicle
        } else if value.abs() <= spread_ok {
            LateralQuality::Ok
        } else if value.abs() <= spread_warn {
            LateralQuality::Warning
        } else {
            LateralQuality::Critical
        };
        Ok(quality)
    }
}
