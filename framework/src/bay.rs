//! Parking bay state machine
//!
//! A bay owns one range detector at the back wall and any number of lateral
//! detectors along the sides. It asks the sensor manager to start ranging
//! when a vehicle docks or undocks, drops back to `Ready` once nothing has
//! moved for the configured timeout, and decides whether the bay is
//! occupied.
//!
//! ```text
//!            dock()               timeout / abort()
//!   Ready ─────────────▶ Docking ─────────────────▶ Ready
//!     │  undock()                timeout / abort()
//!     └────────────────▶ Undocking ───────────────▶ Ready
//!
//!   any ── range sensor Fault ──▶ Unavailable ── recovery ──▶ Ready
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, TrySendError};
use log::{debug, info, warn};

use crate::config::BayConfig;
use crate::detector::{
    LateralCalibration, LateralDetector, LateralQuality, RangeCalibration, RangeDetector,
    RangeQuality, Vector,
};
use crate::error::BayError;
use crate::reading::{ControlCommand, SensorResponse, SensorStatus, TargetState};
use crate::units::Length;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BayState {
    Ready,
    Docking,
    Undocking,
    /// Range sensor faulted
    Unavailable,
}

impl BayState {
    pub fn is_motion(&self) -> bool {
        matches!(self, BayState::Docking | BayState::Undocking)
    }
}

impl fmt::Display for BayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BayState::Ready => "ready",
            BayState::Docking => "docking",
            BayState::Undocking => "undocking",
            BayState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Unknown,
    Occupied,
    Vacant,
}

impl fmt::Display for Occupancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Occupancy::Unknown => "unknown",
            Occupancy::Occupied => "occupied",
            Occupancy::Vacant => "vacant",
        };
        f.write_str(s)
    }
}

/// Laterals that must see the vehicle for the bay to count as occupied
///
/// Two thirds of the laterals, rounded up, and at least one.
pub fn occupancy_threshold(laterals: usize) -> usize {
    ((2 * laterals + 2) / 3).max(1)
}

pub struct Bay {
    id: String,
    name: String,
    state: BayState,
    depth: Length,
    dock_timeout: Duration,
    undock_timeout: Duration,
    range: RangeDetector,
    /// Ascending by intercept
    laterals: Vec<LateralDetector>,
    control: Sender<ControlCommand>,
    motion_mark: Option<Instant>,
    last_update: Option<Instant>,
}

impl Bay {
    /// Build a bay and its detectors from configuration
    ///
    /// Per-sensor settings are merged over the group defaults. Exactly one
    /// longitudinal sensor is required and every detector must come out of
    /// calibration ready.
    pub fn new(config: &BayConfig, control: Sender<ControlCommand>) -> Result<Self, BayError> {
        let longitudinal = match config.longitudinal.sensors.as_slice() {
            [only] => only.merged(&config.longitudinal.defaults),
            sensors => {
                return Err(BayError::Configuration(format!(
                    "bay {} needs exactly one longitudinal sensor, found {}",
                    config.id,
                    sensors.len()
                )))
            }
        };
        let range_name = longitudinal.name.clone().ok_or_else(|| {
            BayError::Configuration(format!("bay {}: longitudinal sensor has no name", config.id))
        })?;

        let mut range = RangeDetector::new(range_name);
        let defaults = RangeCalibration::default();
        range
            .configure(RangeCalibration {
                bay_depth: Some(config.depth),
                offset: longitudinal.offset.unwrap_or(defaults.offset),
                spread_park: longitudinal.spread_park,
                pct_warn: longitudinal.pct_warn,
                pct_crit: longitudinal.pct_crit,
                error_margin: longitudinal.error_margin.unwrap_or(defaults.error_margin),
            })
            .map_err(|e| BayError::Configuration(e.to_string()))?;

        let mut laterals = Vec::with_capacity(config.lateral.sensors.len());
        for settings in &config.lateral.sensors {
            let settings = settings.merged(&config.lateral.defaults);
            let name = settings.name.clone().ok_or_else(|| {
                BayError::Configuration(format!("bay {}: lateral sensor has no name", config.id))
            })?;
            let intercept = settings.intercept.ok_or_else(|| {
                BayError::Configuration(format!("bay {}: lateral {} has no intercept", config.id, name))
            })?;
            let defaults = LateralCalibration::default();
            let mut detector = LateralDetector::new(name);
            detector
                .configure(LateralCalibration {
                    offset: settings.offset.unwrap_or(defaults.offset),
                    spread_ok: settings.spread_ok,
                    spread_warn: settings.spread_warn,
                    side: settings.side,
                    intercept: Some(intercept),
                    limit: settings.limit.unwrap_or(defaults.limit),
                })
                .map_err(|e| BayError::Configuration(e.to_string()))?;
            laterals.push(detector);
        }
        laterals.sort_by(|a, b| intercept_cm(a).total_cmp(&intercept_cm(b)));

        info!(
            "[{}] bay '{}' configured: range {}, {} laterals",
            config.id,
            config.display_name(),
            range.id(),
            laterals.len()
        );

        Ok(Self {
            id: config.id.clone(),
            name: config.display_name().to_string(),
            state: BayState::Ready,
            depth: config.depth,
            dock_timeout: config.timeouts.dock_timeout(),
            undock_timeout: config.timeouts.undock_timeout(),
            range,
            laterals,
            control,
            motion_mark: None,
            last_update: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BayState {
        self.state
    }

    pub fn depth(&self) -> Length {
        self.depth
    }

    pub fn range(&self) -> &RangeDetector {
        &self.range
    }

    /// Lateral detectors in intercept order
    pub fn laterals(&self) -> &[LateralDetector] {
        &self.laterals
    }

    /// Every sensor this bay reads, range sensor first
    pub fn sensor_ids(&self) -> Vec<&str> {
        std::iter::once(self.range.id())
            .chain(self.laterals.iter().map(|l| l.id()))
            .collect()
    }

    pub fn dock(&mut self) -> Result<(), BayError> {
        self.start_motion(BayState::Docking, "dock")
    }

    pub fn undock(&mut self) -> Result<(), BayError> {
        self.start_motion(BayState::Undocking, "undock")
    }

    fn start_motion(&mut self, target: BayState, action: &'static str) -> Result<(), BayError> {
        if self.state != BayState::Ready {
            return Err(BayError::InvalidTransition {
                bay: self.id.clone(),
                from: self.state,
                action,
            });
        }
        self.request_all(TargetState::Ranging);
        self.state = target;
        self.motion_mark = Some(Instant::now());
        info!("[{}] {}", self.id, target);
        Ok(())
    }

    /// Leave a motion state immediately
    pub fn abort(&mut self) -> Result<(), BayError> {
        match self.state {
            BayState::Docking | BayState::Undocking => {
                info!("[{}] {} aborted", self.id, self.state);
                self.finish_motion();
                Ok(())
            }
            BayState::Ready => Ok(()),
            BayState::Unavailable => Err(BayError::InvalidTransition {
                bay: self.id.clone(),
                from: self.state,
                action: "abort",
            }),
        }
    }

    fn finish_motion(&mut self) {
        self.state = BayState::Ready;
        self.motion_mark = None;
    }

    /// Ask the manager to move every owned sensor to `target`
    fn request_all(&mut self, target: TargetState) {
        let detectors = std::iter::once(self.range.id().to_string())
            .chain(self.laterals.iter().map(|l| l.id().to_string()));
        for id in detectors {
            match self.control.try_send(ControlCommand::one(target, id.as_str())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("[{}] control channel full, {} not set {:?}", self.id, id, target)
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("[{}] sensor manager gone, {} not set {:?}", self.id, id, target)
                }
            }
        }
        self.range.set_requested_state(target);
        for lateral in &mut self.laterals {
            lateral.set_requested_state(target);
        }
    }

    fn timeout(&self) -> Duration {
        match self.state {
            BayState::Undocking => self.undock_timeout,
            _ => self.dock_timeout,
        }
    }

    pub fn check_timer(&mut self) {
        self.check_timer_at(Instant::now());
    }

    /// Extend the motion window while the vehicle moves, end it once idle
    pub fn check_timer_at(&mut self, now: Instant) {
        if !self.state.is_motion() {
            return;
        }
        if let Ok(Some(true)) = self.range.motion() {
            self.motion_mark = Some(now);
            return;
        }
        let mark = match self.motion_mark {
            Some(mark) => mark,
            None => {
                self.motion_mark = Some(now);
                return;
            }
        };
        if now.saturating_duration_since(mark) > self.timeout() {
            info!("[{}] {} timed out", self.id, self.state);
            self.finish_motion();
        }
    }

    /// Time left before the current motion state times out
    pub fn motion_timer(&self) -> Duration {
        self.motion_timer_at(Instant::now())
    }

    pub fn motion_timer_at(&self, now: Instant) -> Duration {
        match (self.state.is_motion(), self.motion_mark) {
            (true, Some(mark)) => self
                .timeout()
                .saturating_sub(now.saturating_duration_since(mark)),
            _ => Duration::ZERO,
        }
    }

    /// Feed a scan result to the detectors
    ///
    /// A response already seen is ignored, so the caller can hand over
    /// whatever its feed currently holds on every loop pass.
    pub fn update(&mut self, response: &SensorResponse) {
        if matches!(self.last_update, Some(last) if response.timestamp <= last) {
            return;
        }
        self.last_update = Some(response.timestamp);

        if let Some(reading) = response.get(self.range.id()) {
            self.range.record(reading);
            if reading.status == SensorStatus::Fault {
                if self.state != BayState::Unavailable {
                    warn!(
                        "[{}] range sensor {} faulted: {}",
                        self.id,
                        self.range.id(),
                        reading.fault_reason.as_deref().unwrap_or("no reason given")
                    );
                    self.state = BayState::Unavailable;
                    self.motion_mark = None;
                }
            } else if self.state == BayState::Unavailable {
                info!("[{}] range sensor {} recovered", self.id, self.range.id());
                self.state = BayState::Ready;
            }
        }
        for lateral in &mut self.laterals {
            if let Some(reading) = response.get(lateral.id()) {
                lateral.record(reading);
            }
        }

        if self.state.is_motion() {
            self.check_timer_at(response.timestamp);
        }
    }

    /// Occupancy from the range quality and lateral agreement
    pub fn occupied(&self) -> Occupancy {
        if !self.range.is_ranging() {
            return Occupancy::Unknown;
        }
        match self.range.quality() {
            Ok(RangeQuality::NoObject) | Ok(RangeQuality::DoorOpen) => Occupancy::Vacant,
            Ok(quality) if quality.vehicle_plausible() => {
                if self.laterals.is_empty() {
                    return Occupancy::Occupied;
                }
                let raw = self.range.raw();
                let present = self
                    .laterals
                    .iter()
                    .filter(|l| matches!(l.quality_at(raw), Ok(q) if q.object_present()))
                    .count();
                let needed = occupancy_threshold(self.laterals.len());
                debug!("[{}] {} laterals see the vehicle, {} needed", self.id, present, needed);
                if present >= needed {
                    Occupancy::Occupied
                } else {
                    Occupancy::Vacant
                }
            }
            _ => Occupancy::Unknown,
        }
    }

    pub fn range_quality(&self) -> RangeQuality {
        self.range.quality().unwrap_or(RangeQuality::Unknown)
    }

    /// Remaining distance as a fraction of the usable depth, 0 when unknown
    pub fn range_pct(&self) -> f64 {
        match (self.range.value(), self.range.usable_depth()) {
            (Ok(Some(value)), Some(usable)) => value.ratio(usable),
            _ => 0.0,
        }
    }

    pub fn vector(&self) -> Option<Vector> {
        self.range.vector().ok().flatten()
    }

    /// Lateral sensors and their intercepts, ascending
    pub fn lateral_order(&self) -> Vec<(&str, Length)> {
        self.laterals
            .iter()
            .map(|l| (l.id(), l.intercept().unwrap_or(Length::ZERO)))
            .collect()
    }

    /// Lateral qualities in intercept order
    pub fn lateral_qualities(&self) -> Vec<(&str, LateralQuality)> {
        let raw = self.range.raw();
        self.laterals
            .iter()
            .map(|l| (l.id(), l.quality_at(raw).unwrap_or(LateralQuality::Unknown)))
            .collect()
    }

    /// Ask the manager to disable every owned sensor
    pub fn shutdown(&mut self) {
        info!("[{}] shutting down", self.id);
        self.request_all(TargetState::Disabled);
        self.finish_motion();
    }
}

fn intercept_cm(detector: &LateralDetector) -> f64 {
    detector.intercept().map_or(0.0, |l| l.cm())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{Reading, Selector};
    use approx::assert_relative_eq;
    use crossbeam::channel::{bounded, Receiver};
    use serde_json::json;

    fn config_value() -> serde_json::Value {
        json!({
            "id": "bay1",
            "name": "Bay 1",
            "depth": 500,
            "timeouts": { "dock": 60, "undock": 30 },
            "longitudinal": {
                "defaults": { "spread_park": 5, "pct_warn": 70, "pct_crit": 30 },
                "sensors": [{ "name": "range", "offset": 50 }]
            },
            "lateral": {
                "defaults": { "spread_ok": 5, "spread_warn": 10, "side": "L", "offset": 30 },
                "sensors": [
                    { "name": "front", "intercept": 300 },
                    { "name": "rear", "intercept": 100 },
                    { "name": "middle", "intercept": 200 }
                ]
            }
        })
    }

    fn bay_from(value: serde_json::Value) -> Result<(Bay, Receiver<ControlCommand>), BayError> {
        let config: BayConfig = serde_json::from_value(value).unwrap();
        let (tx, rx) = bounded(64);
        Bay::new(&config, tx).map(|bay| (bay, rx))
    }

    fn bay() -> (Bay, Receiver<ControlCommand>) {
        bay_from(config_value()).unwrap()
    }

    fn cm(value: f64) -> Reading {
        Reading::range(Length::from_cm(value), None)
    }

    fn response(at: Instant, readings: Vec<(&str, Reading)>) -> SensorResponse {
        SensorResponse {
            timestamp: at,
            readings: readings
                .into_iter()
                .map(|(id, r)| (id.to_string(), r.at(at)))
                .collect(),
            scan_duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_occupancy_threshold() {
        assert_eq!(occupancy_threshold(0), 1);
        assert_eq!(occupancy_threshold(1), 1);
        assert_eq!(occupancy_threshold(2), 2);
        assert_eq!(occupancy_threshold(3), 2);
        assert_eq!(occupancy_threshold(4), 3);
        assert_eq!(occupancy_threshold(6), 4);
    }

    #[test]
    fn test_laterals_sorted_by_intercept() {
        let (bay, _rx) = bay();
        let order: Vec<&str> = bay.lateral_order().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec!["rear", "middle", "front"]);
        assert_eq!(bay.sensor_ids(), vec!["range", "rear", "middle", "front"]);
        assert_eq!(bay.name(), "Bay 1");
    }

    #[test]
    fn test_dock_requests_ranging() {
        let (mut bay, rx) = bay();
        bay.dock().unwrap();
        assert_eq!(bay.state(), BayState::Docking);

        let commands: Vec<ControlCommand> = rx.try_iter().collect();
        assert_eq!(commands.len(), 4);
        assert!(commands.iter().all(|c| c.target == TargetState::Ranging));
        assert_eq!(commands[0].sensor, Selector::Id("range".to_string()));
        assert_eq!(bay.range().requested_state(), TargetState::Ranging);

        assert!(matches!(
            bay.undock(),
            Err(BayError::InvalidTransition { from: BayState::Docking, action: "undock", .. })
        ));
    }

    #[test]
    fn test_abort_round_trip_leaves_no_stale_timer() {
        let (mut bay, _rx) = bay();
        bay.dock().unwrap();
        bay.abort().unwrap();
        assert_eq!(bay.state(), BayState::Ready);
        assert_eq!(bay.motion_timer(), Duration::ZERO);

        bay.check_timer_at(Instant::now() + Duration::from_secs(600));
        assert_eq!(bay.state(), BayState::Ready);

        // Abort while ready changes nothing
        bay.abort().unwrap();
        bay.undock().unwrap();
        assert_eq!(bay.state(), BayState::Undocking);
        assert!(bay.motion_timer() > Duration::from_secs(29));
    }

    #[test]
    fn test_motion_timeout_returns_to_ready() {
        let (mut bay, _rx) = bay();
        bay.dock().unwrap();
        let now = Instant::now();
        bay.check_timer_at(now + Duration::from_secs(30));
        assert_eq!(bay.state(), BayState::Docking);
        bay.check_timer_at(now + Duration::from_secs(61));
        assert_eq!(bay.state(), BayState::Ready);
    }

    #[test]
    fn test_movement_extends_motion_window() {
        let (mut bay, _rx) = bay();
        bay.dock().unwrap();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(50);
        bay.update(&response(t0, vec![("range", cm(400.0))]));
        bay.update(&response(t1, vec![("range", cm(300.0))]));
        assert_eq!(bay.motion_timer_at(t1 + Duration::from_secs(10)), Duration::from_secs(50));

        let v = bay.vector().unwrap();
        assert_eq!(v.direction, crate::detector::Direction::Forward);

        // Vehicle settles; window runs out from the last movement
        let t2 = t1 + Duration::from_secs(1);
        bay.update(&response(t2, vec![("range", cm(300.0))]));
        assert_eq!(bay.state(), BayState::Docking);
        bay.check_timer_at(t1 + Duration::from_secs(61));
        assert_eq!(bay.state(), BayState::Ready);
    }

    #[test]
    fn test_occupancy_needs_lateral_supermajority() {
        let (mut bay, _rx) = bay();
        let t0 = Instant::now();
        assert_eq!(bay.occupied(), Occupancy::Unknown);

        bay.update(&response(
            t0,
            vec![
                ("range", cm(52.0)),
                ("rear", cm(32.0)),
                ("middle", cm(300.0)),
                ("front", cm(300.0)),
            ],
        ));
        assert_eq!(bay.range_quality(), RangeQuality::Park);
        assert_eq!(bay.occupied(), Occupancy::Vacant);

        bay.update(&response(
            t0 + Duration::from_millis(100),
            vec![
                ("range", cm(52.0)),
                ("rear", cm(32.0)),
                ("middle", cm(38.0)),
                ("front", cm(300.0)),
            ],
        ));
        assert_eq!(bay.occupied(), Occupancy::Occupied);
        let qualities: Vec<LateralQuality> =
            bay.lateral_qualities().into_iter().map(|(_, q)| q).collect();
        assert_eq!(
            qualities,
            vec![LateralQuality::Ok, LateralQuality::Warning, LateralQuality::NoVehicle]
        );
    }

    #[test]
    fn test_empty_bay_is_vacant() {
        let (mut bay, _rx) = bay();
        bay.update(&response(Instant::now(), vec![("range", cm(480.0))]));
        assert_eq!(bay.range_quality(), RangeQuality::NoObject);
        assert_eq!(bay.occupied(), Occupancy::Vacant);

        bay.update(&response(
            Instant::now() + Duration::from_millis(10),
            vec![("range", Reading::status(SensorStatus::NotRanging))],
        ));
        assert_eq!(bay.occupied(), Occupancy::Unknown);
    }

    #[test]
    fn test_no_laterals_trusts_range() {
        let mut value = config_value();
        value["lateral"] = json!({});
        let (mut bay, _rx) = bay_from(value).unwrap();
        bay.update(&response(Instant::now(), vec![("range", cm(150.0))]));
        assert_eq!(bay.range_quality(), RangeQuality::Final);
        assert_eq!(bay.occupied(), Occupancy::Occupied);
    }

    #[test]
    fn test_range_pct() {
        let (mut bay, _rx) = bay();
        assert_eq!(bay.range_pct(), 0.0);
        bay.update(&response(Instant::now(), vec![("range", cm(275.0))]));
        assert_relative_eq!(bay.range_pct(), 0.5);
    }

    #[test]
    fn test_range_fault_makes_bay_unavailable() {
        let (mut bay, _rx) = bay();
        bay.dock().unwrap();
        let t0 = Instant::now();
        bay.update(&response(t0, vec![("range", Reading::fault("Did not initialize."))]));
        assert_eq!(bay.state(), BayState::Unavailable);
        assert_eq!(bay.motion_timer(), Duration::ZERO);
        assert!(matches!(
            bay.dock(),
            Err(BayError::InvalidTransition { from: BayState::Unavailable, .. })
        ));
        assert!(bay.abort().is_err());

        bay.update(&response(t0 + Duration::from_millis(50), vec![("range", cm(300.0))]));
        assert_eq!(bay.state(), BayState::Ready);
    }

    #[test]
    fn test_repeated_response_ignored() {
        let (mut bay, _rx) = bay();
        let r = response(Instant::now(), vec![("range", cm(300.0))]);
        bay.update(&r);
        bay.update(&r);
        assert_eq!(bay.range().history_len(), 1);
    }

    #[test]
    fn test_shutdown_disables_sensors() {
        let (mut bay, rx) = bay();
        bay.dock().unwrap();
        rx.try_iter().count();
        bay.shutdown();
        let commands: Vec<ControlCommand> = rx.try_iter().collect();
        assert_eq!(commands.len(), 4);
        assert!(commands.iter().all(|c| c.target == TargetState::Disabled));
        assert_eq!(bay.state(), BayState::Ready);
    }

    #[test]
    fn test_configuration_errors() {
        let mut value = config_value();
        value["longitudinal"]["sensors"] = json!([]);
        assert!(matches!(bay_from(value), Err(BayError::Configuration(_))));

        let mut value = config_value();
        value["longitudinal"]["sensors"] = json!([{ "name": "a" }, { "name": "b" }]);
        assert!(matches!(bay_from(value), Err(BayError::Configuration(_))));

        let mut value = config_value();
        value["longitudinal"]["defaults"] = json!({ "spread_park": 5 });
        match bay_from(value) {
            Err(BayError::Configuration(msg)) => assert!(msg.contains("pct_warn")),
            _ => panic!("expected configuration error"),
        }

        let mut value = config_value();
        value["lateral"]["sensors"][0] = json!({ "name": "front" });
        assert!(matches!(bay_from(value), Err(BayError::Configuration(_))));

        let mut value = config_value();
        value["lateral"]["defaults"]["side"] = json!(null);
        assert!(matches!(bay_from(value), Err(BayError::Configuration(_))));
    }
}
