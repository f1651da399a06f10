//! Sensor manager
//!
//! Owns every configured sensor and polls them on its own thread. Results
//! leave through a single-slot channel where a newer response replaces an
//! unread older one; state changes arrive on a control channel and are
//! applied at the top of each scan.
//!
//! # Example
//!
//! ```ignore
//! let (manager, link) = SensorManager::new(&config, &mut platform)?;
//! let handle = manager.spawn()?;
//!
//! let mut feed = SensorFeed::new(link.responses);
//! loop {
//!     if let Some(response) = feed.poll() {
//!         bay.update(response);
//!     }
//! }
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use log::{debug, error, info, warn};

use crate::bus::BusResourceManager;
use crate::config::{SensorConfig, SensorHardware, SystemConfig};
use crate::error::{ManagerError, SensorError};
use crate::hw::{OutputPin, Platform};
use crate::reading::{
    ControlCommand, Reading, Selector, SensorId, SensorResponse, SensorState, TargetState,
};
use crate::sensors::{I2cTof, SensorDriver, SerialTof};

/// Scan durations kept for the average
const SCAN_LOG_LEN: usize = 100;
/// Pending control commands before senders see the channel as full
const CONTROL_CAPACITY: usize = 64;
const INIT_FAILURE: &str = "Did not initialize.";

/// One configured sensor; `driver` is `None` when construction failed
struct SensorSlot {
    name: SensorId,
    driver: Option<Box<dyn SensorDriver>>,
    failure: Option<String>,
}

/// Consumer side of the manager's channels
pub struct SensorLink {
    pub responses: Receiver<SensorResponse>,
    pub control: Sender<ControlCommand>,
}

/// Diagnostic view of one slot
#[derive(Debug, Clone, PartialEq)]
pub struct SensorInfo {
    pub name: SensorId,
    pub interface: Option<String>,
    pub state: SensorState,
    pub failure: Option<String>,
}

pub struct SensorManager {
    slots: Vec<SensorSlot>,
    control: Receiver<ControlCommand>,
    output: Sender<SensorResponse>,
    /// Receiver clone used to discard an unread response before sending
    stale: Receiver<SensorResponse>,
    scan_interval: Duration,
    scan_log: VecDeque<Duration>,
    terminate: Arc<AtomicBool>,
    bus: Option<BusResourceManager>,
}

impl SensorManager {
    /// Build every configured sensor
    ///
    /// Order matters for the I2C sensors: the bus is powered, expanders are
    /// reset and every host enable line is driven low before the first
    /// sensor is brought up, so each unit is alone at the default address
    /// when its turn comes.
    pub fn new(
        config: &SystemConfig,
        platform: &mut dyn Platform,
    ) -> Result<(Self, SensorLink), ManagerError> {
        let generous = config.generous_recovery;
        let mut bus = BusResourceManager::new(config.i2c.as_ref(), platform)?;
        if let Err(e) = bus.enable_bus() {
            if !generous {
                return Err(e.into());
            }
            error!("I2C bus unavailable, dependent sensors will fault: {}", e);
        }

        let expanders: BTreeSet<(u8, u8)> = config
            .sensors
            .iter()
            .filter_map(|s| match &s.hardware {
                SensorHardware::I2c(cfg) if cfg.enable_board != 0 => {
                    Some((cfg.bus, cfg.enable_board))
                }
                _ => None,
            })
            .collect();
        if let Err(e) = bus.reset_expanders(&expanders, platform) {
            if !generous {
                return Err(e.into());
            }
            error!("GPIO expander reset failed: {}", e);
        }

        let mut host_pins = Self::lower_host_pins(&config.sensors, platform);

        let mut slots = Vec::with_capacity(config.sensors.len());
        for sensor in &config.sensors {
            match Self::build_sensor(sensor, &mut bus, platform, &mut host_pins) {
                Ok(driver) => {
                    info!("[{}] ready on {}", sensor.name, driver.interface());
                    slots.push(SensorSlot {
                        name: sensor.name.clone(),
                        driver: Some(driver),
                        failure: None,
                    });
                }
                Err(e) if generous => {
                    error!("[{}] {} {}", sensor.name, INIT_FAILURE, e);
                    slots.push(SensorSlot {
                        name: sensor.name.clone(),
                        driver: None,
                        failure: Some(INIT_FAILURE.to_string()),
                    });
                }
                Err(e) => {
                    return Err(ManagerError::Sensor {
                        name: sensor.name.clone(),
                        source: e,
                    })
                }
            }
        }

        let (mut manager, link) = Self::with_slots(slots, config.scan_interval());
        manager.bus = Some(bus);
        Ok((manager, link))
    }

    /// Manager over already built drivers
    pub fn from_drivers(
        drivers: Vec<Box<dyn SensorDriver>>,
        scan_interval: Duration,
    ) -> (Self, SensorLink) {
        let slots = drivers
            .into_iter()
            .map(|driver| SensorSlot {
                name: driver.name().to_string(),
                driver: Some(driver),
                failure: None,
            })
            .collect();
        Self::with_slots(slots, scan_interval)
    }

    fn with_slots(slots: Vec<SensorSlot>, scan_interval: Duration) -> (Self, SensorLink) {
        let (output, responses) = bounded(1);
        let (control_tx, control) = bounded(CONTROL_CAPACITY);
        let manager = Self {
            slots,
            control,
            output,
            stale: responses.clone(),
            scan_interval,
            scan_log: VecDeque::with_capacity(SCAN_LOG_LEN),
            terminate: Arc::new(AtomicBool::new(false)),
            bus: None,
        };
        let link = SensorLink {
            responses,
            control: control_tx,
        };
        (manager, link)
    }

    /// Open and drive low every host GPIO enable line
    fn lower_host_pins(
        sensors: &[SensorConfig],
        platform: &mut dyn Platform,
    ) -> HashMap<SensorId, Box<dyn OutputPin>> {
        let mut pins = HashMap::new();
        for sensor in sensors {
            let cfg = match &sensor.hardware {
                SensorHardware::I2c(cfg) if cfg.enable_board == 0 => cfg,
                _ => continue,
            };
            let pin = platform.output_pin(cfg.enable_pin).and_then(|mut pin| {
                pin.set_low()?;
                Ok(pin)
            });
            match pin {
                Ok(pin) => {
                    pins.insert(sensor.name.clone(), pin);
                }
                Err(e) => warn!("[{}] enable pin {}: {}", sensor.name, cfg.enable_pin, e),
            }
        }
        pins
    }

    fn build_sensor(
        sensor: &SensorConfig,
        bus: &mut BusResourceManager,
        platform: &mut dyn Platform,
        host_pins: &mut HashMap<SensorId, Box<dyn OutputPin>>,
    ) -> Result<Box<dyn SensorDriver>, SensorError> {
        match &sensor.hardware {
            SensorHardware::Serial(cfg) => {
                Ok(Box::new(SerialTof::new(&sensor.name, cfg, platform)?))
            }
            SensorHardware::I2c(cfg) => {
                let handle = bus.bus_handle(cfg.bus, platform)?;
                let enable: Box<dyn OutputPin> = if cfg.enable_board == 0 {
                    host_pins.remove(&sensor.name).ok_or_else(|| {
                        SensorError::Configuration(format!(
                            "host pin {} unavailable",
                            cfg.enable_pin
                        ))
                    })?
                } else {
                    Box::new(bus.expander_pin(cfg.bus, cfg.enable_board, cfg.enable_pin)?)
                };
                Ok(Box::new(I2cTof::new(&sensor.name, cfg, handle, enable)?))
            }
        }
    }

    /// One scan: apply pending control, poll everything, publish
    pub fn scan(&mut self) -> SensorResponse {
        self.apply_control();

        let timestamp = Instant::now();
        let mut readings = HashMap::with_capacity(self.slots.len());
        for slot in &mut self.slots {
            let reading = match slot.driver.as_mut() {
                Some(driver) => driver.poll(),
                None => Reading::fault(slot.failure.as_deref().unwrap_or(INIT_FAILURE)),
            };
            readings.insert(slot.name.clone(), reading.at(timestamp));
        }
        let scan_duration = timestamp.elapsed();

        if self.scan_log.len() == SCAN_LOG_LEN {
            self.scan_log.pop_front();
        }
        self.scan_log.push_back(scan_duration);

        let response = SensorResponse {
            timestamp,
            readings,
            scan_duration,
        };
        self.publish(response.clone());
        response
    }

    /// Newest wins: drop an unread response, then offer this one
    fn publish(&self, response: SensorResponse) {
        while self.stale.try_recv().is_ok() {}
        match self.output.try_send(response) {
            Ok(()) => {}
            // Consumer raced us to the slot; the value it got is just as fresh
            Err(TrySendError::Full(_)) => debug!("output slot refilled during publish"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn apply_control(&mut self) {
        loop {
            match self.control.try_recv() {
                Ok(command) => {
                    let sensor = match &command.sensor {
                        Selector::All => None,
                        Selector::Id(id) => Some(id.as_str()),
                    };
                    if let Err(e) = self.set_sensor_state(command.target, sensor) {
                        warn!("control {:?} rejected: {}", command, e);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Move one sensor, or all live sensors, to `target`
    pub fn set_sensor_state(
        &mut self,
        target: TargetState,
        sensor: Option<&str>,
    ) -> Result<(), ManagerError> {
        match sensor {
            Some(id) => {
                let slot = self
                    .slots
                    .iter_mut()
                    .find(|s| s.name == id)
                    .ok_or_else(|| ManagerError::UnknownSensor(id.to_string()))?;
                Self::apply_to_slot(slot, target)
            }
            None => {
                let mut first_error = None;
                for slot in self.slots.iter_mut().filter(|s| s.driver.is_some()) {
                    if let Err(e) = Self::apply_to_slot(slot, target) {
                        warn!("{}", e);
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Same as [`set_sensor_state`](Self::set_sensor_state) with the state by name
    pub fn set_sensor_state_named(
        &mut self,
        target: &str,
        sensor: Option<&str>,
    ) -> Result<(), ManagerError> {
        let target: TargetState = target.parse()?;
        self.set_sensor_state(target, sensor)
    }

    fn apply_to_slot(slot: &mut SensorSlot, target: TargetState) -> Result<(), ManagerError> {
        let driver = slot
            .driver
            .as_mut()
            .ok_or_else(|| ManagerError::SensorFaulted(slot.name.clone()))?;
        debug!("[{}] {} -> {:?}", slot.name, driver.state(), target);
        driver.set_state(target).map_err(|e| ManagerError::Sensor {
            name: slot.name.clone(),
            source: e,
        })
    }

    /// Scan until the termination flag is raised, then shut down
    pub fn loop_forever(&mut self) {
        info!("sensor manager running with {} sensors", self.slots.len());
        while !self.terminate.load(Ordering::SeqCst) {
            self.scan();
            if !self.scan_interval.is_zero() {
                thread::sleep(self.scan_interval);
            }
        }
        self.shutdown();
        info!("sensor manager stopped");
    }

    /// Run [`loop_forever`](Self::loop_forever) on a dedicated thread
    pub fn spawn(mut self) -> Result<SensorManagerHandle, ManagerError> {
        let terminate = self.terminate.clone();
        let thread = thread::Builder::new()
            .name("sensor-manager".to_string())
            .spawn(move || self.loop_forever())
            .map_err(ManagerError::Thread)?;
        Ok(SensorManagerHandle {
            terminate,
            thread: Some(thread),
        })
    }

    /// Flag checked at the top of every scan
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }

    /// Disable every live sensor
    pub fn shutdown(&mut self) {
        for slot in &mut self.slots {
            if let Some(driver) = slot.driver.as_mut() {
                if let Err(e) = driver.set_state(TargetState::Disabled) {
                    warn!("[{}] shutdown: {}", slot.name, e);
                }
            }
        }
    }

    /// Slots in configuration order
    pub fn enumerate_sensors(&self) -> Vec<SensorInfo> {
        self.slots
            .iter()
            .map(|slot| SensorInfo {
                name: slot.name.clone(),
                interface: slot.driver.as_ref().map(|d| d.interface()),
                state: slot
                    .driver
                    .as_ref()
                    .map_or(SensorState::Fault, |d| d.state()),
                failure: slot.failure.clone(),
            })
            .collect()
    }

    /// Mean duration of the recent scans
    pub fn average_scan_time(&self) -> Option<Duration> {
        if self.scan_log.is_empty() {
            return None;
        }
        let total: Duration = self.scan_log.iter().sum();
        Some(total / self.scan_log.len() as u32)
    }

    pub fn bus(&self) -> Option<&BusResourceManager> {
        self.bus.as_ref()
    }
}

/// Handle to a manager running on its own thread
pub struct SensorManagerHandle {
    terminate: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SensorManagerHandle {
    /// Ask the manager to stop after the current scan
    pub fn stop(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Stop and wait for the thread to exit
    pub fn join(mut self) -> thread::Result<()> {
        self.stop();
        match self.thread.take() {
            Some(thread) => thread.join(),
            None => Ok(()),
        }
    }
}

impl Drop for SensorManagerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("sensor manager thread panicked");
            }
        }
    }
}
