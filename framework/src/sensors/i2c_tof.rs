//! VL53L1X-class ToF sensor on a shared I2C bus
//!
//! Every unit powers up at 0x29. Enabling one raises its XSHUT line, waits
//! for the firmware, then moves it to its configured address so the next
//! unit can come up behind it.

use std::io;
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};
use vl53l1x::{DistanceMode, Vl53l1x, DEFAULT_ADDRESS};

use super::{retry, SensorDriver};
use crate::config::I2cTofConfig;
use crate::error::SensorError;
use crate::hw::{BusHandle, OutputPin};
use crate::reading::{Reading, SensorState, SensorStatus};
use crate::units::Length;

/// Bring-up attempts before the sensor is declared faulted
const ENABLE_ATTEMPTS: u32 = 3;
/// At or below this the target is too close to range reliably
const TOO_CLOSE_CM: f64 = 4.0;
/// Beyond this the long-distance mode no longer ranges reliably
const MAX_RANGE_CM: f64 = 400.0;

pub struct I2cTof {
    name: String,
    config: I2cTofConfig,
    handle: BusHandle,
    enable_pin: Box<dyn OutputPin>,
    device: Option<Vl53l1x<BusHandle>>,
    state: SensorState,
    fault: Option<String>,
}

fn device_error(sensor: &str, e: vl53l1x::Error<io::Error>) -> SensorError {
    match e {
        vl53l1x::Error::I2c(io) => SensorError::transient(sensor, io),
        vl53l1x::Error::InvalidModel(id) => {
            SensorError::fault(sensor, format!("unexpected model id 0x{:04X}", id))
        }
        vl53l1x::Error::InvalidAddress(addr) => {
            SensorError::Configuration(format!("{}: invalid address 0x{:02X}", sensor, addr))
        }
        vl53l1x::Error::Timeout => SensorError::fault(sensor, "no measurement during init"),
    }
}

impl I2cTof {
    /// Build and bring up the sensor
    ///
    /// The enable line must already be low for every other unit still at
    /// the default address.
    pub fn new(
        name: &str,
        config: &I2cTofConfig,
        handle: BusHandle,
        enable_pin: Box<dyn OutputPin>,
    ) -> Result<Self, SensorError> {
        let mut sensor = Self {
            name: name.to_string(),
            config: config.clone(),
            handle,
            enable_pin,
            device: None,
            state: SensorState::Disabled,
            fault: None,
        };
        sensor.enable()?;
        if config.always_range {
            sensor.start_ranging()?;
        }
        Ok(sensor)
    }

    pub fn address(&self) -> u8 {
        self.config.address
    }

    fn power_cycle(&mut self) -> Result<(), SensorError> {
        let settle = self.config.settle();
        self.enable_pin
            .set_low()
            .and_then(|_| {
                thread::sleep(settle);
                self.enable_pin.set_high()
            })
            .map_err(|e| SensorError::transient(&self.name, e))?;
        thread::sleep(settle);
        Ok(())
    }

    fn wait_for_boot(&self, device: &mut Vl53l1x<BusHandle>) -> Result<(), SensorError> {
        let timeout = self.config.boot_timeout();
        let start = Instant::now();
        loop {
            // The device NACKs until it is far enough into boot
            if let Ok(true) = device.booted() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(SensorError::fault(
                    &self.name,
                    format!("not booted after {:?}", timeout),
                ));
            }
            thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    fn bring_up(&mut self) -> Result<Vl53l1x<BusHandle>, SensorError> {
        self.power_cycle()?;

        let mut device = Vl53l1x::new(self.handle.clone(), DEFAULT_ADDRESS);
        self.wait_for_boot(&mut device)?;
        device.init().map_err(|e| device_error(&self.name, e))?;
        if self.config.address != DEFAULT_ADDRESS {
            device
                .set_address(self.config.address)
                .map_err(|e| device_error(&self.name, e))?;
        }
        let mode: DistanceMode = self.config.distance_mode.into();
        device
            .set_distance_mode(mode)
            .and_then(|_| device.set_timing_budget(self.config.timing_budget))
            .map_err(|e| device_error(&self.name, e))?;
        Ok(device)
    }

    fn mark_fault(&mut self, reason: String) -> Reading {
        if self.state != SensorState::Fault {
            warn!("[{}] faulted: {}", self.name, reason);
        }
        self.state = SensorState::Fault;
        self.fault = Some(reason.clone());
        Reading::fault(reason)
    }

    fn read_measurement(&mut self) -> Result<Reading, SensorError> {
        let name = self.name.as_str();
        let max_retries = self.config.max_retries;
        let device = match self.device.as_mut() {
            Some(device) => device,
            None => return Ok(Reading::status(SensorStatus::NotRanging)),
        };

        let ready = retry(name, "data ready", max_retries, || {
            device.data_ready().map_err(|e| device_error(name, e))
        })?;
        if !ready {
            return Ok(Reading::status(SensorStatus::InterruptNotReady));
        }

        let distance = retry(name, "distance read", max_retries, || {
            device.distance_mm().map_err(|e| device_error(name, e))
        })?;
        retry(name, "interrupt clear", max_retries, || {
            device.clear_interrupt().map_err(|e| device_error(name, e))
        })?;

        let reading = match distance {
            None => Reading::status(SensorStatus::NotRanging),
            Some(mm) => {
                let distance = Length::from_mm(f64::from(mm));
                if distance.cm() <= TOO_CLOSE_CM {
                    Reading::status(SensorStatus::TooClose)
                } else if distance.cm() > MAX_RANGE_CM {
                    Reading::status(SensorStatus::TooFar)
                } else {
                    Reading::range(distance, None)
                }
            }
        };
        Ok(reading)
    }
}

impl SensorDriver for I2cTof {
    fn name(&self) -> &str {
        &self.name
    }

    fn interface(&self) -> String {
        format!("i2c-{} @ 0x{:02X}", self.handle.bus(), self.config.address)
    }

    fn state(&self) -> SensorState {
        self.state
    }

    fn enable(&mut self) -> Result<(), SensorError> {
        let mut last_error = None;
        for attempt in 1..=ENABLE_ATTEMPTS {
            match self.bring_up() {
                Ok(device) => {
                    self.device = Some(device);
                    self.state = SensorState::Enabled;
                    self.fault = None;
                    info!("[{}] enabled at 0x{:02X}", self.name, self.config.address);
                    return Ok(());
                }
                Err(e) => {
                    debug!("[{}] enable attempt {}/{} failed: {}", self.name, attempt, ENABLE_ATTEMPTS, e);
                    last_error = Some(e);
                }
            }
        }

        // Leave the unit powered down so it cannot squat on the default address
        if let Err(e) = self.enable_pin.set_low() {
            debug!("[{}] could not drop enable line: {}", self.name, e);
        }
        self.device = None;
        let reason = match last_error {
            Some(e) => format!("enable failed after {} attempts: {}", ENABLE_ATTEMPTS, e),
            None => "enable failed".to_string(),
        };
        self.mark_fault(reason.clone());
        Err(SensorError::fault(&self.name, reason))
    }

    fn disable(&mut self) -> Result<(), SensorError> {
        if self.state == SensorState::Ranging {
            if let Err(e) = self.stop_ranging() {
                debug!("[{}] stop before disable failed: {}", self.name, e);
            }
        }
        self.device = None;
        self.enable_pin
            .set_low()
            .map_err(|e| SensorError::transient(&self.name, e))?;
        self.state = SensorState::Disabled;
        debug!("[{}] disabled", self.name);
        Ok(())
    }

    fn start_ranging(&mut self) -> Result<(), SensorError> {
        let name = self.name.as_str();
        let max_retries = self.config.max_retries;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| SensorError::fault(name, "start ranging while not enabled"))?;
        retry(name, "start ranging", max_retries, || {
            device.start_ranging().map_err(|e| device_error(name, e))
        })?;
        self.state = SensorState::Ranging;
        debug!("[{}] ranging", self.name);
        Ok(())
    }

    fn stop_ranging(&mut self) -> Result<(), SensorError> {
        let name = self.name.as_str();
        let max_retries = self.config.max_retries;
        if let Some(device) = self.device.as_mut() {
            retry(name, "stop ranging", max_retries, || {
                device.stop_ranging().map_err(|e| device_error(name, e))
            })?;
        }
        if self.state == SensorState::Ranging {
            self.state = SensorState::Enabled;
        }
        Ok(())
    }

    fn poll(&mut self) -> Reading {
        match self.state {
            SensorState::Fault => {
                let reason = self.fault.clone().unwrap_or_else(|| "fault".to_string());
                Reading::fault(reason)
            }
            SensorState::Ranging => match self.read_measurement() {
                Ok(reading) => reading,
                Err(e) => self.mark_fault(e.to_string()),
            },
            _ => Reading::status(SensorStatus::NotRanging),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistanceModeSetting;
    use crate::hw::sim::{SimI2cBus, SimPlatform, SimTofHandle, SimVl53l1x};
    use crate::hw::Platform;
    use vl53l1x::TimingBudget;

    fn config(address: u8, pin: u8) -> I2cTofConfig {
        I2cTofConfig {
            bus: 1,
            address,
            enable_board: 0,
            enable_pin: pin,
            timing_budget: TimingBudget::Ms50,
            distance_mode: DistanceModeSetting::Short,
            max_retries: 5,
            always_range: false,
            settle_ms: 0,
            boot_timeout_ms: 10,
        }
    }

    struct Bench {
        platform: SimPlatform,
        bus: SimI2cBus,
        handle: BusHandle,
    }

    impl Bench {
        fn new() -> Self {
            let bus = SimI2cBus::new();
            Self {
                platform: SimPlatform::new(),
                handle: BusHandle::new(1, Box::new(bus.clone())),
                bus,
            }
        }

        fn add_device(&mut self, pin: u8, distance_mm: Option<u16>) -> SimTofHandle {
            let (device, handle) = SimVl53l1x::new(self.platform.line(pin), distance_mm);
            self.bus.attach(device);
            handle
        }

        fn sensor(&mut self, name: &str, address: u8, pin: u8) -> Result<I2cTof, SensorError> {
            let enable = self.platform.output_pin(pin).unwrap();
            I2cTof::new(name, &config(address, pin), self.handle.clone(), enable)
        }
    }

    #[test]
    fn test_units_share_bus_after_remap() {
        let mut bench = Bench::new();
        let left = bench.add_device(5, Some(800));
        let right = bench.add_device(6, Some(1200));

        let mut a = bench.sensor("left", 0x30, 5).unwrap();
        let mut b = bench.sensor("right", 0x31, 6).unwrap();
        assert_eq!(left.address(), 0x30);
        assert_eq!(right.address(), 0x31);

        a.start_ranging().unwrap();
        b.start_ranging().unwrap();
        assert_eq!(a.poll().distance, Some(Length::from_cm(80.0)));
        assert_eq!(b.poll().distance, Some(Length::from_cm(120.0)));
        assert_eq!(a.interface(), "i2c-1 @ 0x30");
    }

    #[test]
    fn test_too_close_has_no_distance() {
        let mut bench = Bench::new();
        let tof = bench.add_device(5, Some(30));
        let mut sensor = bench.sensor("range", 0x30, 5).unwrap();
        sensor.set_state(crate::reading::TargetState::Ranging).unwrap();

        let reading = sensor.poll();
        assert_eq!(reading.status, SensorStatus::TooClose);
        assert_eq!(reading.distance, None);

        tof.set_distance_mm(None);
        assert_eq!(sensor.poll().status, SensorStatus::NotRanging);
    }

    #[test]
    fn test_beyond_max_range_is_too_far() {
        let mut bench = Bench::new();
        let tof = bench.add_device(5, Some(4000));
        let mut sensor = bench.sensor("side", 0x30, 5).unwrap();
        sensor.set_state(crate::reading::TargetState::Ranging).unwrap();
        assert_eq!(sensor.poll().distance, Some(Length::from_cm(400.0)));

        tof.set_distance_mm(Some(4500));
        let reading = sensor.poll();
        assert_eq!(reading.status, SensorStatus::TooFar);
        assert_eq!(reading.distance, None);
    }

    #[test]
    fn test_not_ranging_and_interrupt_not_ready() {
        let mut bench = Bench::new();
        let tof = bench.add_device(5, Some(900));
        let mut sensor = bench.sensor("range", 0x30, 5).unwrap();
        assert_eq!(sensor.state(), SensorState::Enabled);
        assert_eq!(sensor.poll().status, SensorStatus::NotRanging);

        sensor.start_ranging().unwrap();
        tof.hold_interrupt(true);
        assert_eq!(sensor.poll().status, SensorStatus::InterruptNotReady);
        tof.hold_interrupt(false);
        assert_eq!(sensor.poll().status, SensorStatus::Ok);
    }

    #[test]
    fn test_transient_bus_errors_retried() {
        let mut bench = Bench::new();
        bench.add_device(5, Some(900));
        let mut sensor = bench.sensor("range", 0x30, 5).unwrap();
        sensor.start_ranging().unwrap();

        bench.bus.fail_next(3);
        assert_eq!(sensor.poll().distance, Some(Length::from_cm(90.0)));
    }

    #[test]
    fn test_retry_bound_faults_until_reenabled() {
        let mut bench = Bench::new();
        bench.add_device(5, Some(900));
        let mut sensor = bench.sensor("range", 0x30, 5).unwrap();
        sensor.start_ranging().unwrap();

        bench.bus.fail_next(6);
        let reading = sensor.poll();
        assert_eq!(reading.status, SensorStatus::Fault);
        assert_eq!(sensor.state(), SensorState::Fault);
        assert_eq!(sensor.poll().status, SensorStatus::Fault);

        sensor.set_state(crate::reading::TargetState::Ranging).unwrap();
        assert_eq!(sensor.poll().status, SensorStatus::Ok);
    }

    #[test]
    fn test_missing_device_fails_enable() {
        let mut bench = Bench::new();
        let err = bench.sensor("ghost", 0x30, 5).err().unwrap();
        assert!(matches!(err, SensorError::DeviceFault { .. }));
    }

    #[test]
    fn test_disable_powers_down() {
        let mut bench = Bench::new();
        let tof = bench.add_device(5, Some(900));
        let mut sensor = bench.sensor("range", 0x30, 5).unwrap();
        sensor.start_ranging().unwrap();
        assert!(tof.is_ranging());

        sensor.disable().unwrap();
        assert_eq!(sensor.state(), SensorState::Disabled);
        assert!(!bench.platform.line(5).is_high());
        assert_eq!(sensor.poll().status, SensorStatus::NotRanging);

        sensor.set_state(crate::reading::TargetState::Ranging).unwrap();
        assert_eq!(tof.boots(), 2);
        assert_eq!(tof.address(), 0x30);
    }
}
