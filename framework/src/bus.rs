//! I2C bus and GPIO expander lifecycle
//!
//! The VL53L1X boots at a fixed address, so units sharing a bus are brought
//! up one at a time behind individual enable lines. Those lines live either
//! on host GPIO or on AW9523 expanders, which are reset to a known state
//! before any sensor is touched.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::I2cBusConfig;
use crate::error::BusError;
use crate::hw::aw9523::{Aw9523, ExpanderPin};
use crate::hw::{BusHandle, InputPin, OutputPin, Platform};

/// Enable and ready lines of a controlled bus
struct BusControl {
    config: I2cBusConfig,
    enable: Box<dyn OutputPin>,
    ready: Box<dyn InputPin>,
}

pub struct BusResourceManager {
    control: Option<BusControl>,
    handles: HashMap<u8, BusHandle>,
    /// Configured expanders by (bus, address)
    expanders: HashMap<(u8, u8), Arc<Mutex<Aw9523>>>,
    /// Buses that failed to come up; cleared only by a successful reset
    unavailable: BTreeSet<u8>,
}

impl BusResourceManager {
    /// Set up bus control from the optional bus section
    ///
    /// Without a bus section every bus is assumed always powered.
    pub fn new(config: Option<&I2cBusConfig>, platform: &mut dyn Platform) -> Result<Self, BusError> {
        let control = match config {
            Some(cfg) => Some(BusControl {
                config: cfg.clone(),
                enable: platform.output_pin(cfg.enable_pin)?,
                ready: platform.input_pin(cfg.ready_pin)?,
            }),
            None => None,
        };
        Ok(Self {
            control,
            handles: HashMap::new(),
            expanders: HashMap::new(),
            unavailable: BTreeSet::new(),
        })
    }

    /// Bus switched by the enable line, if any
    pub fn controlled_bus(&self) -> Option<u8> {
        self.control.as_ref().map(|c| c.config.bus)
    }

    /// Power the bus and wait for its ready line
    ///
    /// A timeout marks the bus unavailable until [`reset_bus`](Self::reset_bus)
    /// succeeds.
    pub fn enable_bus(&mut self) -> Result<(), BusError> {
        let control = match self.control.as_mut() {
            Some(control) => control,
            None => return Ok(()),
        };
        let bus = control.config.bus;
        if self.unavailable.contains(&bus) {
            return Err(BusError::Unavailable(bus));
        }

        control.enable.set_high()?;
        match Self::wait_ready(control, true) {
            Ok(()) => {
                info!("I2C bus {} ready", bus);
                Ok(())
            }
            Err(e) => {
                warn!("I2C bus {} unavailable: {}", bus, e);
                self.unavailable.insert(bus);
                Err(e)
            }
        }
    }

    pub fn disable_bus(&mut self) -> Result<(), BusError> {
        let control = match self.control.as_mut() {
            Some(control) => control,
            None => return Ok(()),
        };
        control.enable.set_low()?;
        Self::wait_ready(control, false)?;
        debug!("I2C bus {} disabled", control.config.bus);
        Ok(())
    }

    /// Disable then enable, clearing a previous unavailability on success
    pub fn reset_bus(&mut self) -> Result<(), BusError> {
        if let Some(bus) = self.controlled_bus() {
            self.unavailable.remove(&bus);
        }
        // A bus that never came up may not drop its ready line either
        if let Err(e) = self.disable_bus() {
            debug!("bus disable during reset: {}", e);
        }
        self.enable_bus()
    }

    /// Poll the ready line until it reads `level`
    fn wait_ready(control: &mut BusControl, level: bool) -> Result<(), BusError> {
        let timeout = control.config.ready_timeout();
        let interval = control.config.poll_interval();
        let start = Instant::now();
        loop {
            if control.ready.is_high()? == level {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(BusError::Timeout {
                    bus: control.config.bus,
                    waited,
                });
            }
            thread::sleep(interval.min(timeout - waited).max(Duration::from_millis(1)));
        }
    }

    pub fn is_available(&self, bus: u8) -> bool {
        !self.unavailable.contains(&bus)
    }

    /// Shared handle to `bus`, failing fast while it is unavailable
    pub fn bus_handle(&mut self, bus: u8, platform: &mut dyn Platform) -> Result<BusHandle, BusError> {
        if !self.is_available(bus) {
            return Err(BusError::Unavailable(bus));
        }
        if let Some(handle) = self.handles.get(&bus) {
            return Ok(handle.clone());
        }
        let handle = BusHandle::new(bus, platform.i2c_bus(bus)?);
        self.handles.insert(bus, handle.clone());
        Ok(handle)
    }

    /// Reset every distinct expander once
    ///
    /// All pins end up as push-pull outputs driven low, so no sensor left
    /// powered by a previous run answers at the default address. A failing
    /// expander does not stop the others from being reset; the failures are
    /// reported together afterwards.
    pub fn reset_expanders(
        &mut self,
        expanders: &BTreeSet<(u8, u8)>,
        platform: &mut dyn Platform,
    ) -> Result<(), BusError> {
        let mut failed = Vec::new();
        for &(bus, address) in expanders {
            if self.expanders.contains_key(&(bus, address)) {
                continue;
            }
            match self.reset_expander(bus, address, platform) {
                Ok(expander) => {
                    info!("expander 0x{:02X} on bus {} reset", address, bus);
                    self.expanders
                        .insert((bus, address), Arc::new(Mutex::new(expander)));
                }
                Err(e) => {
                    warn!("expander 0x{:02X} on bus {} failed reset: {}", address, bus, e);
                    failed.push(address);
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(BusError::ExpanderReset { addresses: failed })
        }
    }

    fn reset_expander(
        &mut self,
        bus: u8,
        address: u8,
        platform: &mut dyn Platform,
    ) -> Result<Aw9523, BusError> {
        let handle = self.bus_handle(bus, platform)?;
        let mut expander = Aw9523::new(handle, address);
        expander.reset()?;
        Ok(expander)
    }

    /// Output pin `pin` on a configured expander
    pub fn expander_pin(&self, bus: u8, address: u8, pin: u8) -> Result<ExpanderPin, BusError> {
        let expander = self
            .expanders
            .get(&(bus, address))
            .ok_or(BusError::UnknownExpander(address))?;
        Ok(ExpanderPin::new(expander.clone(), pin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{SimAw9523, SimI2cBus, SimPlatform};
    use std::sync::atomic::Ordering;

    fn bus_config() -> I2cBusConfig {
        I2cBusConfig {
            bus: 1,
            enable_pin: 17,
            ready_pin: 27,
            ready_timeout_secs: 0.05,
            poll_interval_ms: 5,
        }
    }

    #[test]
    fn test_enable_bus_waits_for_ready() {
        let mut platform = SimPlatform::new();
        platform.alias_input(27, 17);
        let mut manager = BusResourceManager::new(Some(&bus_config()), &mut platform).unwrap();

        manager.enable_bus().unwrap();
        assert!(platform.line(17).is_high());
        assert!(manager.is_available(1));

        manager.disable_bus().unwrap();
        assert!(!platform.line(17).is_high());
    }

    #[test]
    fn test_ready_timeout_is_sticky() {
        let mut platform = SimPlatform::new();
        platform.add_bus(1, SimI2cBus::new());
        let mut manager = BusResourceManager::new(Some(&bus_config()), &mut platform).unwrap();

        assert!(matches!(
            manager.enable_bus(),
            Err(BusError::Timeout { bus: 1, .. })
        ));
        assert!(!manager.is_available(1));
        assert!(matches!(manager.enable_bus(), Err(BusError::Unavailable(1))));
        assert!(matches!(
            manager.bus_handle(1, &mut platform),
            Err(BusError::Unavailable(1))
        ));

        // Ready line comes alive; only an explicit reset recovers the bus
        platform.line(27).set(true);
        assert!(manager.enable_bus().is_err());
        manager.reset_bus().unwrap();
        assert!(manager.is_available(1));
        assert!(manager.bus_handle(1, &mut platform).is_ok());
    }

    #[test]
    fn test_uncontrolled_bus_always_available() {
        let mut platform = SimPlatform::new();
        platform.add_bus(3, SimI2cBus::new());
        let mut manager = BusResourceManager::new(None, &mut platform).unwrap();
        manager.enable_bus().unwrap();
        assert!(manager.bus_handle(3, &mut platform).is_ok());
        assert!(matches!(
            manager.bus_handle(4, &mut platform),
            Err(BusError::Io(_))
        ));
    }

    #[test]
    fn test_expanders_reset_once_and_drive_pins() {
        let mut platform = SimPlatform::new();
        let bus = SimI2cBus::new();
        let expander = SimAw9523::new(0x58);
        let resets = expander.reset_counter();
        let line = expander.line(4).unwrap();
        line.set(true);
        bus.attach(expander);
        platform.add_bus(1, bus);

        let mut manager = BusResourceManager::new(None, &mut platform).unwrap();
        let addresses: BTreeSet<(u8, u8)> = [(1, 0x58), (1, 0x58)].into_iter().collect();
        manager.reset_expanders(&addresses, &mut platform).unwrap();
        manager.reset_expanders(&addresses, &mut platform).unwrap();
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert!(!line.is_high());

        let mut pin = manager.expander_pin(1, 0x58, 4).unwrap();
        pin.set_high().unwrap();
        assert!(line.is_high());
        assert!(pin.is_set_high());

        assert!(matches!(
            manager.expander_pin(1, 0x59, 0),
            Err(BusError::UnknownExpander(0x59))
        ));
    }

    #[test]
    fn test_missing_expander_is_an_error() {
        let mut platform = SimPlatform::new();
        platform.add_bus(1, SimI2cBus::new());
        let mut manager = BusResourceManager::new(None, &mut platform).unwrap();
        let addresses: BTreeSet<(u8, u8)> = [(1, 0x5A)].into_iter().collect();
        assert!(manager.reset_expanders(&addresses, &mut platform).is_err());
    }

    #[test]
    fn test_failed_expander_does_not_block_the_rest() {
        let mut platform = SimPlatform::new();
        let bus = SimI2cBus::new();
        let expander = SimAw9523::new(0x59);
        let resets = expander.reset_counter();
        let line = expander.line(3).unwrap();
        line.set(true);
        bus.attach(expander);
        platform.add_bus(1, bus);

        let mut manager = BusResourceManager::new(None, &mut platform).unwrap();
        // 0x58 is absent and sorts ahead of the healthy expander
        let addresses: BTreeSet<(u8, u8)> = [(1, 0x58), (1, 0x59)].into_iter().collect();
        match manager.reset_expanders(&addresses, &mut platform) {
            Err(BusError::ExpanderReset { addresses }) => assert_eq!(addresses, vec![0x58]),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert!(!line.is_high());
        assert!(manager.expander_pin(1, 0x59, 3).is_ok());
        assert!(matches!(
            manager.expander_pin(1, 0x58, 0),
            Err(BusError::UnknownExpander(0x58))
        ));
    }
}
