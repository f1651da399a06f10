//! AW9523 16-bit GPIO expander
//!
//! Used to drive the enable lines of I2C ToF sensors that share an address
//! at power-on. Only the GPIO output path is supported.

use std::io;
use std::sync::{Arc, Mutex};

use log::debug;

use super::{BusHandle, OutputPin};
use crate::error::BusError;

pub const REG_OUTPUT_P0: u8 = 0x02;
pub const REG_OUTPUT_P1: u8 = 0x03;
pub const REG_CONFIG_P0: u8 = 0x04;
pub const REG_CONFIG_P1: u8 = 0x05;
pub const REG_CHIP_ID: u8 = 0x10;
pub const REG_GCR: u8 = 0x11;
pub const REG_LEDMODE_P0: u8 = 0x12;
pub const REG_LEDMODE_P1: u8 = 0x13;
pub const REG_SOFT_RESET: u8 = 0x7F;

pub const CHIP_ID: u8 = 0x23;
/// GCR bit selecting push-pull drive on port 0
const GCR_PUSH_PULL: u8 = 0x10;
/// LED mode register value selecting GPIO on every pin
const LEDMODE_GPIO: u8 = 0xFF;

pub const PIN_COUNT: u8 = 16;

/// One expander on a shared bus
pub struct Aw9523 {
    bus: BusHandle,
    address: u8,
    /// Output latch, P1 in the high byte
    outputs: u16,
}

impl Aw9523 {
    pub fn new(bus: BusHandle, address: u8) -> Self {
        Self {
            bus,
            address,
            outputs: 0,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Soft reset, then put every pin in push-pull GPIO output mode, low
    pub fn reset(&mut self) -> Result<(), BusError> {
        self.write_reg(REG_SOFT_RESET, 0x00)?;

        let id = self.read_reg(REG_CHIP_ID)?;
        if id != CHIP_ID {
            return Err(BusError::InvalidExpander {
                address: self.address,
                id,
            });
        }

        self.write_reg(REG_GCR, GCR_PUSH_PULL)?;
        self.write_reg(REG_LEDMODE_P0, LEDMODE_GPIO)?;
        self.write_reg(REG_LEDMODE_P1, LEDMODE_GPIO)?;
        self.write_reg(REG_CONFIG_P0, 0x00)?;
        self.write_reg(REG_CONFIG_P1, 0x00)?;
        self.outputs = 0;
        self.flush_outputs()?;

        debug!("AW9523 at 0x{:02X} reset, all outputs low", self.address);
        Ok(())
    }

    pub fn set_pin(&mut self, pin: u8, high: bool) -> io::Result<()> {
        if pin >= PIN_COUNT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("AW9523 has no pin {}", pin),
            ));
        }
        if high {
            self.outputs |= 1 << pin;
        } else {
            self.outputs &= !(1 << pin);
        }
        self.flush_outputs()
    }

    pub fn pin_is_high(&self, pin: u8) -> bool {
        pin < PIN_COUNT && self.outputs & (1 << pin) != 0
    }

    fn flush_outputs(&mut self) -> io::Result<()> {
        let [p0, p1] = self.outputs.to_le_bytes();
        self.write_reg(REG_OUTPUT_P0, p0)?;
        self.write_reg(REG_OUTPUT_P1, p1)
    }

    fn write_reg(&mut self, register: u8, value: u8) -> io::Result<()> {
        let address = self.address;
        vl53l1x::I2c::write(&mut self.bus, address, &[register, value])
    }

    fn read_reg(&mut self, register: u8) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        let address = self.address;
        vl53l1x::I2c::write_read(&mut self.bus, address, &[register], &mut buf)?;
        Ok(buf[0])
    }
}

/// Expander pin usable wherever a host GPIO is
pub struct ExpanderPin {
    expander: Arc<Mutex<Aw9523>>,
    pin: u8,
}

impl ExpanderPin {
    pub fn new(expander: Arc<Mutex<Aw9523>>, pin: u8) -> Self {
        Self { expander, pin }
    }

    fn with_expander<T>(&self, f: impl FnOnce(&mut Aw9523) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self
            .expander
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "expander lock poisoned"))?;
        f(&mut guard)
    }
}

impl OutputPin for ExpanderPin {
    fn set_high(&mut self) -> io::Result<()> {
        let pin = self.pin;
        self.with_expander(|e| e.set_pin(pin, true))
    }

    fn set_low(&mut self) -> io::Result<()> {
        let pin = self.pin;
        self.with_expander(|e| e.set_pin(pin, false))
    }

    fn is_set_high(&self) -> bool {
        let pin = self.pin;
        self.with_expander(|e| Ok(e.pin_is_high(pin)))
            .unwrap_or(false)
    }
}
