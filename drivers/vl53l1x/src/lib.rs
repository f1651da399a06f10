//! VL53L1X Time-of-Flight Ranging Sensor Driver
//!
//! Register-level driver for the ST VL53L1X, generic over a minimal
//! [`I2c`] bus trait so it runs on any HAL (or a simulated bus in tests).
//!
//! # Features
//!
//! - Boot check, model verification and default configuration upload
//! - I2C address remapping (every unit powers up at 0x29)
//! - Short/long distance modes and the six supported timing budgets
//! - Interrupt-driven data ready polling
//! - `no_std` compatible
//!
//! # Example
//!
//! ```ignore
//! use vl53l1x::{DistanceMode, TimingBudget, Vl53l1x, DEFAULT_ADDRESS};
//!
//! let mut tof = Vl53l1x::new(i2c, DEFAULT_ADDRESS);
//! tof.init()?;
//! tof.set_address(0x30)?;
//! tof.set_distance_mode(DistanceMode::Long)?;
//! tof.set_timing_budget(TimingBudget::Ms200)?;
//! tof.start_ranging()?;
//!
//! loop {
//!     if tof.data_ready()? {
//!         let mm = tof.distance_mm()?;
//!         tof.clear_interrupt()?;
//!     }
//! }
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(feature = "logging")]
use log::debug;

/// Factory default 7-bit address
pub const DEFAULT_ADDRESS: u8 = 0x29;

/// Expected contents of the model id register
pub const MODEL_ID: u16 = 0xEACC;

/// Register addresses
pub mod reg {
    pub const I2C_SLAVE_DEVICE_ADDRESS: u16 = 0x0001;
    pub const VHV_CONFIG_TIMEOUT_MACROP_LOOP_BOUND: u16 = 0x0008;
    pub const VHV_CONFIG_INIT: u16 = 0x000B;
    pub const DEFAULT_CONFIG_START: u16 = 0x002D;
    pub const GPIO_HV_MUX_CTRL: u16 = 0x0030;
    pub const GPIO_TIO_HV_STATUS: u16 = 0x0031;
    pub const PHASECAL_CONFIG_TIMEOUT_MACROP: u16 = 0x004B;
    pub const RANGE_CONFIG_TIMEOUT_MACROP_A_HI: u16 = 0x005E;
    pub const RANGE_CONFIG_VCSEL_PERIOD_A: u16 = 0x0060;
    pub const RANGE_CONFIG_TIMEOUT_MACROP_B_HI: u16 = 0x0061;
    pub const RANGE_CONFIG_VCSEL_PERIOD_B: u16 = 0x0063;
    pub const RANGE_CONFIG_VALID_PHASE_HIGH: u16 = 0x0069;
    pub const SD_CONFIG_WOI_SD0: u16 = 0x0078;
    pub const SD_CONFIG_INITIAL_PHASE_SD0: u16 = 0x007A;
    pub const SYSTEM_INTERRUPT_CLEAR: u16 = 0x0086;
    pub const SYSTEM_MODE_START: u16 = 0x0087;
    pub const RESULT_RANGE_STATUS: u16 = 0x0089;
    pub const RESULT_FINAL_RANGE_MM_SD0: u16 = 0x0096;
    pub const FIRMWARE_SYSTEM_STATUS: u16 = 0x00E5;
    pub const IDENTIFICATION_MODEL_ID: u16 = 0x010F;
}

const MODE_START_RANGING: u8 = 0x40;
const MODE_STOP_RANGING: u8 = 0x00;
const RANGE_STATUS_VALID: u8 = 0x09;

/// Data ready polls allowed during the init measurement
const INIT_READY_POLLS: u32 = 1000;

/// Default configuration written to 0x2D..=0x87 on init
const DEFAULT_CONFIGURATION: [u8; 91] = [
    0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x02, 0x08, // 0x2D
    0x00, 0x08, 0x10, 0x01, 0x01, 0x00, 0x00, 0x00, // 0x35
    0x00, 0xFF, 0x00, 0x0F, 0x00, 0x00, 0x00, 0x00, // 0x3D
    0x00, 0x20, 0x0B, 0x00, 0x00, 0x02, 0x0A, 0x21, // 0x45
    0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0xC8, // 0x4D
    0x00, 0x00, 0x38, 0xFF, 0x01, 0x00, 0x08, 0x00, // 0x55
    0x00, 0x01, 0xCC, 0x0F, 0x01, 0xF1, 0x0D, 0x01, // 0x5D
    0x68, 0x00, 0x80, 0x08, 0xB8, 0x00, 0x00, 0x00, // 0x65
    0x00, 0x0F, 0x89, 0x00, 0x00, 0x00, 0x00, 0x00, // 0x6D
    0x00, 0x00, 0x01, 0x0F, 0x0D, 0x0E, 0x0E, 0x00, // 0x75
    0x00, 0x02, 0xC7, 0xFF, 0x9B, 0x00, 0x00, 0x00, // 0x7D
    0x01, 0x01, 0x00, // 0x85
];

/// Minimal blocking I2C interface
///
/// Mirrors the shape of `embedded-hal`'s blocking I2C trait so an adapter
/// is a few lines for any HAL.
pub trait I2c {
    type Error: core::fmt::Debug;

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), Self::Error>;

    fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8])
        -> Result<(), Self::Error>;
}

/// Driver errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// Bus transaction failed
    I2c(E),
    /// Model id register did not read 0xEACC
    InvalidModel(u16),
    /// Address outside the 7-bit range
    InvalidAddress(u8),
    /// Device did not produce data during init
    Timeout,
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Error::I2c(e)
    }
}

/// Ranging distance mode
///
/// Short mode ranges to ~1.3 m with better ambient immunity, long mode to
/// ~4 m.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMode {
    Short,
    Long,
}

impl DistanceMode {
    /// Register values: phasecal timeout, VCSEL A, VCSEL B, valid phase,
    /// WOI SD0 and initial phase SD0
    fn registers(self) -> (u8, u8, u8, u8, u16, u16) {
        match self {
            DistanceMode::Short => (0x14, 0x07, 0x05, 0x38, 0x0705, 0x0606),
            DistanceMode::Long => (0x0A, 0x0F, 0x0D, 0xB8, 0x0F0D, 0x0E0E),
        }
    }
}

/// Supported per-measurement integration times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingBudget {
    Ms20,
    Ms33,
    Ms50,
    Ms100,
    Ms200,
    Ms500,
}

impl TimingBudget {
    pub const ALL: [TimingBudget; 6] = [
        TimingBudget::Ms20,
        TimingBudget::Ms33,
        TimingBudget::Ms50,
        TimingBudget::Ms100,
        TimingBudget::Ms200,
        TimingBudget::Ms500,
    ];

    pub fn as_ms(&self) -> u16 {
        match self {
            TimingBudget::Ms20 => 20,
            TimingBudget::Ms33 => 33,
            TimingBudget::Ms50 => 50,
            TimingBudget::Ms100 => 100,
            TimingBudget::Ms200 => 200,
            TimingBudget::Ms500 => 500,
        }
    }

    /// Macro period timeouts (A, B) for the given distance mode
    fn registers(self, mode: DistanceMode) -> (u16, u16) {
        match (mode, self) {
            (DistanceMode::Short, TimingBudget::Ms20) => (0x0051, 0x006E),
            (DistanceMode::Short, TimingBudget::Ms33) => (0x00D6, 0x006E),
            (DistanceMode::Short, TimingBudget::Ms50) => (0x01AE, 0x01E8),
            (DistanceMode::Short, TimingBudget::Ms100) => (0x02E1, 0x0388),
            (DistanceMode::Short, TimingBudget::Ms200) => (0x03E1, 0x0496),
            (DistanceMode::Short, TimingBudget::Ms500) => (0x0591, 0x05C1),
            (DistanceMode::Long, TimingBudget::Ms20) => (0x001E, 0x0022),
            (DistanceMode::Long, TimingBudget::Ms33) => (0x0060, 0x006E),
            (DistanceMode::Long, TimingBudget::Ms50) => (0x00AD, 0x00C6),
            (DistanceMode::Long, TimingBudget::Ms100) => (0x01CC, 0x01EA),
            (DistanceMode::Long, TimingBudget::Ms200) => (0x02D9, 0x02F8),
            (DistanceMode::Long, TimingBudget::Ms500) => (0x048F, 0x04A4),
        }
    }
}

/// Returned when a timing budget is not one of the supported values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTimingBudget(pub u16);

impl core::fmt::Display for InvalidTimingBudget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "timing budget {} ms not supported (use 20, 33, 50, 100, 200 or 500)",
            self.0
        )
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for InvalidTimingBudget {}

impl TryFrom<u16> for TimingBudget {
    type Error = InvalidTimingBudget;

    fn try_from(ms: u16) -> Result<Self, Self::Error> {
        TimingBudget::ALL
            .iter()
            .copied()
            .find(|b| b.as_ms() == ms)
            .ok_or(InvalidTimingBudget(ms))
    }
}

/// VL53L1X driver
pub struct Vl53l1x<I2C> {
    i2c: I2C,
    address: u8,
    distance_mode: DistanceMode,
    timing_budget: TimingBudget,
}

impl<I2C: I2c> Vl53l1x<I2C> {
    /// Create a driver talking to `address`
    ///
    /// No bus traffic happens until [`init`](Self::init).
    pub fn new(i2c: I2C, address: u8) -> Self {
        Self {
            i2c,
            address,
            distance_mode: DistanceMode::Long,
            timing_budget: TimingBudget::Ms100,
        }
    }

    /// Current 7-bit address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Give the bus back
    pub fn release(self) -> I2C {
        self.i2c
    }

    /// Whether the firmware has finished booting
    pub fn booted(&mut self) -> Result<bool, Error<I2C::Error>> {
        Ok(self.read_u8(reg::FIRMWARE_SYSTEM_STATUS)? & 0x01 == 0x01)
    }

    pub fn model_id(&mut self) -> Result<u16, Error<I2C::Error>> {
        self.read_u16(reg::IDENTIFICATION_MODEL_ID)
    }

    /// Verify the model and upload the default configuration
    ///
    /// Runs one throwaway measurement to settle the VHV calibration, then
    /// leaves the device stopped.
    pub fn init(&mut self) -> Result<(), Error<I2C::Error>> {
        let model = self.model_id()?;
        if model != MODEL_ID {
            return Err(Error::InvalidModel(model));
        }

        let mut block = [0u8; 2 + DEFAULT_CONFIGURATION.len()];
        block[..2].copy_from_slice(&reg::DEFAULT_CONFIG_START.to_be_bytes());
        block[2..].copy_from_slice(&DEFAULT_CONFIGURATION);
        self.i2c.write(self.address, &block)?;

        self.start_ranging()?;
        let mut polls = 0;
        while !self.data_ready()? {
            polls += 1;
            if polls >= INIT_READY_POLLS {
                return Err(Error::Timeout);
            }
        }
        self.clear_interrupt()?;
        self.stop_ranging()?;

        self.write_u8(reg::VHV_CONFIG_TIMEOUT_MACROP_LOOP_BOUND, 0x09)?;
        self.write_u8(reg::VHV_CONFIG_INIT, 0x00)?;

        #[cfg(feature = "logging")]
        debug!("VL53L1X at 0x{:02X} initialized", self.address);
        Ok(())
    }

    /// Move the device to a new 7-bit address
    ///
    /// The device keeps the new address until it is powered down.
    pub fn set_address(&mut self, new_address: u8) -> Result<(), Error<I2C::Error>> {
        if new_address == 0 || new_address > 0x7F {
            return Err(Error::InvalidAddress(new_address));
        }
        self.write_u8(reg::I2C_SLAVE_DEVICE_ADDRESS, new_address)?;
        #[cfg(feature = "logging")]
        debug!("VL53L1X moved 0x{:02X} -> 0x{:02X}", self.address, new_address);
        self.address = new_address;
        Ok(())
    }

    pub fn start_ranging(&mut self) -> Result<(), Error<I2C::Error>> {
        self.write_u8(reg::SYSTEM_MODE_START, MODE_START_RANGING)
    }

    pub fn stop_ranging(&mut self) -> Result<(), Error<I2C::Error>> {
        self.write_u8(reg::SYSTEM_MODE_START, MODE_STOP_RANGING)
    }

    /// Whether a new measurement is waiting
    pub fn data_ready(&mut self) -> Result<bool, Error<I2C::Error>> {
        let polarity = self.interrupt_polarity()?;
        Ok(self.read_u8(reg::GPIO_TIO_HV_STATUS)? & 0x01 == polarity)
    }

    /// Acknowledge the current measurement so the next one can latch
    pub fn clear_interrupt(&mut self) -> Result<(), Error<I2C::Error>> {
        self.write_u8(reg::SYSTEM_INTERRUPT_CLEAR, 0x01)
    }

    /// Last measured distance in millimetres
    ///
    /// Returns `None` when the device flags the measurement as invalid.
    pub fn distance_mm(&mut self) -> Result<Option<u16>, Error<I2C::Error>> {
        if self.read_u8(reg::RESULT_RANGE_STATUS)? != RANGE_STATUS_VALID {
            return Ok(None);
        }
        Ok(Some(self.read_u16(reg::RESULT_FINAL_RANGE_MM_SD0)?))
    }

    /// Distance mode as reported by the device
    pub fn distance_mode(&mut self) -> Result<Option<DistanceMode>, Error<I2C::Error>> {
        Ok(match self.read_u8(reg::PHASECAL_CONFIG_TIMEOUT_MACROP)? {
            0x14 => Some(DistanceMode::Short),
            0x0A => Some(DistanceMode::Long),
            _ => None,
        })
    }

    /// Switch distance mode
    ///
    /// The macro period timeouts depend on the mode, so the current timing
    /// budget is written again afterwards.
    pub fn set_distance_mode(&mut self, mode: DistanceMode) -> Result<(), Error<I2C::Error>> {
        let (phasecal, vcsel_a, vcsel_b, valid_phase, woi, initial_phase) = mode.registers();
        self.write_u8(reg::PHASECAL_CONFIG_TIMEOUT_MACROP, phasecal)?;
        self.write_u8(reg::RANGE_CONFIG_VCSEL_PERIOD_A, vcsel_a)?;
        self.write_u8(reg::RANGE_CONFIG_VCSEL_PERIOD_B, vcsel_b)?;
        self.write_u8(reg::RANGE_CONFIG_VALID_PHASE_HIGH, valid_phase)?;
        self.write_u16(reg::SD_CONFIG_WOI_SD0, woi)?;
        self.write_u16(reg::SD_CONFIG_INITIAL_PHASE_SD0, initial_phase)?;
        self.distance_mode = mode;
        self.set_timing_budget(self.timing_budget)
    }

    pub fn set_timing_budget(&mut self, budget: TimingBudget) -> Result<(), Error<I2C::Error>> {
        let (a, b) = budget.registers(self.distance_mode);
        self.write_u16(reg::RANGE_CONFIG_TIMEOUT_MACROP_A_HI, a)?;
        self.write_u16(reg::RANGE_CONFIG_TIMEOUT_MACROP_B_HI, b)?;
        self.timing_budget = budget;
        Ok(())
    }

    /// Timing budget decoded from the device registers
    pub fn timing_budget(&mut self) -> Result<Option<TimingBudget>, Error<I2C::Error>> {
        let a = self.read_u16(reg::RANGE_CONFIG_TIMEOUT_MACROP_A_HI)?;
        let mode = match self.distance_mode()? {
            Some(mode) => mode,
            None => return Ok(None),
        };
        Ok(TimingBudget::ALL
            .iter()
            .copied()
            .find(|b| b.registers(mode).0 == a))
    }

    /// Active-high interrupt reads 1 when bit 4 of the mux control is clear
    fn interrupt_polarity(&mut self) -> Result<u8, Error<I2C::Error>> {
        let ctrl = self.read_u8(reg::GPIO_HV_MUX_CTRL)?;
        Ok(if ctrl & 0x10 == 0 { 1 } else { 0 })
    }

    fn read_u8(&mut self, register: u16) -> Result<u8, Error<I2C::Error>> {
        let mut buf = [0u8; 1];
        self.i2c
            .write_read(self.address, &register.to_be_bytes(), &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self, register: u16) -> Result<u16, Error<I2C::Error>> {
        let mut buf = [0u8; 2];
        self.i2c
            .write_read(self.address, &register.to_be_bytes(), &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn write_u8(&mut self, register: u16, value: u8) -> Result<(), Error<I2C::Error>> {
        let [hi, lo] = register.to_be_bytes();
        self.i2c.write(self.address, &[hi, lo, value])?;
        Ok(())
    }

    fn write_u16(&mut self, register: u16, value: u16) -> Result<(), Error<I2C::Error>> {
        let [hi, lo] = register.to_be_bytes();
        let [v_hi, v_lo] = value.to_be_bytes();
        self.i2c.write(self.address, &[hi, lo, v_hi, v_lo])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Register map standing in for one device
    struct FakeBus {
        address: u8,
        regs: HashMap<u16, u8>,
        ranging: bool,
        writes: Vec<(u8, Vec<u8>)>,
    }

    impl FakeBus {
        fn new() -> Self {
            let mut regs = HashMap::new();
            regs.insert(reg::IDENTIFICATION_MODEL_ID, 0xEA);
            regs.insert(reg::IDENTIFICATION_MODEL_ID + 1, 0xCC);
            regs.insert(reg::FIRMWARE_SYSTEM_STATUS, 0x01);
            Self {
                address: DEFAULT_ADDRESS,
                regs,
                ranging: false,
                writes: Vec::new(),
            }
        }
    }

    impl I2c for FakeBus {
        type Error = &'static str;

        fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), Self::Error> {
            if address != self.address {
                return Err("nack");
            }
            self.writes.push((address, bytes.to_vec()));
            let start = u16::from_be_bytes([bytes[0], bytes[1]]);
            for (i, b) in bytes[2..].iter().enumerate() {
                self.regs.insert(start + i as u16, *b);
            }
            match start {
                reg::I2C_SLAVE_DEVICE_ADDRESS => self.address = bytes[2],
                reg::SYSTEM_MODE_START => self.ranging = bytes[2] == MODE_START_RANGING,
                _ => {}
            }
            Ok(())
        }

        fn write_read(
            &mut self,
            address: u8,
            bytes: &[u8],
            buffer: &mut [u8],
        ) -> Result<(), Self::Error> {
            if address != self.address {
                return Err("nack");
            }
            let start = u16::from_be_bytes([bytes[0], bytes[1]]);
            for (i, b) in buffer.iter_mut().enumerate() {
                let r = start + i as u16;
                *b = if r == reg::GPIO_TIO_HV_STATUS {
                    u8::from(self.ranging)
                } else {
                    self.regs.get(&r).copied().unwrap_or(0)
                };
            }
            Ok(())
        }
    }

    #[test]
    fn test_timing_budget_conversion() {
        assert_eq!(TimingBudget::try_from(200), Ok(TimingBudget::Ms200));
        assert_eq!(TimingBudget::try_from(33), Ok(TimingBudget::Ms33));
        assert_eq!(TimingBudget::try_from(150), Err(InvalidTimingBudget(150)));
        assert_eq!(TimingBudget::try_from(0), Err(InvalidTimingBudget(0)));

        for budget in TimingBudget::ALL {
            assert_eq!(TimingBudget::try_from(budget.as_ms()), Ok(budget));
        }
    }

    #[test]
    fn test_init_checks_model() {
        let mut bus = FakeBus::new();
        bus.regs.insert(reg::IDENTIFICATION_MODEL_ID, 0x00);
        let mut tof = Vl53l1x::new(bus, DEFAULT_ADDRESS);
        assert_eq!(tof.init(), Err(Error::InvalidModel(0x00CC)));
    }

    #[test]
    fn test_init_uploads_configuration() {
        let mut tof = Vl53l1x::new(FakeBus::new(), DEFAULT_ADDRESS);
        tof.init().unwrap();
        let bus = tof.release();

        let (_, block) = &bus.writes[0];
        assert_eq!(&block[..2], &[0x00, 0x2D]);
        assert_eq!(block.len(), 2 + DEFAULT_CONFIGURATION.len());
        assert!(!bus.ranging);
        assert_eq!(bus.regs[&reg::VHV_CONFIG_TIMEOUT_MACROP_LOOP_BOUND], 0x09);
    }

    #[test]
    fn test_set_address_moves_device() {
        let mut tof = Vl53l1x::new(FakeBus::new(), DEFAULT_ADDRESS);
        tof.set_address(0x30).unwrap();
        assert_eq!(tof.address(), 0x30);
        // Still reachable at the new address
        assert_eq!(tof.model_id().unwrap(), MODEL_ID);

        assert_eq!(tof.set_address(0x80), Err(Error::InvalidAddress(0x80)));
    }

    #[test]
    fn test_distance_mode_rewrites_budget() {
        let mut tof = Vl53l1x::new(FakeBus::new(), DEFAULT_ADDRESS);
        tof.set_timing_budget(TimingBudget::Ms200).unwrap();
        tof.set_distance_mode(DistanceMode::Short).unwrap();

        assert_eq!(tof.distance_mode().unwrap(), Some(DistanceMode::Short));
        assert_eq!(tof.timing_budget().unwrap(), Some(TimingBudget::Ms200));

        let bus = tof.release();
        assert_eq!(bus.regs[&reg::RANGE_CONFIG_TIMEOUT_MACROP_A_HI], 0x03);
        assert_eq!(bus.regs[&(reg::RANGE_CONFIG_TIMEOUT_MACROP_A_HI + 1)], 0xE1);
    }

    #[test]
    fn test_data_ready_and_distance() {
        let mut tof = Vl53l1x::new(FakeBus::new(), DEFAULT_ADDRESS);
        assert!(!tof.data_ready().unwrap());

        tof.start_ranging().unwrap();
        assert!(tof.data_ready().unwrap());

        // Invalid range status
        assert_eq!(tof.distance_mm().unwrap(), None);

        let mut bus = tof.release();
        bus.regs.insert(reg::RESULT_RANGE_STATUS, RANGE_STATUS_VALID);
        bus.regs.insert(reg::RESULT_FINAL_RANGE_MM_SD0, 0x04);
        bus.regs.insert(reg::RESULT_FINAL_RANGE_MM_SD0 + 1, 0xD2);
        let mut tof = Vl53l1x::new(bus, DEFAULT_ADDRESS);
        assert_eq!(tof.distance_mm().unwrap(), Some(1234));
    }

    #[test]
    fn test_interrupt_polarity_inverted() {
        let mut bus = FakeBus::new();
        bus.regs.insert(reg::GPIO_HV_MUX_CTRL, 0x11);
        let mut tof = Vl53l1x::new(bus, DEFAULT_ADDRESS);
        // Active low: status bit clear means ready
        assert!(tof.data_ready().unwrap());
    }
}
