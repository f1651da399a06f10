//! Hardware abstraction
//!
//! Everything the framework touches on the board goes through these
//! traits: serial ports, I2C buses and GPIO lines. An embedder supplies a
//! [`Platform`] for the real board; [`sim`] provides one backed by
//! simulated devices.

pub mod aw9523;
pub mod sim;

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

/// Serial port carrying a ToF sensor
pub trait SerialLink: Read + Write + Send {
    /// Discard anything buffered on the receive side
    fn clear_input(&mut self) -> io::Result<()>;

    /// Bytes already received and waiting to be read
    fn bytes_to_read(&mut self) -> io::Result<usize>;
}

/// Raw I2C bus
pub trait I2cBus: Send {
    fn write(&mut self, address: u8, bytes: &[u8]) -> io::Result<()>;
    fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8]) -> io::Result<()>;
}

pub trait OutputPin: Send {
    fn set_high(&mut self) -> io::Result<()>;
    fn set_low(&mut self) -> io::Result<()>;
    fn is_set_high(&self) -> bool;
}

pub trait InputPin: Send {
    fn is_high(&self) -> io::Result<bool>;
}

/// Board resources
pub trait Platform {
    fn open_serial(&mut self, port: &str, baud: u32) -> io::Result<Box<dyn SerialLink>>;
    fn i2c_bus(&mut self, bus: u8) -> io::Result<Box<dyn I2cBus>>;
    fn output_pin(&mut self, pin: u8) -> io::Result<Box<dyn OutputPin>>;
    fn input_pin(&mut self, pin: u8) -> io::Result<Box<dyn InputPin>>;
}

/// Shared handle to one I2C bus
///
/// Every device on a bus holds a clone; transactions are serialized by the
/// mutex.
#[derive(Clone)]
pub struct BusHandle {
    bus: u8,
    inner: Arc<Mutex<Box<dyn I2cBus>>>,
}

impl BusHandle {
    pub fn new(bus: u8, inner: Box<dyn I2cBus>) -> Self {
        Self {
            bus,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    fn with_bus<T>(&self, f: impl FnOnce(&mut dyn I2cBus) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "I2C bus lock poisoned"))?;
        f(guard.as_mut())
    }
}

impl vl53l1x::I2c for BusHandle {
    type Error = io::Error;

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), Self::Error> {
        self.with_bus(|bus| bus.write(address, bytes))
    }

    fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), Self::Error> {
        self.with_bus(|bus| bus.write_read(address, bytes, buffer))
    }
}
