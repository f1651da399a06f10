//! Simulated board
//!
//! In-memory stand-ins for the serial ToF, the I2C ToF, the GPIO expander
//! and host GPIO lines. Every simulated device hands out a cloneable handle
//! so tests and the simulator tool can change what the device reports
//! while a driver owns it.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tfmini::cmd::COMMAND_HEADER;
use tfmini::{checksum, FRAME_HEADER, FRAME_SIZE};
use vl53l1x::{reg, DEFAULT_ADDRESS, MODEL_ID};

use super::{I2cBus, InputPin, OutputPin, Platform, SerialLink};
use crate::config::{SensorHardware, SystemConfig};

#[derive(Default)]
struct LineState {
    level: AtomicBool,
    falls: AtomicUsize,
}

/// Logic level shared between a driver and a device
///
/// Falling edges are counted so a device can notice a power pulse that
/// happened between two bus transactions.
#[derive(Clone, Default)]
pub struct SimLine(Arc<LineState>);

impl SimLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, high: bool) {
        let was_high = self.0.level.swap(high, Ordering::SeqCst);
        if was_high && !high {
            self.0.falls.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn is_high(&self) -> bool {
        self.0.level.load(Ordering::SeqCst)
    }

    pub fn falls(&self) -> usize {
        self.0.falls.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "simulated device lock poisoned"))
}

/// Encode a TFMini data frame
pub fn tfmini_frame(distance: u16, flux: u16, temperature: i16) -> [u8; FRAME_SIZE] {
    let temp_raw = ((temperature + 256) as u16) << 3;
    let mut frame = [0u8; FRAME_SIZE];
    frame[0] = FRAME_HEADER;
    frame[1] = FRAME_HEADER;
    frame[2..4].copy_from_slice(&distance.to_le_bytes());
    frame[4..6].copy_from_slice(&flux.to_le_bytes());
    frame[6..8].copy_from_slice(&temp_raw.to_le_bytes());
    frame[8] = checksum(&frame[..FRAME_SIZE - 1]);
    frame
}

/// Continuous output of a streaming TFMini
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimStream {
    pub distance: u16,
    pub flux: u16,
    pub temperature: i16,
}

#[derive(Default)]
struct SerialState {
    rx: VecDeque<u8>,
    /// Chunks still on the wire, delivered one per drained buffer
    arriving: VecDeque<Vec<u8>>,
    stream: Option<SimStream>,
    written: Vec<u8>,
    fail_reads: usize,
    firmware: (u8, u8, u8),
    fail_commands: bool,
}

/// Simulated TFMini on a serial port
#[derive(Clone, Default)]
pub struct SimSerial {
    state: Arc<Mutex<SerialState>>,
}

impl SimSerial {
    pub fn new() -> Self {
        let serial = Self::default();
        if let Ok(mut state) = serial.state.lock() {
            state.firmware = (2, 0, 3);
        }
        serial
    }

    /// Sensor streaming frames at `distance` cm
    pub fn streaming(distance: u16) -> Self {
        let serial = Self::new();
        serial.set_stream(Some(SimStream {
            distance,
            flux: 1000,
            temperature: 35,
        }));
        serial
    }

    pub fn set_stream(&self, stream: Option<SimStream>) {
        if let Ok(mut state) = self.state.lock() {
            state.stream = stream;
        }
    }

    pub fn set_distance(&self, distance: u16) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(stream) = state.stream.as_mut() {
                stream.distance = distance;
            }
        }
    }

    /// Queue raw bytes ahead of any streamed frame
    pub fn push_bytes(&self, bytes: &[u8]) {
        if let Ok(mut state) = self.state.lock() {
            state.rx.extend(bytes.iter().copied());
        }
    }

    /// Queue bytes that only reach the receive buffer once it drains
    pub fn push_arriving(&self, bytes: &[u8]) {
        if let Ok(mut state) = self.state.lock() {
            state.arriving.push_back(bytes.to_vec());
        }
    }

    /// Make the next `count` reads fail with an I/O error
    pub fn fail_reads(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_reads = count;
        }
    }

    /// Answer reset and save commands with a failure status
    pub fn fail_commands(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_commands = fail;
        }
    }

    /// Everything the driver has written
    pub fn written(&self) -> Vec<u8> {
        self.state
            .lock()
            .map(|state| state.written.clone())
            .unwrap_or_default()
    }

    fn reply_to(state: &mut SerialState, command: &[u8]) {
        if command.len() < 4 || command[0] != COMMAND_HEADER {
            return;
        }
        let id = command[2];
        let mut reply = match id {
            0x01 => {
                let (major, minor, revision) = state.firmware;
                vec![COMMAND_HEADER, 0x07, id, revision, minor, major, 0x00]
            }
            0x02 | 0x10 | 0x11 => {
                let status = u8::from(state.fail_commands);
                vec![COMMAND_HEADER, 0x05, id, status, 0x00]
            }
            0x04 => {
                if let Some(stream) = state.stream {
                    let frame = tfmini_frame(stream.distance, stream.flux, stream.temperature);
                    state.rx.extend(frame.iter().copied());
                }
                return;
            }
            // Everything else echoes its parameters
            _ => command.to_vec(),
        };
        let last = reply.len() - 1;
        reply[last] = checksum(&reply[..last]);
        state.rx.extend(reply);
    }
}

impl Read for SimSerial {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state)?;
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "simulated serial error"));
        }
        if state.rx.is_empty() {
            if let Some(chunk) = state.arriving.pop_front() {
                state.rx.extend(chunk);
            } else if let Some(stream) = state.stream {
                let frame = tfmini_frame(stream.distance, stream.flux, stream.temperature);
                state.rx.extend(frame.iter().copied());
            }
        }
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no serial data"));
        }
        let count = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Write for SimSerial {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state)?;
        state.written.extend_from_slice(buf);
        Self::reply_to(&mut state, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for SimSerial {
    fn clear_input(&mut self) -> io::Result<()> {
        lock(&self.state)?.rx.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(lock(&self.state)?.rx.len())
    }
}

/// Device attached to a simulated I2C bus
pub trait SimI2cDevice: Send {
    /// Address the device answers on, `None` while powered down
    fn address(&mut self) -> Option<u8>;
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn write_read(&mut self, bytes: &[u8], buffer: &mut [u8]) -> io::Result<()>;
}

#[derive(Default)]
struct BusState {
    devices: Vec<Box<dyn SimI2cDevice>>,
    fail_next: usize,
    transactions: usize,
}

impl BusState {
    fn device(&mut self, address: u8) -> io::Result<&mut Box<dyn SimI2cDevice>> {
        self.transactions += 1;
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "simulated bus error"));
        }
        let index = self
            .devices
            .iter_mut()
            .position(|d| d.address() == Some(address))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no ACK from 0x{:02X}", address),
                )
            })?;
        Ok(&mut self.devices[index])
    }
}

/// Simulated I2C bus
#[derive(Clone, Default)]
pub struct SimI2cBus {
    state: Arc<Mutex<BusState>>,
}

impl SimI2cBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, device: impl SimI2cDevice + 'static) {
        if let Ok(mut state) = self.state.lock() {
            state.devices.push(Box::new(device));
        }
    }

    /// Fail the next `count` transactions
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next = count;
        }
    }

    pub fn transactions(&self) -> usize {
        self.state.lock().map(|s| s.transactions).unwrap_or(0)
    }
}

impl I2cBus for SimI2cBus {
    fn write(&mut self, address: u8, bytes: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state)?;
        state.device(address)?.write(bytes)
    }

    fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8]) -> io::Result<()> {
        let mut state = lock(&self.state)?;
        state.device(address)?.write_read(bytes, buffer)
    }
}

/// What a simulated VL53L1X measures
#[derive(Debug, Clone)]
struct TofScript {
    address: u8,
    ranging: bool,
    distance_mm: Option<u16>,
    hold_interrupt: bool,
    boots: usize,
}

/// Handle to a simulated VL53L1X owned by a bus
#[derive(Clone)]
pub struct SimTofHandle {
    script: Arc<Mutex<TofScript>>,
}

impl SimTofHandle {
    /// Distance reported by the next measurements, `None` for an invalid range
    pub fn set_distance_mm(&self, distance: Option<u16>) {
        if let Ok(mut script) = self.script.lock() {
            script.distance_mm = distance;
        }
    }

    /// Keep the data ready interrupt deasserted
    pub fn hold_interrupt(&self, hold: bool) {
        if let Ok(mut script) = self.script.lock() {
            script.hold_interrupt = hold;
        }
    }

    pub fn address(&self) -> u8 {
        self.script.lock().map(|s| s.address).unwrap_or(0)
    }

    pub fn is_ranging(&self) -> bool {
        self.script.lock().map(|s| s.ranging).unwrap_or(false)
    }

    /// Power-on count
    pub fn boots(&self) -> usize {
        self.script.lock().map(|s| s.boots).unwrap_or(0)
    }
}

/// Simulated VL53L1X, powered by its XSHUT line
pub struct SimVl53l1x {
    power: SimLine,
    powered: bool,
    seen_falls: usize,
    registers: HashMap<u16, u8>,
    script: Arc<Mutex<TofScript>>,
}

impl SimVl53l1x {
    pub fn new(power: SimLine, distance_mm: Option<u16>) -> (Self, SimTofHandle) {
        let script = Arc::new(Mutex::new(TofScript {
            address: DEFAULT_ADDRESS,
            ranging: false,
            distance_mm,
            hold_interrupt: false,
            boots: 0,
        }));
        let device = Self {
            power,
            powered: false,
            seen_falls: 0,
            registers: HashMap::new(),
            script: script.clone(),
        };
        (device, SimTofHandle { script })
    }

    fn power_on(&mut self) {
        self.registers.clear();
        self.registers.insert(reg::FIRMWARE_SYSTEM_STATUS, 0x01);
        let [hi, lo] = MODEL_ID.to_be_bytes();
        self.registers.insert(reg::IDENTIFICATION_MODEL_ID, hi);
        self.registers.insert(reg::IDENTIFICATION_MODEL_ID + 1, lo);
        if let Ok(mut script) = self.script.lock() {
            script.address = DEFAULT_ADDRESS;
            script.ranging = false;
            script.boots += 1;
        }
    }

    fn read_register(&self, register: u16, script: &TofScript) -> u8 {
        let [dist_hi, dist_lo] = script.distance_mm.unwrap_or(0).to_be_bytes();
        match register {
            reg::GPIO_TIO_HV_STATUS => {
                let ctrl = self.registers.get(&reg::GPIO_HV_MUX_CTRL).copied().unwrap_or(0);
                let active = if ctrl & 0x10 == 0 { 1 } else { 0 };
                if script.ranging && !script.hold_interrupt {
                    active
                } else {
                    active ^ 1
                }
            }
            reg::RESULT_RANGE_STATUS => {
                if script.distance_mm.is_some() {
                    0x09
                } else {
                    0x04
                }
            }
            reg::RESULT_FINAL_RANGE_MM_SD0 => dist_hi,
            r if r == reg::RESULT_FINAL_RANGE_MM_SD0 + 1 => dist_lo,
            _ => self.registers.get(&register).copied().unwrap_or(0),
        }
    }
}

impl SimI2cDevice for SimVl53l1x {
    fn address(&mut self) -> Option<u8> {
        let powered = self.power.is_high();
        let falls = self.power.falls();
        if powered && (!self.powered || falls != self.seen_falls) {
            self.power_on();
        }
        self.powered = powered;
        self.seen_falls = falls;
        if !powered {
            return None;
        }
        self.script.lock().ok().map(|s| s.address)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() < 3 {
            return Ok(());
        }
        let start = u16::from_be_bytes([bytes[0], bytes[1]]);
        let mut script = lock(&self.script)?;
        for (offset, value) in bytes[2..].iter().enumerate() {
            let register = start + offset as u16;
            match register {
                reg::SYSTEM_MODE_START => script.ranging = *value == 0x40,
                reg::I2C_SLAVE_DEVICE_ADDRESS => script.address = value & 0x7F,
                _ => {}
            }
            self.registers.insert(register, *value);
        }
        Ok(())
    }

    fn write_read(&mut self, bytes: &[u8], buffer: &mut [u8]) -> io::Result<()> {
        if bytes.len() < 2 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "register address missing"));
        }
        let start = u16::from_be_bytes([bytes[0], bytes[1]]);
        let script = lock(&self.script)?.clone();
        for (offset, slot) in buffer.iter_mut().enumerate() {
            *slot = self.read_register(start + offset as u16, &script);
        }
        Ok(())
    }
}

/// Simulated AW9523 expander driving sixteen lines
pub struct SimAw9523 {
    address: u8,
    lines: Vec<SimLine>,
    registers: [u8; 256],
    resets: Arc<AtomicUsize>,
}

impl SimAw9523 {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            lines: (0..super::aw9523::PIN_COUNT).map(|_| SimLine::new()).collect(),
            registers: [0; 256],
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Line driven by expander pin `pin`
    pub fn line(&self, pin: u8) -> Option<SimLine> {
        self.lines.get(pin as usize).cloned()
    }

    /// Counter of soft resets received
    pub fn reset_counter(&self) -> Arc<AtomicUsize> {
        self.resets.clone()
    }

    fn drive_port(&self, port: usize, value: u8) {
        for bit in 0..8 {
            if let Some(line) = self.lines.get(port * 8 + bit) {
                line.set(value & (1 << bit) != 0);
            }
        }
    }
}

impl SimI2cDevice for SimAw9523 {
    fn address(&mut self) -> Option<u8> {
        Some(self.address)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        use super::aw9523::{REG_OUTPUT_P0, REG_OUTPUT_P1, REG_SOFT_RESET};

        let (register, values) = match bytes.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };
        for (offset, value) in values.iter().enumerate() {
            let register = register.wrapping_add(offset as u8);
            match register {
                REG_SOFT_RESET => {
                    self.registers = [0; 256];
                    self.drive_port(0, 0);
                    self.drive_port(1, 0);
                    self.resets.fetch_add(1, Ordering::SeqCst);
                }
                REG_OUTPUT_P0 => self.drive_port(0, *value),
                REG_OUTPUT_P1 => self.drive_port(1, *value),
                _ => {}
            }
            self.registers[register as usize] = *value;
        }
        Ok(())
    }

    fn write_read(&mut self, bytes: &[u8], buffer: &mut [u8]) -> io::Result<()> {
        let start = bytes.first().copied().unwrap_or(0);
        for (offset, slot) in buffer.iter_mut().enumerate() {
            let register = start.wrapping_add(offset as u8);
            *slot = if register == super::aw9523::REG_CHIP_ID {
                super::aw9523::CHIP_ID
            } else {
                self.registers[register as usize]
            };
        }
        Ok(())
    }
}

struct SimOutputPin {
    line: SimLine,
}

impl OutputPin for SimOutputPin {
    fn set_high(&mut self) -> io::Result<()> {
        self.line.set(true);
        Ok(())
    }

    fn set_low(&mut self) -> io::Result<()> {
        self.line.set(false);
        Ok(())
    }

    fn is_set_high(&self) -> bool {
        self.line.is_high()
    }
}

struct SimInputPin {
    line: SimLine,
}

impl InputPin for SimInputPin {
    fn is_high(&self) -> io::Result<bool> {
        Ok(self.line.is_high())
    }
}

/// Simulated board resources
#[derive(Default)]
pub struct SimPlatform {
    serial: HashMap<String, SimSerial>,
    buses: HashMap<u8, SimI2cBus>,
    lines: HashMap<u8, SimLine>,
    input_alias: HashMap<u8, u8>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_serial(&mut self, port: impl Into<String>, serial: SimSerial) {
        self.serial.insert(port.into(), serial);
    }

    pub fn add_bus(&mut self, bus: u8, sim: SimI2cBus) {
        self.buses.insert(bus, sim);
    }

    /// Host GPIO line `pin`, created low on first use
    pub fn line(&mut self, pin: u8) -> SimLine {
        self.lines.entry(pin).or_default().clone()
    }

    /// Make input `input` read whatever output `output` drives
    pub fn alias_input(&mut self, input: u8, output: u8) {
        self.input_alias.insert(input, output);
    }
}

impl Platform for SimPlatform {
    fn open_serial(&mut self, port: &str, _baud: u32) -> io::Result<Box<dyn SerialLink>> {
        let serial = self.serial.get(port).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no serial port {}", port))
        })?;
        Ok(Box::new(serial))
    }

    fn i2c_bus(&mut self, bus: u8) -> io::Result<Box<dyn I2cBus>> {
        let sim = self.buses.get(&bus).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no I2C bus {}", bus))
        })?;
        Ok(Box::new(sim))
    }

    fn output_pin(&mut self, pin: u8) -> io::Result<Box<dyn OutputPin>> {
        Ok(Box::new(SimOutputPin {
            line: self.line(pin),
        }))
    }

    fn input_pin(&mut self, pin: u8) -> io::Result<Box<dyn InputPin>> {
        let source = self.input_alias.get(&pin).copied().unwrap_or(pin);
        Ok(Box::new(SimInputPin {
            line: self.line(source),
        }))
    }
}

/// Simulated board wired to match a system configuration
pub struct SimBoard {
    pub platform: SimPlatform,
    /// Serial sensors by sensor name
    pub serial: HashMap<String, SimSerial>,
    /// I2C sensors by sensor name
    pub tofs: HashMap<String, SimTofHandle>,
    pub buses: HashMap<u8, SimI2cBus>,
}

impl SimBoard {
    /// Build a board with every configured device present
    ///
    /// Serial sensors stream `distance_cm`; I2C sensors report the same
    /// distance in millimetres. The bus ready line mirrors its enable line.
    pub fn from_config(config: &SystemConfig, distance_cm: u16) -> Self {
        let mut platform = SimPlatform::new();
        let mut serial = HashMap::new();
        let mut tofs = HashMap::new();
        let mut buses: HashMap<u8, SimI2cBus> = HashMap::new();
        let mut expanders: HashMap<(u8, u8), SimAw9523> = HashMap::new();

        if let Some(i2c) = &config.i2c {
            platform.alias_input(i2c.ready_pin, i2c.enable_pin);
        }

        for sensor in &config.sensors {
            match &sensor.hardware {
                SensorHardware::Serial(cfg) => {
                    let sim = SimSerial::streaming(distance_cm);
                    platform.add_serial(cfg.port.clone(), sim.clone());
                    serial.insert(sensor.name.clone(), sim);
                }
                SensorHardware::I2c(cfg) => {
                    let bus = buses.entry(cfg.bus).or_default().clone();
                    let power = if cfg.enable_board == 0 {
                        platform.line(cfg.enable_pin)
                    } else {
                        let expander = expanders
                            .entry((cfg.bus, cfg.enable_board))
                            .or_insert_with(|| SimAw9523::new(cfg.enable_board));
                        expander
                            .line(cfg.enable_pin)
                            .unwrap_or_default()
                    };
                    let (device, handle) =
                        SimVl53l1x::new(power, Some(distance_cm.saturating_mul(10)));
                    bus.attach(device);
                    tofs.insert(sensor.name.clone(), handle);
                }
            }
        }

        for ((bus, _), expander) in expanders {
            buses.entry(bus).or_default().attach(expander);
        }
        for (id, bus) in &buses {
            platform.add_bus(*id, bus.clone());
        }

        Self {
            platform,
            serial,
            tofs,
            buses,
        }
    }

    /// Move every simulated target to `distance_cm`
    pub fn set_distance(&self, distance_cm: u16) {
        for sim in self.serial.values() {
            sim.set_distance(distance_cm);
        }
        for tof in self.tofs.values() {
            tof.set_distance_mm(Some(distance_cm.saturating_mul(10)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tfmini_frame_decodes() {
        let frame = tfmini::Frame::decode(&tfmini_frame(123, 900, 30)).unwrap();
        assert_eq!(frame.distance, 123);
        assert_eq!(frame.flux, 900);
        assert_eq!(frame.temperature, 30);
    }

    #[test]
    fn test_serial_streams_and_times_out() {
        let mut sim = SimSerial::new();
        let mut buf = [0u8; 4];
        let err = sim.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        sim.set_stream(Some(SimStream {
            distance: 50,
            flux: 500,
            temperature: 20,
        }));
        assert_eq!(sim.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..2], &[FRAME_HEADER, FRAME_HEADER]);
    }

    #[test]
    fn test_vl53l1x_power_cycle_resets_address() {
        let power = SimLine::new();
        let (mut device, handle) = SimVl53l1x::new(power.clone(), Some(500));
        assert_eq!(device.address(), None);

        power.set(true);
        assert_eq!(device.address(), Some(DEFAULT_ADDRESS));
        device.write(&[0x00, 0x01, 0x30]).unwrap();
        assert_eq!(device.address(), Some(0x30));
        assert_eq!(handle.address(), 0x30);

        power.set(false);
        assert_eq!(device.address(), None);
        power.set(true);
        assert_eq!(device.address(), Some(DEFAULT_ADDRESS));
        assert_eq!(handle.boots(), 2);

        // A pulse between transactions still resets the device
        device.write(&[0x00, 0x01, 0x31]).unwrap();
        power.set(false);
        power.set(true);
        assert_eq!(device.address(), Some(DEFAULT_ADDRESS));
        assert_eq!(handle.boots(), 3);
    }

    #[test]
    fn test_bus_nack_and_injected_failure() {
        let mut bus = SimI2cBus::new();
        bus.attach(SimAw9523::new(0x58));

        let err = bus.write(0x20, &[0x00]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        bus.fail_next(1);
        assert!(bus.write(0x58, &[0x02, 0x00]).is_err());
        assert!(bus.write(0x58, &[0x02, 0x00]).is_ok());
        assert_eq!(bus.transactions(), 3);
    }

    #[test]
    fn test_expander_drives_lines() {
        let expander = SimAw9523::new(0x58);
        let line = expander.line(9).unwrap();
        let mut bus = SimI2cBus::new();
        bus.attach(expander);

        bus.write(0x58, &[0x03, 0x02]).unwrap();
        assert!(line.is_high());
        bus.write(0x58, &[0x7F, 0x00]).unwrap();
        assert!(!line.is_high());
    }
}
