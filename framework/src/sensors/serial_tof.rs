//! TFMini-class ToF sensor on a serial port
//!
//! The sensor streams frames continuously while powered, so enabling and
//! starting are acknowledged without touching the device. A poll first
//! drops the receive backlog down to the newest frame, then hunts for one
//! checksum-valid frame (optionally a stable cluster of them) within a
//! bounded number of bytes.

use std::io::{self, Read, Write};

use log::{debug, info, warn};
use tfmini::cmd::{BaudRate, Command, DistanceUnit, FirmwareVersion, Reply, ReplyParser};
use tfmini::{ClusterFilter, Frame, FrameStatus, TfMiniParser, FRAME_SIZE};

use super::{retry, SensorDriver};
use crate::config::SerialTofConfig;
use crate::error::SensorError;
use crate::hw::{Platform, SerialLink};
use crate::reading::{Reading, SensorState, SensorStatus};
use crate::units::Length;

/// Bytes read per attempt while hunting for a frame
const READ_BUDGET: usize = FRAME_SIZE * 3;
/// Bytes read while waiting for a command reply
const REPLY_BUDGET: usize = FRAME_SIZE * 8;

pub struct SerialTof {
    name: String,
    port: String,
    baud: u32,
    link: Box<dyn SerialLink>,
    parser: TfMiniParser,
    cluster: ClusterFilter,
    max_retries: u32,
    /// Unit of the distance field in data frames
    unit: DistanceUnit,
    /// Reason for the current fault, if any
    fault: Option<String>,
}

impl SerialTof {
    /// Open the configured port
    pub fn new(
        name: &str,
        config: &SerialTofConfig,
        platform: &mut dyn Platform,
    ) -> Result<Self, SensorError> {
        let link = platform.open_serial(&config.port, config.baud).map_err(|e| {
            SensorError::fault(name, format!("cannot open {}: {}", config.port, e))
        })?;
        info!("[{}] TFMini on {} @ {} baud", name, config.port, config.baud);
        Ok(Self::with_link(name, config, link))
    }

    /// Build on an already opened link
    pub fn with_link(name: &str, config: &SerialTofConfig, link: Box<dyn SerialLink>) -> Self {
        Self {
            name: name.to_string(),
            port: config.port.clone(),
            baud: config.baud,
            link,
            parser: TfMiniParser::new(),
            cluster: ClusterFilter::new(config.clustering),
            max_retries: config.max_retries,
            unit: DistanceUnit::Centimeters,
            fault: None,
        }
    }

    pub fn checksum_errors(&self) -> u32 {
        self.parser.checksum_errors()
    }

    /// One attempt at reading a valid frame
    ///
    /// Corrupt frames are skipped; the attempt fails only when the byte
    /// budget runs out or the port errors.
    fn read_frame(&mut self) -> Result<Frame, SensorError> {
        let mut byte = [0u8; 1];
        for _ in 0..READ_BUDGET {
            match self.link.read(&mut byte) {
                Ok(0) => {
                    return Err(SensorError::transient(
                        &self.name,
                        io::Error::new(io::ErrorKind::UnexpectedEof, "serial port closed"),
                    ))
                }
                Ok(_) => {}
                Err(e) => return Err(SensorError::transient(&self.name, e)),
            }
            match self.parser.feed_byte(byte[0]) {
                Some(Ok(frame)) => return Ok(frame),
                Some(Err(e)) => debug!("[{}] discarded frame: {:?}", self.name, e),
                None => {}
            }
        }
        Err(SensorError::Protocol {
            sensor: self.name.clone(),
            detail: format!("no valid frame in {} bytes", READ_BUDGET),
        })
    }

    /// Drop everything waiting on the port except the last frame's worth
    fn discard_backlog(&mut self) -> Result<usize, SensorError> {
        let mut scratch = [0u8; READ_BUDGET];
        let mut discarded = 0;
        loop {
            let waiting = self
                .link
                .bytes_to_read()
                .map_err(|e| SensorError::transient(&self.name, e))?;
            if waiting <= FRAME_SIZE {
                break;
            }
            let excess = (waiting - FRAME_SIZE).min(scratch.len());
            match self.link.read(&mut scratch[..excess]) {
                Ok(0) => break,
                Ok(count) => discarded += count,
                Err(e) => return Err(SensorError::transient(&self.name, e)),
            }
        }
        if discarded > 0 {
            // Any partial frame held by the parser is now out of sequence
            self.parser.reset();
            debug!("[{}] discarded {} stale bytes", self.name, discarded);
        }
        Ok(discarded)
    }

    fn read_frame_retrying(&mut self) -> Result<Frame, SensorError> {
        let name = self.name.clone();
        let max_retries = self.max_retries;
        retry(&name, "frame read", max_retries, || self.read_frame())
    }

    /// Read until the distance is stable over the cluster size
    ///
    /// Starts from the newest frame on the port so a slow scan loop never
    /// sees a stale distance.
    /// Gives up waiting after a bounded number of frames and takes the
    /// latest one.
    fn read_clustered(&mut self) -> Result<Frame, SensorError> {
        let name = self.name.clone();
        let max_retries = self.max_retries;
        retry(&name, "backlog flush", max_retries, || self.discard_backlog())?;
        self.cluster.clear();
        let limit = usize::from(self.cluster.size()) * 10 + 1;
        for _ in 0..limit {
            let frame = self.read_frame_retrying()?;
            if let Some(stable) = self.cluster.push(frame) {
                return Ok(stable);
            }
        }
        let latest = self.cluster.latest();
        self.cluster.clear();
        match latest {
            Some(frame) => {
                debug!("[{}] no stable cluster in {} frames, using latest", self.name, limit);
                Ok(frame)
            }
            None => Err(SensorError::Protocol {
                sensor: self.name.clone(),
                detail: "no frames read".to_string(),
            }),
        }
    }

    fn to_reading(&self, frame: &Frame) -> Reading {
        let temperature = Some(f32::from(frame.temperature));
        let distance = match self.unit {
            DistanceUnit::Centimeters => Length::from_cm(f64::from(frame.distance)),
            DistanceUnit::Millimeters => Length::from_mm(f64::from(frame.distance)),
        };
        match frame.status {
            FrameStatus::Ok => Reading::range(distance, temperature),
            FrameStatus::Weak => Reading::status(SensorStatus::Weak),
            FrameStatus::Saturation => Reading::status(SensorStatus::Saturation),
            FrameStatus::Flood => Reading::status(SensorStatus::Flood),
        }
    }

    /// Send a command and wait for its reply
    fn command(&mut self, command: Command) -> Result<Reply, SensorError> {
        self.link
            .clear_input()
            .map_err(|e| SensorError::transient(&self.name, e))?;
        // Frame sync is lost along with the flushed bytes
        self.parser.reset();
        self.link
            .write_all(command.encode().as_bytes())
            .and_then(|_| self.link.flush())
            .map_err(|e| SensorError::transient(&self.name, e))?;

        let mut parser = match ReplyParser::new(command) {
            Some(parser) => parser,
            None => return Ok(Reply::Ack),
        };
        let mut byte = [0u8; 1];
        for _ in 0..REPLY_BUDGET {
            match self.link.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(SensorError::transient(&self.name, e)),
            }
            if let Some(result) = parser.feed_byte(byte[0]) {
                return result.map_err(|e| SensorError::Protocol {
                    sensor: self.name.clone(),
                    detail: format!("bad reply to {:?}: {:?}", command, e),
                });
            }
        }
        Err(SensorError::Protocol {
            sensor: self.name.clone(),
            detail: format!("no reply to {:?}", command),
        })
    }

    fn status_command(&mut self, command: Command) -> Result<(), SensorError> {
        match self.command(command)? {
            Reply::Status { success: true } => Ok(()),
            Reply::Status { success: false } => Err(SensorError::fault(
                &self.name,
                format!("{:?} reported failure", command),
            )),
            other => Err(SensorError::Protocol {
                sensor: self.name.clone(),
                detail: format!("unexpected reply {:?}", other),
            }),
        }
    }

    /// Command acknowledged by echoing its parameters
    fn ack_command(&mut self, command: Command) -> Result<(), SensorError> {
        match self.command(command)? {
            Reply::Ack => Ok(()),
            other => Err(SensorError::Protocol {
                sensor: self.name.clone(),
                detail: format!("unexpected reply {:?}", other),
            }),
        }
    }

    pub fn firmware_version(&mut self) -> Result<FirmwareVersion, SensorError> {
        match self.command(Command::FirmwareVersion)? {
            Reply::FirmwareVersion(version) => Ok(version),
            other => Err(SensorError::Protocol {
                sensor: self.name.clone(),
                detail: format!("unexpected reply {:?}", other),
            }),
        }
    }

    /// Set the output rate in Hz; returns the rate the sensor echoed
    pub fn set_frame_rate(&mut self, hz: u16) -> Result<u16, SensorError> {
        match self.command(Command::SetFrameRate(hz))? {
            Reply::FrameRate(rate) => Ok(rate),
            other => Err(SensorError::Protocol {
                sensor: self.name.clone(),
                detail: format!("unexpected reply {:?}", other),
            }),
        }
    }

    /// Change the sensor's baud rate
    ///
    /// Takes effect on the sensor immediately; the port must be reopened at
    /// the new rate by the caller.
    pub fn set_baud_rate(&mut self, baud: BaudRate) -> Result<u32, SensorError> {
        match self.command(Command::SetBaudRate(baud))? {
            Reply::BaudRate(rate) => {
                self.baud = rate;
                Ok(rate)
            }
            other => Err(SensorError::Protocol {
                sensor: self.name.clone(),
                detail: format!("unexpected reply {:?}", other),
            }),
        }
    }

    pub fn soft_reset(&mut self) -> Result<(), SensorError> {
        self.status_command(Command::SoftReset)
    }

    /// Restore factory settings
    pub fn hard_reset(&mut self) -> Result<(), SensorError> {
        self.status_command(Command::HardReset)
    }

    pub fn save_settings(&mut self) -> Result<(), SensorError> {
        self.status_command(Command::SaveSettings)
    }

    /// Take one measurement in triggered mode (frame rate 0)
    pub fn trigger(&mut self) -> Result<Reading, SensorError> {
        self.command(Command::TriggerDetection)?;
        let frame = self.read_frame_retrying()?;
        Ok(self.to_reading(&frame))
    }

    /// Switch the data frame distance unit
    pub fn set_output_format(&mut self, unit: DistanceUnit) -> Result<(), SensorError> {
        self.ack_command(Command::OutputFormat(unit))?;
        self.unit = unit;
        debug!("[{}] output unit {:?}", self.name, unit);
        Ok(())
    }

    /// Start or stop the data frame stream
    pub fn set_output_enabled(&mut self, enabled: bool) -> Result<(), SensorError> {
        let command = if enabled {
            Command::EnableOutput
        } else {
            Command::DisableOutput
        };
        self.ack_command(command)
    }
}

impl SensorDriver for SerialTof {
    fn name(&self) -> &str {
        &self.name
    }

    fn interface(&self) -> String {
        format!("{} @ {}", self.port, self.baud)
    }

    fn state(&self) -> SensorState {
        if self.fault.is_some() {
            SensorState::Fault
        } else {
            SensorState::Ranging
        }
    }

    // Always ranging while powered

    fn enable(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn disable(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn start_ranging(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn stop_ranging(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn poll(&mut self) -> Reading {
        match self.read_clustered() {
            Ok(frame) => {
                if self.fault.take().is_some() {
                    info!("[{}] recovered", self.name);
                }
                self.to_reading(&frame)
            }
            Err(e) => {
                let reason = e.to_string();
                if self.fault.is_none() {
                    warn!("[{}] faulted: {}", self.name, reason);
                }
                self.fault = Some(reason.clone());
                Reading::fault(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{tfmini_frame, SimSerial, SimStream};

    fn config(clustering: u16) -> SerialTofConfig {
        SerialTofConfig {
            port: "/dev/ttyAMA0".to_string(),
            baud: 115_200,
            clustering,
            max_retries: 5,
        }
    }

    fn sensor(sim: &SimSerial, clustering: u16) -> SerialTof {
        SerialTof::with_link("range", &config(clustering), Box::new(sim.clone()))
    }

    #[test]
    fn test_reference_frame() {
        let mut bytes = [0x59, 0x59, 0x64, 0x00, 0xC8, 0x00, 0x14, 0x00, 0x00];
        bytes[8] = tfmini::checksum(&bytes[..8]);
        let sim = SimSerial::new();
        sim.push_bytes(&bytes);

        let mut tof = sensor(&sim, 0);
        let reading = tof.poll();
        assert_eq!(reading.status, SensorStatus::Ok);
        assert_eq!(reading.distance, Some(Length::from_cm(100.0)));
        assert_eq!(tof.state(), SensorState::Ranging);
    }

    #[test]
    fn test_corrupt_frame_resyncs_within_poll() {
        let sim = SimSerial::new();
        let mut bad = tfmini_frame(80, 500, 30);
        bad[8] = bad[8].wrapping_add(1);
        sim.push_arriving(&bad);
        sim.push_arriving(&tfmini_frame(81, 500, 30));

        let mut tof = sensor(&sim, 0);
        let reading = tof.poll();
        assert_eq!(reading.distance, Some(Length::from_cm(81.0)));
        assert_eq!(tof.checksum_errors(), 1);
    }

    #[test]
    fn test_backlog_dropped_before_read() {
        let sim = SimSerial::new();
        for distance in [400, 300, 200, 120, 52] {
            sim.push_bytes(&tfmini_frame(distance, 500, 30));
        }
        let mut tof = sensor(&sim, 0);
        assert_eq!(tof.poll().distance, Some(Length::from_cm(52.0)));
        assert_eq!(tof.checksum_errors(), 0);
    }

    #[test]
    fn test_backlog_flush_retries_io_errors() {
        let sim = SimSerial::new();
        for distance in [300, 200, 95] {
            sim.push_bytes(&tfmini_frame(distance, 500, 30));
        }
        sim.fail_reads(2);
        let mut tof = sensor(&sim, 0);
        let reading = tof.poll();
        assert_eq!(reading.status, SensorStatus::Ok);
        assert_eq!(reading.distance, Some(Length::from_cm(95.0)));
    }

    #[test]
    fn test_backlog_keeps_stream_in_sync() {
        // Slow consumer on a live stream: half a frame sits ahead of the backlog
        let sim = SimSerial::streaming(210);
        sim.push_bytes(&tfmini_frame(500, 500, 30)[4..]);
        sim.push_bytes(&tfmini_frame(480, 500, 30));
        sim.push_bytes(&tfmini_frame(460, 500, 30));
        let mut tof = sensor(&sim, 0);
        assert_eq!(tof.poll().distance, Some(Length::from_cm(460.0)));
        assert_eq!(tof.poll().distance, Some(Length::from_cm(210.0)));
    }

    #[test]
    fn test_signal_statuses() {
        let sim = SimSerial::new();
        sim.push_arriving(&tfmini_frame(65535, 50, 30));
        sim.push_arriving(&tfmini_frame(65532, 500, 30));
        let mut tof = sensor(&sim, 0);
        assert_eq!(tof.poll().status, SensorStatus::Weak);
        assert_eq!(tof.poll().status, SensorStatus::Flood);
    }

    #[test]
    fn test_transient_errors_recovered() {
        let sim = SimSerial::streaming(150);
        sim.fail_reads(3);
        let mut tof = sensor(&sim, 0);
        let reading = tof.poll();
        assert_eq!(reading.distance, Some(Length::from_cm(150.0)));
    }

    #[test]
    fn test_retry_bound_faults_then_recovers() {
        // Silent port: every attempt times out
        let sim = SimSerial::new();
        let mut tof = sensor(&sim, 0);
        let reading = tof.poll();
        assert_eq!(reading.status, SensorStatus::Fault);
        assert!(reading.fault_reason.is_some());
        assert_eq!(tof.state(), SensorState::Fault);

        sim.set_stream(Some(SimStream {
            distance: 120,
            flux: 800,
            temperature: 25,
        }));
        assert_eq!(tof.poll().status, SensorStatus::Ok);
        assert_eq!(tof.state(), SensorState::Ranging);
    }

    #[test]
    fn test_clustered_read_waits_for_stable_distance() {
        let sim = SimSerial::new();
        for distance in [100, 104, 104, 104] {
            sim.push_arriving(&tfmini_frame(distance, 500, 30));
        }
        let mut tof = sensor(&sim, 2);
        assert_eq!(tof.poll().distance, Some(Length::from_cm(104.0)));
    }

    #[test]
    fn test_clustered_read_bounded() {
        let sim = SimSerial::new();
        // Never stable: 11 alternating frames for a cluster of 1
        for i in 0..11u16 {
            sim.push_arriving(&tfmini_frame(100 + (i % 2), 500, 30));
        }
        let mut tof = sensor(&sim, 1);
        assert_eq!(tof.poll().distance, Some(Length::from_cm(100.0)));
    }

    #[test]
    fn test_commands() {
        let sim = SimSerial::streaming(90);
        let mut tof = sensor(&sim, 0);

        assert_eq!(tof.firmware_version().unwrap().to_string(), "2.0.3");
        assert_eq!(tof.set_frame_rate(100).unwrap(), 100);
        assert_eq!(tof.set_baud_rate(BaudRate::Baud115200).unwrap(), 115_200);
        tof.soft_reset().unwrap();
        tof.save_settings().unwrap();

        sim.fail_commands(true);
        assert!(matches!(
            tof.hard_reset(),
            Err(SensorError::DeviceFault { .. })
        ));

        let written = sim.written();
        assert_eq!(&written[..4], &[0x5A, 0x04, 0x01, 0x5F]);

        // Streaming resumes after the commands
        assert_eq!(tof.poll().distance, Some(Length::from_cm(90.0)));
    }

    #[test]
    fn test_output_commands() {
        let sim = SimSerial::streaming(90);
        let mut tof = sensor(&sim, 0);

        tof.set_output_enabled(false).unwrap();
        tof.set_output_enabled(true).unwrap();
        assert_eq!(tof.trigger().unwrap().distance, Some(Length::from_cm(90.0)));

        tof.set_output_format(DistanceUnit::Millimeters).unwrap();
        assert_eq!(tof.poll().distance, Some(Length::from_mm(90.0)));
    }
}
