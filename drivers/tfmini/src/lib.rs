//! TFMini / TFMini-Plus LiDAR UART Driver
//!
//! Pure Rust parser for the Benewake TFMini family of single-point
//! time-of-flight range sensors in serial mode.
//!
//! # Features
//!
//! - Byte-at-a-time frame parsing with header resynchronisation
//! - Checksum verification (low byte of the byte sum)
//! - Signal status classification (weak, saturated, ambient flood)
//! - Command sub-protocol builders and reply parsing (see [`cmd`])
//! - `no_std` compatible
//!
//! # Data frame
//!
//! ```text
//! 0x59 0x59 Dist_L Dist_H Flux_L Flux_H Temp_L Temp_H Checksum
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tfmini::{FrameStatus, TfMiniParser};
//!
//! let mut parser = TfMiniParser::new();
//!
//! for byte in uart_bytes {
//!     match parser.feed_byte(byte) {
//!         Some(Ok(frame)) if frame.status == FrameStatus::Ok => {
//!             println!("{} cm, flux {}", frame.distance, frame.flux);
//!         }
//!         Some(Ok(frame)) => println!("no range: {:?}", frame.status),
//!         Some(Err(e)) => println!("dropped frame: {:?}", e),
//!         None => {}
//!     }
//! }
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(feature = "logging")]
use log::{debug, warn};

/// Frame constants
pub const FRAME_SIZE: usize = 9;
pub const FRAME_HEADER: u8 = 0x59;

/// Signal strength below which a distance is unreliable
pub const MIN_FLUX: u16 = 100;

/// Sentinel distances reported by the sensor
const DIST_WEAK: u16 = 65535;
const DIST_SATURATED: u16 = 65534;
const DIST_FLOOD: u16 = 65532;
const FLUX_SATURATED: u16 = 65535;

/// Low byte of the sum of `bytes`
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Verify a frame or command whose last byte is the checksum of the rest
pub fn verify_checksum(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((last, body)) if !body.is_empty() => checksum(body) == *last,
        _ => false,
    }
}

/// Signal classification for a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Distance is valid
    Ok,
    /// Return signal too weak (distance 65535 or flux < 100)
    Weak,
    /// Receiver saturated (distance 65534 or flux 65535)
    Saturation,
    /// Ambient light flood (distance 65532)
    Flood,
}

impl FrameStatus {
    /// Classify a raw distance/flux pair
    ///
    /// Checks run in sensor priority order: weak, saturation, flood.
    pub fn classify(distance: u16, flux: u16) -> Self {
        if distance == DIST_WEAK || flux < MIN_FLUX {
            FrameStatus::Weak
        } else if distance == DIST_SATURATED || flux == FLUX_SATURATED {
            FrameStatus::Saturation
        } else if distance == DIST_FLOOD {
            FrameStatus::Flood
        } else {
            FrameStatus::Ok
        }
    }
}

/// Decoded data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Distance in the configured output unit (cm by default)
    pub distance: u16,
    /// Signal strength
    pub flux: u16,
    /// Chip temperature (°C)
    pub temperature: i16,
    pub status: FrameStatus,
}

impl Frame {
    /// Decode a complete 9-byte frame
    ///
    /// # Arguments
    ///
    /// * `bytes` - Raw frame including both header bytes and the checksum
    ///
    /// # Returns
    ///
    /// The decoded frame, or the reason it was rejected.
    pub fn decode(bytes: &[u8; FRAME_SIZE]) -> Result<Self, FrameError> {
        if bytes[0] != FRAME_HEADER || bytes[1] != FRAME_HEADER {
            return Err(FrameError::Header);
        }

        let expected = checksum(&bytes[..FRAME_SIZE - 1]);
        if expected != bytes[FRAME_SIZE - 1] {
            return Err(FrameError::Checksum {
                expected,
                received: bytes[FRAME_SIZE - 1],
            });
        }

        let distance = u16::from_le_bytes([bytes[2], bytes[3]]);
        let flux = u16::from_le_bytes([bytes[4], bytes[5]]);
        let temp_raw = u16::from_le_bytes([bytes[6], bytes[7]]);

        Ok(Self {
            distance,
            flux,
            // Vendor formula: raw / 8 - 256
            temperature: (temp_raw >> 3) as i16 - 256,
            status: FrameStatus::classify(distance, flux),
        })
    }
}

/// Reasons a frame is discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Frame does not start with the 0x59 0x59 header
    Header,
    /// Checksum byte does not match the byte sum
    Checksum { expected: u8, received: u8 },
}

/// TFMini UART frame parser
///
/// Hunts for the double header, accumulates nine bytes and decodes them.
/// A frame that fails its checksum is dropped and the parser resynchronises
/// on the next header found inside the rejected bytes, so a misaligned lock
/// costs at most one frame.
pub struct TfMiniParser {
    buffer: [u8; FRAME_SIZE],
    index: usize,
    checksum_errors: u32,
}

impl TfMiniParser {
    pub fn new() -> Self {
        Self {
            buffer: [0; FRAME_SIZE],
            index: 0,
            checksum_errors: 0,
        }
    }

    /// Feed a single byte from the UART
    ///
    /// Returns `Some(Ok(frame))` when a valid frame completes and
    /// `Some(Err(_))` when a complete frame was rejected.
    pub fn feed_byte(&mut self, byte: u8) -> Option<Result<Frame, FrameError>> {
        match self.index {
            0 | 1 => {
                if byte == FRAME_HEADER {
                    self.buffer[self.index] = byte;
                    self.index += 1;
                } else {
                    self.index = 0;
                }
                return None;
            }
            _ => {
                self.buffer[self.index] = byte;
                self.index += 1;
            }
        }

        if self.index < FRAME_SIZE {
            return None;
        }

        let result = Frame::decode(&self.buffer);
        match result {
            Ok(_) => self.index = 0,
            Err(e) => {
                self.checksum_errors = self.checksum_errors.wrapping_add(1);
                #[cfg(feature = "logging")]
                warn!("TFMini frame rejected: {:?}", e);
                #[cfg(not(feature = "logging"))]
                let _ = e;
                self.resync();
            }
        }
        Some(result)
    }

    /// Shift the buffer so it starts at the next header candidate
    fn resync(&mut self) {
        let next = (1..FRAME_SIZE).find(|&i| {
            self.buffer[i] == FRAME_HEADER
                && (i + 1 == FRAME_SIZE || self.buffer[i + 1] == FRAME_HEADER)
        });

        match next {
            Some(start) => {
                self.buffer.copy_within(start.., 0);
                self.index = FRAME_SIZE - start;
            }
            None => self.index = 0,
        }
    }

    /// Drop any partially received frame
    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// Number of frames rejected since creation
    pub fn checksum_errors(&self) -> u32 {
        self.checksum_errors
    }
}

impl Default for TfMiniParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts a distance only after it repeats.
///
/// With a cluster size of `n` the first frame primes the filter and `n`
/// further frames with an identical distance must follow back to back.
/// A size of 0 accepts every frame.
#[derive(Debug, Clone)]
pub struct ClusterFilter {
    size: u16,
    previous: Option<Frame>,
    stable: u16,
}

impl ClusterFilter {
    pub fn new(size: u16) -> Self {
        Self {
            size,
            previous: None,
            stable: 0,
        }
    }

    /// Offer a frame; returns it once the distance has been stable long enough
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        if self.size == 0 {
            return Some(frame);
        }

        match self.previous {
            Some(prev) if prev.distance == frame.distance => self.stable += 1,
            Some(_) => self.stable = 0,
            None => {}
        }
        self.previous = Some(frame);

        if self.stable >= self.size {
            #[cfg(feature = "logging")]
            debug!("TFMini distance {} stable over {} frames", frame.distance, self.size + 1);
            self.clear();
            Some(frame)
        } else {
            None
        }
    }

    /// Most recent frame offered, stable or not
    pub fn latest(&self) -> Option<Frame> {
        self.previous
    }

    pub fn clear(&mut self) {
        self.previous = None;
        self.stable = 0;
    }

    pub fn size(&self) -> u16 {
        self.size
    }
}

/// TFMini command sub-protocol
///
/// Commands and replies share one layout:
/// - Header: 0x5A
/// - Total length (1 byte, header and checksum included)
/// - Command id (1 byte)
/// - Parameters (little-endian)
/// - Checksum: low byte of the sum of all preceding bytes
///
/// # Example
///
/// ```ignore
/// use tfmini::cmd::{Command, ReplyParser};
///
/// let command = Command::FirmwareVersion;
/// uart.write(command.encode().as_bytes()).ok();
///
/// let mut replies = ReplyParser::new(command);
/// for byte in uart_bytes {
///     if let Some(reply) = replies.feed_byte(byte) {
///         println!("{:?}", reply);
///         break;
///     }
/// }
/// ```
pub mod cmd {
    use super::checksum;

    pub const COMMAND_HEADER: u8 = 0x5A;

    /// Longest command or reply in the protocol
    pub const MAX_COMMAND_SIZE: usize = 8;

    const ID_FIRMWARE_VERSION: u8 = 0x01;
    const ID_SOFT_RESET: u8 = 0x02;
    const ID_FRAME_RATE: u8 = 0x03;
    const ID_TRIGGER_DETECTION: u8 = 0x04;
    const ID_OUTPUT_FORMAT: u8 = 0x05;
    const ID_BAUD_RATE: u8 = 0x06;
    const ID_OUTPUT_ENABLE: u8 = 0x07;
    const ID_HARD_RESET: u8 = 0x10;
    const ID_SAVE_SETTINGS: u8 = 0x11;

    /// Supported serial baud rates
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum BaudRate {
        Baud9600,
        Baud14400,
        Baud19200,
        Baud56000,
        Baud115200,
        Baud460800,
        Baud921600,
    }

    impl BaudRate {
        pub fn as_u32(&self) -> u32 {
            match self {
                BaudRate::Baud9600 => 9600,
                BaudRate::Baud14400 => 14400,
                BaudRate::Baud19200 => 19200,
                BaudRate::Baud56000 => 56000,
                BaudRate::Baud115200 => 115200,
                BaudRate::Baud460800 => 460800,
                BaudRate::Baud921600 => 921600,
            }
        }

        pub fn from_u32(baud: u32) -> Option<Self> {
            match baud {
                9600 => Some(BaudRate::Baud9600),
                14400 => Some(BaudRate::Baud14400),
                19200 => Some(BaudRate::Baud19200),
                56000 => Some(BaudRate::Baud56000),
                115200 => Some(BaudRate::Baud115200),
                460800 => Some(BaudRate::Baud460800),
                921600 => Some(BaudRate::Baud921600),
                _ => None,
            }
        }
    }

    /// Unit used in standard data frames
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DistanceUnit {
        Centimeters = 0x01,
        Millimeters = 0x06,
    }

    /// Commands understood by the sensor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Command {
        FirmwareVersion,
        /// Single measurement when the frame rate is 0
        TriggerDetection,
        SoftReset,
        /// Restore factory defaults
        HardReset,
        SaveSettings,
        /// Output rate in Hz, 0 for triggered mode
        SetFrameRate(u16),
        SetBaudRate(BaudRate),
        OutputFormat(DistanceUnit),
        EnableOutput,
        DisableOutput,
    }

    impl Command {
        /// Command id byte
        pub fn id(&self) -> u8 {
            match self {
                Command::FirmwareVersion => ID_FIRMWARE_VERSION,
                Command::TriggerDetection => ID_TRIGGER_DETECTION,
                Command::SoftReset => ID_SOFT_RESET,
                Command::HardReset => ID_HARD_RESET,
                Command::SaveSettings => ID_SAVE_SETTINGS,
                Command::SetFrameRate(_) => ID_FRAME_RATE,
                Command::SetBaudRate(_) => ID_BAUD_RATE,
                Command::OutputFormat(_) => ID_OUTPUT_FORMAT,
                Command::EnableOutput | Command::DisableOutput => ID_OUTPUT_ENABLE,
            }
        }

        /// Length of the 0x5A reply, or `None` when the sensor answers with
        /// a data frame (trigger) instead
        pub fn reply_len(&self) -> Option<usize> {
            match self {
                Command::FirmwareVersion => Some(7),
                Command::TriggerDetection => None,
                Command::SoftReset | Command::HardReset | Command::SaveSettings => Some(5),
                Command::SetFrameRate(_) => Some(6),
                Command::SetBaudRate(_) => Some(8),
                Command::OutputFormat(_) | Command::EnableOutput | Command::DisableOutput => {
                    Some(5)
                }
            }
        }

        /// Build the wire bytes for this command
        pub fn encode(&self) -> Encoded {
            let mut bytes = [0u8; MAX_COMMAND_SIZE];
            let mut len = 3;
            bytes[0] = COMMAND_HEADER;
            bytes[2] = self.id();

            match *self {
                Command::SetFrameRate(hz) => {
                    bytes[3..5].copy_from_slice(&hz.to_le_bytes());
                    len += 2;
                }
                Command::SetBaudRate(baud) => {
                    bytes[3..7].copy_from_slice(&baud.as_u32().to_le_bytes());
                    len += 4;
                }
                Command::OutputFormat(unit) => {
                    bytes[3] = unit as u8;
                    len += 1;
                }
                Command::EnableOutput => {
                    bytes[3] = 0x01;
                    len += 1;
                }
                Command::DisableOutput => {
                    bytes[3] = 0x00;
                    len += 1;
                }
                _ => {}
            }

            // Length counts the checksum byte as well
            len += 1;
            bytes[1] = len as u8;
            bytes[len - 1] = checksum(&bytes[..len - 1]);

            Encoded { bytes, len }
        }
    }

    /// Wire form of a command
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Encoded {
        bytes: [u8; MAX_COMMAND_SIZE],
        len: usize,
    }

    impl Encoded {
        pub fn as_bytes(&self) -> &[u8] {
            &self.bytes[..self.len]
        }
    }

    /// Firmware version reported by the sensor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FirmwareVersion {
        pub major: u8,
        pub minor: u8,
        pub revision: u8,
    }

    impl core::fmt::Display for FirmwareVersion {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
        }
    }

    /// Decoded reply
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Reply {
        FirmwareVersion(FirmwareVersion),
        /// Reset or save result
        Status { success: bool },
        FrameRate(u16),
        BaudRate(u32),
        /// Reply echoing the command parameters
        Ack,
    }

    /// Reasons a reply is rejected
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ReplyError {
        Checksum { expected: u8, received: u8 },
        /// Reply length does not match the command
        Length(usize),
        /// Reply belongs to a different command
        UnexpectedCommand(u8),
    }

    /// Byte-fed parser for the reply to one command
    ///
    /// Data frames that keep streaming while the command is processed are
    /// skipped: only a 0x5A header followed by the expected length starts a
    /// reply.
    pub struct ReplyParser {
        command: Command,
        expected_len: usize,
        buffer: [u8; MAX_COMMAND_SIZE],
        index: usize,
    }

    impl ReplyParser {
        /// Create a parser for `command`'s reply
        ///
        /// Returns `None` for commands answered with a data frame.
        pub fn new(command: Command) -> Option<Self> {
            Some(Self {
                command,
                expected_len: command.reply_len()?,
                buffer: [0; MAX_COMMAND_SIZE],
                index: 0,
            })
        }

        pub fn feed_byte(&mut self, byte: u8) -> Option<Result<Reply, ReplyError>> {
            match self.index {
                0 => {
                    if byte == COMMAND_HEADER {
                        self.buffer[0] = byte;
                        self.index = 1;
                    }
                    return None;
                }
                1 => {
                    if byte as usize == self.expected_len {
                        self.buffer[1] = byte;
                        self.index = 2;
                    } else {
                        self.index = usize::from(byte == COMMAND_HEADER);
                    }
                    return None;
                }
                _ => {
                    self.buffer[self.index] = byte;
                    self.index += 1;
                }
            }

            if self.index < self.expected_len {
                return None;
            }

            self.index = 0;
            Some(decode_reply(self.command, &self.buffer[..self.expected_len]))
        }
    }

    /// Decode a complete reply to `command`
    pub fn decode_reply(command: Command, reply: &[u8]) -> Result<Reply, ReplyError> {
        let (last, body) = match reply.split_last() {
            Some(split) => split,
            None => return Err(ReplyError::Checksum { expected: 0, received: 0 }),
        };
        let expected = checksum(body);
        if expected != *last {
            return Err(ReplyError::Checksum {
                expected,
                received: *last,
            });
        }
        if command.reply_len() != Some(reply.len()) {
            return Err(ReplyError::Length(reply.len()));
        }
        if reply[2] != command.id() {
            return Err(ReplyError::UnexpectedCommand(reply[2]));
        }

        let reply = match command {
            Command::FirmwareVersion => Reply::FirmwareVersion(FirmwareVersion {
                major: reply[5],
                minor: reply[4],
                revision: reply[3],
            }),
            Command::SoftReset | Command::HardReset | Command::SaveSettings => Reply::Status {
                success: reply[3] == 0,
            },
            Command::SetFrameRate(_) => Reply::FrameRate(u16::from_le_bytes([reply[3], reply[4]])),
            Command::SetBaudRate(_) => Reply::BaudRate(u32::from_le_bytes([
                reply[3], reply[4], reply[5], reply[6],
            ])),
            _ => Reply::Ack,
        };
        Ok(reply)
    }
}
