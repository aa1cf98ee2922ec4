//! WT9011 Protocol
//!
//! Frame decoding and command encoding for the WT9011 motion sensor, plus
//! the two capability traits the session consumes them through.

use crate::domain::models::{Angles, Command, CommandIntent, SensorSample, Vec3};
use crate::error::BridgeError;
use crate::Result;

/// First byte of every data frame
pub const FRAME_HEADER: u8 = 0x55;
/// Second byte of a combined accel/gyro/angle frame
pub const FRAME_KIND_IMU: u8 = 0x61;
/// Minimum length of a combined frame
pub const FRAME_LEN: usize = 20;

/// Prefix of every configuration command
pub const COMMAND_PREFIX: [u8; 2] = [0xFF, 0xAA];

/// Accepted output rates in Hz
pub const RETURN_RATE_RANGE: std::ops::RangeInclusive<i32> = 1..=100;

/// Full-scale ranges used to convert raw i16 readings
pub mod scale {
    /// ±16 g
    pub const ACCEL: f32 = 16.0;
    /// ±2000 °/s
    pub const GYRO: f32 = 2000.0;
    /// ±180 °
    pub const ANGLE: f32 = 180.0;
    pub const RAW_FULL_SCALE: f32 = 32768.0;
}

/// Register addresses for configuration commands
mod register {
    pub const SAVE: u8 = 0x00;
    pub const CALIBRATE: u8 = 0x01;
    pub const FACTORY_RESET: u8 = 0x03;
    pub const SLEEP: u8 = 0x06;
    pub const ACCEL_ENABLE: u8 = 0x10;
    pub const GYRO_ENABLE: u8 = 0x11;
    pub const RETURN_RATE: u8 = 0x15;
    pub const ZEROING: u8 = 0x52;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("frame too short: {len} bytes (expected at least {})", FRAME_LEN)]
    TooShort { len: usize },

    #[error("unexpected frame header {0:02X} {1:02X}")]
    BadHeader(u8, u8),
}

/// Decodes raw notification frames into samples.
pub trait FrameParser: Send + Sync {
    fn parse(&self, frame: &[u8]) -> std::result::Result<SensorSample, ParseError>;
}

/// Encodes named commands into device payloads. Owns range validation.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, intent: &CommandIntent) -> Result<Command>;
}

/// WT9011 frame parser
///
/// # Frame Structure (20 bytes, little-endian i16 values)
///
/// ```text
/// [0]      : 0x55 header
/// [1]      : 0x61 combined IMU frame
/// [2-7]    : Accel X, Y, Z
/// [8-13]   : Gyro X, Y, Z
/// [14-19]  : Roll, Pitch, Yaw
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Wt9011Parser;

impl FrameParser for Wt9011Parser {
    fn parse(&self, frame: &[u8]) -> std::result::Result<SensorSample, ParseError> {
        parse_raw_bytes(frame)
    }
}

fn read_i16(bytes: &[u8], offset: usize) -> f32 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as f32
}

fn scaled(raw: f32, full_scale: f32) -> f32 {
    raw / scale::RAW_FULL_SCALE * full_scale
}

/// Parse a raw frame into a SensorSample
pub fn parse_raw_bytes(bytes: &[u8]) -> std::result::Result<SensorSample, ParseError> {
    if bytes.len() < FRAME_LEN {
        return Err(ParseError::TooShort { len: bytes.len() });
    }
    if bytes[0] != FRAME_HEADER || bytes[1] != FRAME_KIND_IMU {
        return Err(ParseError::BadHeader(bytes[0], bytes[1]));
    }

    #[cfg(debug_assertions)]
    tracing::trace!("Raw frame: {:02X?}", &bytes[..FRAME_LEN]);

    let accel = Vec3::new(
        scaled(read_i16(bytes, 2), scale::ACCEL),
        scaled(read_i16(bytes, 4), scale::ACCEL),
        scaled(read_i16(bytes, 6), scale::ACCEL),
    );
    let gyro = Vec3::new(
        scaled(read_i16(bytes, 8), scale::GYRO),
        scaled(read_i16(bytes, 10), scale::GYRO),
        scaled(read_i16(bytes, 12), scale::GYRO),
    );

    let mut yaw = scaled(read_i16(bytes, 18), scale::ANGLE);
    if yaw > 180.0 {
        yaw -= 360.0;
    }
    let angle = Angles {
        roll: scaled(read_i16(bytes, 14), scale::ANGLE),
        pitch: scaled(read_i16(bytes, 16), scale::ANGLE),
        yaw,
    };

    Ok(SensorSample { accel, gyro, angle })
}

/// WT9011 command encoder: `FF AA <register> <value>`
#[derive(Debug, Clone, Copy, Default)]
pub struct Wt9011Commands;

impl Wt9011Commands {
    fn register_write(register: u8, value: u8) -> Command {
        Command::new([COMMAND_PREFIX[0], COMMAND_PREFIX[1], register, value])
    }
}

impl CommandBuilder for Wt9011Commands {
    fn build(&self, intent: &CommandIntent) -> Result<Command> {
        let command = match *intent {
            CommandIntent::Zeroing => Self::register_write(register::ZEROING, 0x00),
            CommandIntent::Calibration => Self::register_write(register::CALIBRATE, 0x00),
            CommandIntent::SaveSettings => Self::register_write(register::SAVE, 0x00),
            CommandIntent::FactoryReset => Self::register_write(register::FACTORY_RESET, 0x00),
            CommandIntent::Sleep => Self::register_write(register::SLEEP, 0x00),
            CommandIntent::Wakeup => Self::register_write(register::SLEEP, 0x01),
            CommandIntent::SetReturnRate(rate_hz) => {
                if !RETURN_RATE_RANGE.contains(&rate_hz) {
                    return Err(BridgeError::InvalidCommand(format!(
                        "return rate must be {}-{} Hz, got {}",
                        RETURN_RATE_RANGE.start(),
                        RETURN_RATE_RANGE.end(),
                        rate_hz
                    )));
                }
                Self::register_write(register::RETURN_RATE, rate_hz as u8)
            }
            CommandIntent::SetAccelEnabled(enabled) => {
                Self::register_write(register::ACCEL_ENABLE, enabled as u8)
            }
            CommandIntent::SetGyroEnabled(enabled) => {
                Self::register_write(register::GYRO_ENABLE, enabled as u8)
            }
        };
        Ok(command)
    }
}

/// Parse a UUID string (with or without dashes) into its 128-bit value
pub fn parse_uuid(uuid_str: &str) -> Result<u128> {
    let hex = uuid_str.replace('-', "");
    if hex.len() != 32 {
        return Err(BridgeError::Init(format!("Invalid UUID format: {}", uuid_str)));
    }
    u128::from_str_radix(&hex, 16)
        .map_err(|e| BridgeError::Init(format!("Invalid UUID {}: {}", uuid_str, e)))
}

/// Render a 48-bit Bluetooth address as `AA:BB:CC:DD:EE:FF`
pub fn format_address(address: u64) -> String {
    (0..6)
        .rev()
        .map(|i| format!("{:02X}", (address >> (i * 8)) & 0xFF))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse `AA:BB:CC:DD:EE:FF` (case-insensitive) back into its numeric form
pub fn parse_address(address: &str) -> Result<u64> {
    let parts: Vec<&str> = address.split(':').collect();
    if parts.len() != 6 {
        return Err(BridgeError::Transport(format!(
            "Invalid Bluetooth address: {}",
            address
        )));
    }
    parts.iter().try_fold(0u64, |acc, part| {
        u8::from_str_radix(part, 16)
            .map(|byte| (acc << 8) | byte as u64)
            .map_err(|_| BridgeError::Transport(format!("Invalid Bluetooth address: {}", address)))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a frame from raw i16 readings.
    pub(crate) fn frame(accel: [i16; 3], gyro: [i16; 3], angle: [i16; 3]) -> Vec<u8> {
        let mut bytes = vec![FRAME_HEADER, FRAME_KIND_IMU];
        for value in accel.iter().chain(&gyro).chain(&angle) {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_parse_scales_readings() {
        let sample = Wt9011Parser
            .parse(&frame([2048, -2048, 0], [16384, 0, -16384], [8192, -8192, 0]))
            .unwrap();

        assert_eq!(sample.accel, Vec3::new(1.0, -1.0, 0.0));
        assert_eq!(sample.gyro, Vec3::new(1000.0, 0.0, -1000.0));
        assert_eq!(sample.angle.roll, 45.0);
        assert_eq!(sample.angle.pitch, -45.0);
        assert_eq!(sample.angle.yaw, 0.0);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut bytes = frame([0; 3], [0; 3], [0; 3]);
        bytes.extend_from_slice(&[0xDE, 0xAD]);
        assert!(parse_raw_bytes(&bytes).is_ok());
    }

    #[test]
    fn test_rejects_short_frame() {
        let bytes = frame([0; 3], [0; 3], [0; 3]);
        assert_eq!(
            parse_raw_bytes(&bytes[..19]),
            Err(ParseError::TooShort { len: 19 })
        );
    }

    #[test]
    fn test_rejects_wrong_header() {
        let mut bytes = frame([0; 3], [0; 3], [0; 3]);
        bytes[1] = 0x71;
        assert_eq!(parse_raw_bytes(&bytes), Err(ParseError::BadHeader(0x55, 0x71)));
    }

    #[test]
    fn test_command_bytes() {
        let cases = [
            (CommandIntent::Zeroing, [0xFF, 0xAA, 0x52, 0x00]),
            (CommandIntent::Calibration, [0xFF, 0xAA, 0x01, 0x00]),
            (CommandIntent::SaveSettings, [0xFF, 0xAA, 0x00, 0x00]),
            (CommandIntent::FactoryReset, [0xFF, 0xAA, 0x03, 0x00]),
            (CommandIntent::Sleep, [0xFF, 0xAA, 0x06, 0x00]),
            (CommandIntent::Wakeup, [0xFF, 0xAA, 0x06, 0x01]),
            (CommandIntent::SetReturnRate(50), [0xFF, 0xAA, 0x15, 50]),
            (CommandIntent::SetAccelEnabled(true), [0xFF, 0xAA, 0x10, 0x01]),
            (CommandIntent::SetGyroEnabled(false), [0xFF, 0xAA, 0x11, 0x00]),
        ];
        for (intent, expected) in cases {
            let command = Wt9011Commands.build(&intent).unwrap();
            assert_eq!(command.as_bytes(), &expected, "{:?}", intent);
        }
    }

    #[test]
    fn test_return_rate_out_of_range() {
        for rate in [0, 101, -5] {
            let err = Wt9011Commands
                .build(&CommandIntent::SetReturnRate(rate))
                .unwrap_err();
            assert!(matches!(err, BridgeError::InvalidCommand(_)));
        }
        assert!(Wt9011Commands.build(&CommandIntent::SetReturnRate(1)).is_ok());
        assert!(Wt9011Commands.build(&CommandIntent::SetReturnRate(100)).is_ok());
    }

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid("0000ffe5-0000-1000-8000-00805f9a34fb").unwrap();
        assert_eq!(uuid >> 96, 0x0000ffe5);
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_address_formatting() {
        let raw = 0xC1_2A_3B_4C_5D_6E;
        let text = format_address(raw);
        assert_eq!(text, "C1:2A:3B:4C:5D:6E");
        assert_eq!(parse_address(&text).unwrap(), raw);
        assert_eq!(parse_address("c1:2a:3b:4c:5d:6e").unwrap(), raw);
        assert!(parse_address("C1:2A:3B").is_err());
        assert!(parse_address("C1:2A:3B:4C:5D:ZZ").is_err());
    }
}
