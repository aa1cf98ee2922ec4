use serde::{Deserialize, Serialize};
use std::fmt;

/// A device found during a scan. `address` is what `connect` takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub address: String,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Orientation in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Angles {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// One decoded telemetry reading.
///
/// Field order matches the C layout exposed by the FFI layer:
/// accel x/y/z, gyro x/y/z, roll/pitch/yaw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Acceleration in g
    pub accel: Vec3,
    /// Angular rate in degrees per second
    pub gyro: Vec3,
    pub angle: Angles,
}

/// Connection lifecycle of the single device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Scanning,
    Connecting,
    /// Connected; telemetry may or may not be subscribed yet
    Streaming,
    Disconnected,
    Faulted,
}

impl SessionState {
    /// Whether a live connection exists in this state
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Disconnected => "disconnected",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Named device commands. The byte encoding belongs to the command builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandIntent {
    /// Set the current orientation as zero
    Zeroing,
    /// Start accelerometer calibration
    Calibration,
    /// Persist current configuration on the device
    SaveSettings,
    FactoryReset,
    Sleep,
    Wakeup,
    /// Output rate in Hz
    SetReturnRate(i32),
    SetAccelEnabled(bool),
    SetGyroEnabled(bool),
}

impl CommandIntent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Zeroing => "zeroing",
            Self::Calibration => "calibration",
            Self::SaveSettings => "save_settings",
            Self::FactoryReset => "factory_reset",
            Self::Sleep => "sleep",
            Self::Wakeup => "wakeup",
            Self::SetReturnRate(_) => "set_return_rate",
            Self::SetAccelEnabled(_) => "set_accel_enabled",
            Self::SetGyroEnabled(_) => "set_gyro_enabled",
        }
    }
}

/// Opaque outgoing payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command(Vec<u8>);

impl Command {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Command {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Formats bytes as `FF AA 52 00` for logs.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0xFF, 0xAA, 0x52, 0x00]), "FF AA 52 00");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_only_streaming_is_connected() {
        assert!(SessionState::Streaming.is_connected());
        assert!(!SessionState::Connecting.is_connected());
        assert!(!SessionState::Disconnected.is_connected());
    }
}
