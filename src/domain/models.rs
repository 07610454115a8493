//! Profile Data Model
//!
//! Plain data shared between the profile manager core, its facades and the
//! IPC surface: addresses, identifiers, capability masks, status codes and
//! decoded measurements.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 48-bit Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// The all-zero address, never a valid remote device
    pub const NULL: Self = Self([0; 6]);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Bluetooth address: {0}")]
pub struct AddressParseError(String);

impl FromStr for BdAddr {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');

        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| AddressParseError(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(AddressParseError(s.to_string()));
        }

        Ok(Self(bytes))
    }
}

impl Serialize for BdAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BdAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifies who issued a request or registered for events.
///
/// [`ClientId::SERVER`] is the in-process owner of the manager; every other
/// value is a remote IPC client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const SERVER: Self = Self(0);

    pub fn is_server(&self) -> bool {
        *self == Self::SERVER
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_server() {
            write!(f, "server")
        } else {
            write!(f, "client#{}", self.0)
        }
    }
}

/// The handle of a remote ATT attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AttHandle(pub u16);

pub type CallbackId = u32;
pub type ProcedureId = u32;
pub type TransactionId = u32;
/// Correlation id handed out by the GATT access facade
pub type GattTransactionId = u32;
pub type TimerId = u64;

/// RSC Feature characteristic bits
pub mod features {
    pub const INSTANTANEOUS_STRIDE_LENGTH: u32 = 0x01;
    pub const TOTAL_DISTANCE: u32 = 0x02;
    pub const WALKING_OR_RUNNING_STATUS: u32 = 0x04;
    pub const CALIBRATION_PROCEDURE: u32 = 0x08;
    pub const MULTIPLE_SENSOR_LOCATIONS: u32 = 0x10;
}

/// Optional characteristics found during discovery
pub mod optional_characteristics {
    pub const SENSOR_LOCATION: u32 = 0x01;
    pub const CONTROL_POINT: u32 = 0x02;
}

/// Flags accepted by `configure_remote_sensor`
pub mod configure_flags {
    /// Do not query the supported sensor locations even if the sensor
    /// advertises multiple locations.
    pub const SKIP_SUPPORTED_SENSOR_LOCATIONS: u32 = 0x01;
}

/// Mounting position reported by a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SensorLocation {
    Other = 0,
    TopOfShoe = 1,
    InShoe = 2,
    Hip = 3,
    FrontWheel = 4,
    LeftCrank = 5,
    RightCrank = 6,
    LeftPedal = 7,
    RightPedal = 8,
    FrontHub = 9,
    RearDropout = 10,
    Chainstay = 11,
    RearWheel = 12,
    RearHub = 13,
    Chest = 14,
}

impl SensorLocation {
    pub const ALL: [Self; 15] = [
        Self::Other,
        Self::TopOfShoe,
        Self::InShoe,
        Self::Hip,
        Self::FrontWheel,
        Self::LeftCrank,
        Self::RightCrank,
        Self::LeftPedal,
        Self::RightPedal,
        Self::FrontHub,
        Self::RearDropout,
        Self::Chainstay,
        Self::RearWheel,
        Self::RearHub,
        Self::Chest,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Bit representing this location in a supported-locations mask
    pub fn mask_bit(self) -> u32 {
        1 << self.code()
    }
}

/// Summary of a connected sensor as exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedSensor {
    pub address: BdAddr,
    pub configured: bool,
    pub supported_optional_characteristics: u32,
    pub supported_features: u32,
    pub supported_sensor_locations: u32,
}

/// Measurement flag bits. The low byte mirrors the RSC Measurement flags
/// field; the high bit is added locally.
pub mod measurement_flags {
    pub const STRIDE_LENGTH_PRESENT: u32 = 0x01;
    pub const TOTAL_DISTANCE_PRESENT: u32 = 0x02;
    pub const RUNNING: u32 = 0x04;
    /// Set when the sensor advertises walking/running status support, so
    /// the `RUNNING` bit is meaningful.
    pub const WALKING_RUNNING_STATUS_VALID: u32 = 0x8000_0000;
}

/// A decoded RSC Measurement notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MeasurementData {
    pub flags: u32,
    /// Units of 1/256 m/s
    pub instantaneous_speed: u16,
    /// Steps (or strides) per minute
    pub instantaneous_cadence: u8,
    /// Centimetres
    pub instantaneous_stride_length: u16,
    /// Units of 1/10 m
    pub total_distance: u32,
}

impl MeasurementData {
    pub fn stride_length(&self) -> Option<u16> {
        (self.flags & measurement_flags::STRIDE_LENGTH_PRESENT != 0)
            .then_some(self.instantaneous_stride_length)
    }

    pub fn total_distance(&self) -> Option<u32> {
        (self.flags & measurement_flags::TOTAL_DISTANCE_PRESENT != 0).then_some(self.total_distance)
    }

    /// `Some(true)` when running, `Some(false)` when walking, `None` if the
    /// sensor does not report the status.
    pub fn is_running(&self) -> Option<bool> {
        (self.flags & measurement_flags::WALKING_RUNNING_STATUS_VALID != 0)
            .then_some(self.flags & measurement_flags::RUNNING != 0)
    }

    pub fn speed_mps(&self) -> f32 {
        self.instantaneous_speed as f32 / 256.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationStatus {
    Success,
    GattOperationFailure,
    UnknownError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorLocationStatus {
    Success,
    FailureSecurity,
    InsufficientResources,
    FailureTimeout,
    FailureUnknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureStatus {
    Success,
    FailureSecurity,
    InsufficientResources,
    FailureTimeout,
    FailureInvalidResponse,
    FailureErrorResponse,
    FailureUnknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_and_display() {
        let addr: BdAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(addr.0, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
        assert!("AA:BB:CC".parse::<BdAddr>().is_err());
        assert!("AA:BB:CC:DD:EE:FF:00".parse::<BdAddr>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<BdAddr>().is_err());
        assert!(BdAddr::NULL.is_null());
    }

    #[test]
    fn test_address_serializes_as_string() {
        let addr: BdAddr = "01:02:03:04:05:06".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"01:02:03:04:05:06\"");
        let back: BdAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_sensor_location_codes() {
        assert_eq!(SensorLocation::from_u8(14), Some(SensorLocation::Chest));
        assert_eq!(SensorLocation::from_u8(15), None);
        assert_eq!(SensorLocation::InShoe.mask_bit(), 0x04);
    }

    #[test]
    fn test_measurement_optional_fields() {
        let data = MeasurementData {
            flags: measurement_flags::RUNNING | measurement_flags::WALKING_RUNNING_STATUS_VALID,
            instantaneous_speed: 512,
            ..Default::default()
        };
        assert_eq!(data.is_running(), Some(true));
        assert_eq!(data.stride_length(), None);
        assert_eq!(data.speed_mps(), 2.0);
    }
}
