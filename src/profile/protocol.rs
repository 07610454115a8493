//! Running Speed and Cadence Protocol
//!
//! GATT identifiers for the RSC service and the byte layouts of the values
//! this manager writes to and decodes from a remote sensor.

use crate::domain::facades::GattError;
use crate::domain::models::{
    measurement_flags, MeasurementData, ProcedureStatus, SensorLocation, SensorLocationStatus,
};
use anyhow::{anyhow, Result};
use uuid::Uuid;

/// Running Speed and Cadence service
pub const RSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001814_0000_1000_8000_00805f9b34fb);

/// RSC Measurement characteristic (notify)
pub const RSC_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x00002a53_0000_1000_8000_00805f9b34fb);

/// RSC Feature characteristic (read)
pub const RSC_FEATURE_UUID: Uuid = Uuid::from_u128(0x00002a54_0000_1000_8000_00805f9b34fb);

/// SC Control Point characteristic (write, indicate)
pub const SC_CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x00002a55_0000_1000_8000_00805f9b34fb);

/// Sensor Location characteristic (read)
pub const SENSOR_LOCATION_UUID: Uuid = Uuid::from_u128(0x00002a5d_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Values written to a Client Characteristic Configuration descriptor
pub mod cccd {
    pub const DISABLE: u16 = 0x0000;
    pub const NOTIFY: u16 = 0x0001;
    pub const INDICATE: u16 = 0x0002;

    pub fn value(config: u16) -> [u8; 2] {
        config.to_le_bytes()
    }
}

/// SC Control Point opcodes
pub mod opcode {
    pub const SET_CUMULATIVE_VALUE: u8 = 0x01;
    pub const START_SENSOR_CALIBRATION: u8 = 0x02;
    pub const UPDATE_SENSOR_LOCATION: u8 = 0x03;
    pub const REQUEST_SUPPORTED_SENSOR_LOCATIONS: u8 = 0x04;
    pub const RESPONSE_CODE: u8 = 0x10;
}

/// SC Control Point response values
pub mod response_value {
    pub const SUCCESS: u8 = 0x01;
    pub const OP_CODE_NOT_SUPPORTED: u8 = 0x02;
    pub const INVALID_PARAMETER: u8 = 0x03;
    pub const OPERATION_FAILED: u8 = 0x04;
}

/// ATT error codes with a dedicated status mapping
pub mod att_error {
    pub const INVALID_HANDLE: u8 = 0x01;
    pub const INSUFFICIENT_AUTHENTICATION: u8 = 0x05;
    pub const INSUFFICIENT_ENCRYPTION_KEY_SIZE: u8 = 0x0C;
    pub const INSUFFICIENT_ENCRYPTION: u8 = 0x0F;
    pub const INSUFFICIENT_RESOURCES: u8 = 0x11;
    /// Client Characteristic Configuration Descriptor Improperly Configured
    pub const CCCD_IMPROPERLY_CONFIGURED: u8 = 0xFD;
}

/// Commands written to the SC Control Point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPointCommand {
    SetCumulativeValue(u32),
    StartSensorCalibration,
    UpdateSensorLocation(SensorLocation),
    RequestSupportedSensorLocations,
}

impl ControlPointCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::SetCumulativeValue(_) => opcode::SET_CUMULATIVE_VALUE,
            Self::StartSensorCalibration => opcode::START_SENSOR_CALIBRATION,
            Self::UpdateSensorLocation(_) => opcode::UPDATE_SENSOR_LOCATION,
            Self::RequestSupportedSensorLocations => opcode::REQUEST_SUPPORTED_SENSOR_LOCATIONS,
        }
    }

    /// Encode the command: the opcode followed by its little-endian operand
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.opcode()];
        match self {
            Self::SetCumulativeValue(value) => bytes.extend_from_slice(&value.to_le_bytes()),
            Self::UpdateSensorLocation(location) => bytes.push(location.code()),
            Self::StartSensorCalibration | Self::RequestSupportedSensorLocations => {}
        }
        bytes
    }
}

/// A decoded SC Control Point indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPointResponse {
    pub request_opcode: u8,
    pub response_value: u8,
    /// Raw location codes, only filled for a successful
    /// request-supported-sensor-locations response
    pub supported_locations: Vec<u8>,
}

impl ControlPointResponse {
    pub fn is_success(&self) -> bool {
        self.response_value == response_value::SUCCESS
    }
}

/// Parse an SC Control Point indication
///
/// ```text
/// [0]    : Response opcode (0x10)
/// [1]    : Request opcode being answered
/// [2]    : Response value
/// [3..]  : Response parameter (supported location list for opcode 0x04)
/// ```
pub fn parse_control_point_response(bytes: &[u8]) -> Result<ControlPointResponse> {
    if bytes.len() < 3 {
        return Err(anyhow!("Control point response too short: {}", bytes.len()));
    }

    if bytes[0] != opcode::RESPONSE_CODE {
        return Err(anyhow!("Unexpected control point opcode: {:#04X}", bytes[0]));
    }

    let request_opcode = bytes[1];
    let response_value = bytes[2];
    let supported_locations = if request_opcode == opcode::REQUEST_SUPPORTED_SENSOR_LOCATIONS
        && response_value == response_value::SUCCESS
    {
        bytes[3..].to_vec()
    } else {
        Vec::new()
    };

    Ok(ControlPointResponse {
        request_opcode,
        response_value,
        supported_locations,
    })
}

/// Parse an RSC Measurement notification
///
/// ```text
/// [0]     : Flags
///           bit 0: Instantaneous stride length present
///           bit 1: Total distance present
///           bit 2: Walking (0) or running (1)
/// [1-2]   : Instantaneous speed (u16 little-endian, 1/256 m/s)
/// [3]     : Instantaneous cadence (u8, 1/min)
/// [..+2]  : Instantaneous stride length (u16, cm), if bit 0
/// [..+4]  : Total distance (u32, 1/10 m), if bit 1
/// ```
pub fn parse_measurement(bytes: &[u8]) -> Result<MeasurementData> {
    if bytes.len() < 4 {
        return Err(anyhow!("Measurement too short: {}", bytes.len()));
    }

    let flags = bytes[0] as u32;
    let mut data = MeasurementData {
        flags,
        instantaneous_speed: u16::from_le_bytes([bytes[1], bytes[2]]),
        instantaneous_cadence: bytes[3],
        ..Default::default()
    };

    let mut rest = &bytes[4..];

    if flags & measurement_flags::STRIDE_LENGTH_PRESENT != 0 {
        if rest.len() < 2 {
            return Err(anyhow!("Measurement missing stride length"));
        }
        data.instantaneous_stride_length = u16::from_le_bytes([rest[0], rest[1]]);
        rest = &rest[2..];
    }

    if flags & measurement_flags::TOTAL_DISTANCE_PRESENT != 0 {
        if rest.len() < 4 {
            return Err(anyhow!("Measurement missing total distance"));
        }
        data.total_distance = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
    }

    Ok(data)
}

/// Parse the RSC Feature characteristic value.
///
/// The characteristic is 16 bits wide but some sensors only return the low
/// byte.
pub fn parse_features(bytes: &[u8]) -> Result<u32> {
    match bytes {
        [] => Err(anyhow!("Empty feature value")),
        [low] => Ok(*low as u32),
        [low, high, ..] => Ok(u16::from_le_bytes([*low, *high]) as u32),
    }
}

/// Parse the Sensor Location characteristic value, which must be exactly one
/// valid location code.
pub fn parse_sensor_location(bytes: &[u8]) -> Option<SensorLocation> {
    match bytes {
        [code] => SensorLocation::from_u8(*code),
        _ => None,
    }
}

/// Convert a list of location codes to a supported-locations mask. Codes
/// outside the assigned range count as "other".
pub fn locations_to_mask(codes: &[u8]) -> u32 {
    codes.iter().fold(0, |mask, code| {
        mask | SensorLocation::from_u8(*code)
            .unwrap_or(SensorLocation::Other)
            .mask_bit()
    })
}

/// Build a measurement notification payload
pub fn encode_measurement(data: &MeasurementData) -> Vec<u8> {
    let flags = (data.flags & 0xFF) as u8;
    let mut bytes = vec![flags];
    bytes.extend_from_slice(&data.instantaneous_speed.to_le_bytes());
    bytes.push(data.instantaneous_cadence);
    if data.flags & measurement_flags::STRIDE_LENGTH_PRESENT != 0 {
        bytes.extend_from_slice(&data.instantaneous_stride_length.to_le_bytes());
    }
    if data.flags & measurement_flags::TOTAL_DISTANCE_PRESENT != 0 {
        bytes.extend_from_slice(&data.total_distance.to_le_bytes());
    }
    bytes
}

pub fn procedure_status_for(error: GattError) -> ProcedureStatus {
    match error {
        GattError::ProtocolTimeout => ProcedureStatus::FailureTimeout,
        GattError::ErrorResponse { att_error_code } => match att_error_code {
            att_error::INSUFFICIENT_AUTHENTICATION
            | att_error::INSUFFICIENT_ENCRYPTION
            | att_error::INSUFFICIENT_ENCRYPTION_KEY_SIZE => ProcedureStatus::FailureSecurity,
            att_error::INSUFFICIENT_RESOURCES => ProcedureStatus::InsufficientResources,
            _ => ProcedureStatus::FailureUnknown,
        },
        GattError::Other => ProcedureStatus::FailureUnknown,
    }
}

pub fn sensor_location_status_for(error: GattError) -> SensorLocationStatus {
    match procedure_status_for(error) {
        ProcedureStatus::FailureTimeout => SensorLocationStatus::FailureTimeout,
        ProcedureStatus::FailureSecurity => SensorLocationStatus::FailureSecurity,
        ProcedureStatus::InsufficientResources => SensorLocationStatus::InsufficientResources,
        _ => SensorLocationStatus::FailureUnknown,
    }
}
