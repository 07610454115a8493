use crate::domain::models::{
    BdAddr, ConfigurationStatus, MeasurementData, ProcedureId, ProcedureStatus, SensorLocation,
    SensorLocationStatus,
};
use serde::{Deserialize, Serialize};

/// Events delivered to registered subscribers, locally through a callback
/// and remotely as an IPC message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RscEvent {
    Connected {
        address: BdAddr,
        configured: bool,
        supported_optional_characteristics: u32,
    },
    Disconnected {
        address: BdAddr,
    },
    ConfigurationStatusChanged {
        address: BdAddr,
        status: ConfigurationStatus,
    },
    Measurement {
        address: BdAddr,
        data: MeasurementData,
    },
    /// Answer to a `get_sensor_location` request, sent only to the
    /// requesting client.
    SensorLocationResponse {
        address: BdAddr,
        status: SensorLocationStatus,
        location: Option<SensorLocation>,
    },
    CumulativeValueUpdated {
        address: BdAddr,
        cumulative_value: u32,
    },
    SensorLocationUpdated {
        address: BdAddr,
        location: SensorLocation,
    },
    ProcedureComplete {
        address: BdAddr,
        procedure_id: ProcedureId,
        status: ProcedureStatus,
        /// Response value or ATT error code reported by the sensor, 0 if none
        response_code: u8,
    },
}

impl RscEvent {
    pub fn address(&self) -> BdAddr {
        match self {
            Self::Connected { address, .. }
            | Self::Disconnected { address }
            | Self::ConfigurationStatusChanged { address, .. }
            | Self::Measurement { address, .. }
            | Self::SensorLocationResponse { address, .. }
            | Self::CumulativeValueUpdated { address, .. }
            | Self::SensorLocationUpdated { address, .. }
            | Self::ProcedureComplete { address, .. } => *address,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::ConfigurationStatusChanged { .. } => "configuration-status-changed",
            Self::Measurement { .. } => "measurement",
            Self::SensorLocationResponse { .. } => "sensor-location-response",
            Self::CumulativeValueUpdated { .. } => "cumulative-value-updated",
            Self::SensorLocationUpdated { .. } => "sensor-location-updated",
            Self::ProcedureComplete { .. } => "procedure-complete",
        }
    }
}
