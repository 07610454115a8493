use crate::domain::error::{RscError, RscResult};
use crate::domain::events::RscEvent;
use crate::domain::models::{BdAddr, CallbackId, ConnectedSensor, ProcedureId, SensorLocation};
use serde::{Deserialize, Serialize};

/// Requests sent by an IPC client, one JSON document per line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RscRequest {
    Ping,
    /// Subscribe this connection to events
    Register,
    Unregister {
        callback_id: CallbackId,
    },
    QueryConnectedSensors {
        max_entries: usize,
    },
    GetConnectedSensorInfo {
        address: BdAddr,
    },
    Configure {
        address: BdAddr,
        flags: u32,
    },
    UnConfigure {
        address: BdAddr,
    },
    GetSensorLocation {
        address: BdAddr,
    },
    UpdateCumulativeValue {
        address: BdAddr,
        cumulative_value: u32,
    },
    UpdateSensorLocation {
        address: BdAddr,
        location: SensorLocation,
    },
    StartSensorCalibration {
        address: BdAddr,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RscReply {
    Pong,
    Done,
    Registered {
        callback_id: CallbackId,
    },
    ConnectedSensors {
        sensors: Vec<ConnectedSensor>,
        total: usize,
    },
    SensorInfo(ConnectedSensor),
    ProcedureStarted {
        procedure_id: ProcedureId,
    },
}

/// Outcome of one request. Failures carry the negative status code of the
/// in-process API.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RscResponse {
    Success(RscReply),
    Failure { code: i32, message: String },
}

impl From<RscResult<RscReply>> for RscResponse {
    fn from(result: RscResult<RscReply>) -> Self {
        match result {
            Ok(reply) => Self::Success(reply),
            Err(e) => Self::from(&e),
        }
    }
}

impl From<&RscError> for RscResponse {
    fn from(error: &RscError) -> Self {
        Self::Failure {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// Everything the server writes to a client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RscMessage {
    Response(RscResponse),
    Event(RscEvent),
}

/// Serialize one message as a newline-terminated JSON line
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    Ok(serde_json::to_string(message)? + "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_carries_status_code() {
        let response = RscResponse::from(RscResult::<RscReply>::Err(RscError::ProcedureInProgress));
        assert_eq!(
            response,
            RscResponse::Failure {
                code: -10,
                message: "a control point procedure is already in progress".to_string()
            }
        );
    }

    #[test]
    fn test_request_wire_format() {
        let request = RscRequest::Configure {
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            flags: 1,
        };
        let line = encode_line(&request).unwrap();
        assert_eq!(
            line,
            "{\"Configure\":{\"address\":\"AA:BB:CC:DD:EE:FF\",\"flags\":1}}\n"
        );
        let back: RscRequest = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(back, request);
    }
}
