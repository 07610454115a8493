//! Control Point Procedure Engine
//!
//! A procedure is a control point write followed by an indication that
//! carries the sensor's answer. A device runs at most one at a time, under a
//! timeout timer.
//!
//! ```text
//!   start_procedure ── write ──► sensor
//!         │                        │
//!         │ timer                  │ indication [0x10, opcode, value, ...]
//!         ▼                        ▼
//!   FailureTimeout          complete_procedure ──► ProcedureComplete
//! ```

use crate::domain::error::{RscError, RscResult};
use crate::domain::events::RscEvent;
use crate::domain::facades::GattError;
use crate::domain::models::{
    BdAddr, ClientId, ConfigurationStatus, ProcedureId, ProcedureStatus,
};
use crate::profile::devices::{ActiveProcedure, ConfigurationState, ProcedureKind};
use crate::profile::manager::Context;
use crate::profile::protocol::{self, opcode};
use crate::profile::transactions::{GattRequest, TransactionEntry, TransactionKind};
use tracing::{debug, warn};

impl Context {
    pub(crate) fn start_procedure(
        &mut self,
        address: BdAddr,
        client: ClientId,
        kind: ProcedureKind,
    ) -> RscResult<ProcedureId> {
        let entry = self.devices.get(address).ok_or(RscError::NotConnected)?;

        if !kind.is_internal() && entry.state != ConfigurationState::Configured {
            return Err(RscError::NotConfigured);
        }
        let control_point = entry
            .handles
            .control_point
            .ok_or(RscError::FeatureNotSupported)?;
        if entry.procedure.is_some() {
            return Err(RscError::ProcedureInProgress);
        }

        let transaction = self.submit(
            address,
            TransactionKind::WriteControlPoint,
            client,
            GattRequest::Write(control_point.value, kind.command().to_bytes()),
        )?;

        let id = self.procedure_ids.next_id();
        let timer = match self.facades.timer.start(self.config.procedure_timeout, id) {
            Ok(timer) => timer,
            Err(e) => {
                warn!("Could not start procedure timer for {}: {:#}", address, e);
                self.transactions.cancel(transaction);
                return Err(RscError::Timer(e.to_string()));
            }
        };

        if let Some(entry) = self.devices.get_mut(address) {
            entry.procedure = Some(ActiveProcedure {
                kind,
                id,
                timer,
                transaction,
            });
        }
        debug!("Procedure {} ({:?}) started on {}", id, kind, address);
        Ok(id)
    }

    /// Forget the active procedure of a device, stopping its timer and
    /// dropping its control point write if still pending.
    pub(crate) fn clear_procedure(&mut self, address: BdAddr) -> Option<ActiveProcedure> {
        let procedure = self.devices.get_mut(address)?.procedure.take()?;
        self.facades.timer.stop(procedure.timer);
        self.transactions.cancel(procedure.transaction);
        Some(procedure)
    }

    fn caller_procedure_pending(&self, address: BdAddr) -> bool {
        self.devices
            .get(address)
            .and_then(|e| e.procedure)
            .is_some_and(|p| !p.kind.is_internal())
    }

    /// Complete a caller procedure that can no longer be answered because
    /// the device is leaving the `Configured` state.
    pub(crate) fn abort_caller_procedure(&mut self, address: BdAddr) {
        if self.caller_procedure_pending(address) {
            debug!("Aborting the procedure outstanding on {}", address);
            self.complete_procedure(address, ProcedureStatus::FailureUnknown, 0);
        }
    }

    /// Drop the internal supported-locations request, leaving caller
    /// procedures alone.
    pub(crate) fn clear_internal_procedure(&mut self, address: BdAddr) {
        let internal = self
            .devices
            .get(address)
            .and_then(|e| e.procedure)
            .is_some_and(|p| p.kind.is_internal());
        if internal {
            self.clear_procedure(address);
        }
    }

    fn complete_procedure(&mut self, address: BdAddr, status: ProcedureStatus, response_code: u8) {
        let Some(procedure) = self.clear_procedure(address) else {
            return;
        };
        debug!(
            "Procedure {} on {} complete: {:?} ({:#04X})",
            procedure.id, address, status, response_code
        );
        self.broadcast(RscEvent::ProcedureComplete {
            address,
            procedure_id: procedure.id,
            status,
            response_code,
        });
    }

    /// An indication arrived on the control point of `address`
    pub(crate) fn on_control_point_indication(&mut self, address: BdAddr, value: &[u8]) {
        let Some(entry) = self.devices.get(address) else {
            return;
        };

        match entry.state {
            ConfigurationState::Configured => self.on_procedure_response(address, value),
            ConfigurationState::GettingSupportedLocations => {
                self.on_supported_locations_response(address, value)
            }
            state => debug!("Ignoring control point indication from {} in {:?}", address, state),
        }
    }

    fn on_procedure_response(&mut self, address: BdAddr, value: &[u8]) {
        let Some(procedure) = self.devices.get(address).and_then(|e| e.procedure) else {
            warn!("Unsolicited control point indication from {}", address);
            return;
        };

        let response = match protocol::parse_control_point_response(value) {
            Ok(response) => response,
            Err(e) => {
                warn!("Invalid control point response from {}: {:#}", address, e);
                self.complete_procedure(address, ProcedureStatus::FailureInvalidResponse, 0);
                return;
            }
        };

        if response.request_opcode != procedure.kind.opcode() {
            warn!(
                "{} answered opcode {:#04X} while {:?} was pending",
                address, response.request_opcode, procedure.kind
            );
            self.complete_procedure(address, ProcedureStatus::FailureInvalidResponse, 0);
            return;
        }

        if !response.is_success() {
            self.complete_procedure(
                address,
                ProcedureStatus::FailureErrorResponse,
                response.response_value,
            );
            return;
        }

        match procedure.kind {
            ProcedureKind::UpdateCumulativeValue(cumulative_value) => {
                self.broadcast(RscEvent::CumulativeValueUpdated {
                    address,
                    cumulative_value,
                });
            }
            ProcedureKind::UpdateSensorLocation(location) => {
                self.broadcast(RscEvent::SensorLocationUpdated { address, location });
            }
            ProcedureKind::StartSensorCalibration | ProcedureKind::RequestSupportedSensorLocations => {}
        }
        self.complete_procedure(address, ProcedureStatus::Success, 0);
    }

    fn on_supported_locations_response(&mut self, address: BdAddr, value: &[u8]) {
        let pending = self
            .devices
            .get(address)
            .and_then(|e| e.procedure)
            .is_some_and(|p| p.kind.is_internal());
        if !pending {
            debug!("No supported locations request pending on {}", address);
            return;
        }

        let response = match protocol::parse_control_point_response(value) {
            Ok(response) => response,
            Err(e) => {
                warn!("Invalid supported locations response from {}: {:#}", address, e);
                self.fail_configuration(address, ConfigurationStatus::UnknownError);
                return;
            }
        };

        if response.request_opcode != opcode::REQUEST_SUPPORTED_SENSOR_LOCATIONS {
            debug!(
                "Ignoring response to opcode {:#04X} from {} while getting locations",
                response.request_opcode, address
            );
            return;
        }

        self.clear_procedure(address);
        if response.is_success() {
            self.on_supported_locations(address, &response.supported_locations);
        } else {
            warn!(
                "{} refused the supported locations request ({:#04X})",
                address, response.response_value
            );
            self.fail_configuration(address, ConfigurationStatus::UnknownError);
        }
    }

    /// The control point write itself succeeded. Completion still waits for
    /// the indication.
    pub(crate) fn on_control_point_written(&mut self, transaction: &TransactionEntry) {
        debug!(
            "Control point write {} acknowledged by {}",
            transaction.id, transaction.address
        );
    }

    pub(crate) fn on_control_point_write_failed(
        &mut self,
        transaction: &TransactionEntry,
        error: GattError,
    ) {
        let address = transaction.address;
        let Some(entry) = self.devices.get(address) else {
            return;
        };
        if entry.procedure.map(|p| p.transaction) != Some(transaction.id) {
            debug!("Stale control point error for {}", address);
            return;
        }

        match entry.state {
            ConfigurationState::GettingSupportedLocations => {
                warn!("Supported locations request to {} failed: {:?}", address, error);
                self.fail_configuration(address, ConfigurationStatus::GattOperationFailure);
            }
            _ => {
                let response_code = match error {
                    GattError::ErrorResponse { att_error_code } => att_error_code,
                    _ => 0,
                };
                self.complete_procedure(
                    address,
                    protocol::procedure_status_for(error),
                    response_code,
                );
            }
        }
    }

    /// A procedure timer fired. Stale timers of finished procedures or
    /// removed devices are ignored.
    pub(crate) fn on_procedure_timeout(&mut self, procedure_id: ProcedureId) {
        let Some(address) = self.devices.find_by_procedure(procedure_id) else {
            debug!("Timer for finished procedure {} ignored", procedure_id);
            return;
        };
        let internal = self
            .devices
            .get(address)
            .and_then(|e| e.procedure)
            .is_some_and(|p| p.kind.is_internal());

        warn!("Procedure {} on {} timed out", procedure_id, address);
        if internal {
            self.fail_configuration(address, ConfigurationStatus::GattOperationFailure);
        } else {
            self.complete_procedure(address, ProcedureStatus::FailureTimeout, 0);
        }
    }
}
