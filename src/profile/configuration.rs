//! Configuration State Machine
//!
//! Drives a sensor through the CCCD writes and reads that make it usable,
//! and back. Each step completes asynchronously; the GATT completion of one
//! step submits the next.

use crate::domain::error::{RscError, RscResult};
use crate::domain::events::RscEvent;
use crate::domain::facades::GattError;
use crate::domain::models::{configure_flags, features, BdAddr, ClientId, ConfigurationStatus};
use crate::profile::devices::{describe_locations, ConfigurationState, ProcedureKind};
use crate::profile::manager::Context;
use crate::profile::protocol::{self, cccd};
use crate::profile::transactions::{GattRequest, TransactionKind};
use tracing::{debug, info, warn};

impl Context {
    pub(crate) fn configure(&mut self, address: BdAddr, flags: u32) -> RscResult<()> {
        let entry = self.devices.get_mut(address).ok_or(RscError::NotConnected)?;

        match entry.state {
            ConfigurationState::Configured => Err(RscError::AlreadyConfigured),
            state if state.is_configuring() => {
                debug!("{} is already being configured", address);
                Ok(())
            }
            state if state.is_unconfiguring() => Err(RscError::CurrentlyUnConfiguring),
            _ => {
                entry.skip_supported_locations =
                    flags & configure_flags::SKIP_SUPPORTED_SENSOR_LOCATIONS != 0;
                let handle = entry.handles.measurement_cccd;

                self.submit(
                    address,
                    TransactionKind::EnableMeasurementCccd,
                    ClientId::SERVER,
                    GattRequest::Write(handle, cccd::value(cccd::NOTIFY).to_vec()),
                )?;
                self.set_state(address, ConfigurationState::EnablingMeasurements);
                Ok(())
            }
        }
    }

    pub(crate) fn un_configure(&mut self, address: BdAddr) -> RscResult<()> {
        let entry = self.devices.get(address).ok_or(RscError::NotConnected)?;

        match entry.state {
            ConfigurationState::NotConfigured => Err(RscError::NotConfigured),
            state if state.is_configuring() => Err(RscError::CurrentlyConfiguring),
            state if state.is_unconfiguring() => {
                debug!("{} is already being un-configured", address);
                Ok(())
            }
            _ => {
                let (kind, handle, next) = match entry.handles.control_point {
                    Some(control_point) => (
                        TransactionKind::DisableControlPointCccd,
                        control_point.cccd,
                        ConfigurationState::DisablingControlPoint,
                    ),
                    None => (
                        TransactionKind::DisableMeasurementCccd,
                        entry.handles.measurement_cccd,
                        ConfigurationState::DisablingMeasurements,
                    ),
                };

                self.submit(
                    address,
                    kind,
                    ClientId::SERVER,
                    GattRequest::Write(handle, cccd::value(cccd::DISABLE).to_vec()),
                )?;
                self.abort_caller_procedure(address);
                self.set_state(address, next);
                Ok(())
            }
        }
    }

    /// Advance the handshake after the GATT completion of one of its steps.
    /// `result` carries the read value, empty for writes.
    pub(crate) fn on_configuration_step(
        &mut self,
        address: BdAddr,
        kind: TransactionKind,
        result: Result<&[u8], GattError>,
    ) {
        let Some(entry) = self.devices.get(address) else {
            debug!("Configuration step {:?} for unknown device {}", kind, address);
            return;
        };

        let expected = match entry.state {
            ConfigurationState::EnablingMeasurements => TransactionKind::EnableMeasurementCccd,
            ConfigurationState::EnablingControlPoint => TransactionKind::EnableControlPointCccd,
            ConfigurationState::GettingFeatures => TransactionKind::ReadFeatures,
            ConfigurationState::DisablingControlPoint => TransactionKind::DisableControlPointCccd,
            ConfigurationState::DisablingMeasurements => TransactionKind::DisableMeasurementCccd,
            state => {
                debug!("Ignoring {:?} for {} in state {:?}", kind, address, state);
                return;
            }
        };
        if kind != expected {
            warn!("Unexpected {:?} for {} while expecting {:?}", kind, address, expected);
            return;
        }

        let handles = entry.handles;
        let value = match result {
            Ok(value) => value,
            Err(error) => {
                warn!("Configuration step {:?} failed for {}: {:?}", kind, address, error);
                self.fail_configuration(address, ConfigurationStatus::GattOperationFailure);
                return;
            }
        };

        match kind {
            TransactionKind::EnableMeasurementCccd => match handles.control_point {
                Some(control_point) => self.step(
                    address,
                    TransactionKind::EnableControlPointCccd,
                    GattRequest::Write(control_point.cccd, cccd::value(cccd::INDICATE).to_vec()),
                    ConfigurationState::EnablingControlPoint,
                ),
                None => self.read_features(address),
            },
            TransactionKind::EnableControlPointCccd => self.read_features(address),
            TransactionKind::ReadFeatures => self.on_features(address, value),
            TransactionKind::DisableControlPointCccd => self.step(
                address,
                TransactionKind::DisableMeasurementCccd,
                GattRequest::Write(handles.measurement_cccd, cccd::value(cccd::DISABLE).to_vec()),
                ConfigurationState::DisablingMeasurements,
            ),
            TransactionKind::DisableMeasurementCccd => {
                if let Some(entry) = self.devices.get_mut(address) {
                    entry.supported_features = 0;
                    entry.supported_sensor_locations = 0;
                }
                self.finish_configuration(address, ConfigurationState::NotConfigured);
            }
            TransactionKind::ReadSensorLocation | TransactionKind::WriteControlPoint => {}
        }
    }

    fn read_features(&mut self, address: BdAddr) {
        let Some(handle) = self.devices.get(address).map(|e| e.handles.feature) else {
            return;
        };
        self.step(
            address,
            TransactionKind::ReadFeatures,
            GattRequest::Read(handle),
            ConfigurationState::GettingFeatures,
        );
    }

    fn on_features(&mut self, address: BdAddr, value: &[u8]) {
        let supported_features = match protocol::parse_features(value) {
            Ok(supported_features) => supported_features,
            Err(e) => {
                warn!("Bad feature value from {}: {:#}", address, e);
                self.fail_configuration(address, ConfigurationStatus::UnknownError);
                return;
            }
        };

        let Some(entry) = self.devices.get_mut(address) else {
            return;
        };
        entry.supported_features = supported_features;
        debug!("{} features {:#06X}", address, supported_features);

        let wants_locations = entry.handles.control_point.is_some()
            && supported_features & features::MULTIPLE_SENSOR_LOCATIONS != 0
            && !entry.skip_supported_locations;

        if !wants_locations {
            self.finish_configuration(address, ConfigurationState::Configured);
            return;
        }

        self.set_state(address, ConfigurationState::GettingSupportedLocations);
        if let Err(e) = self.start_procedure(
            address,
            ClientId::SERVER,
            ProcedureKind::RequestSupportedSensorLocations,
        ) {
            warn!("Could not request supported locations from {}: {}", address, e);
            self.fail_configuration(address, ConfigurationStatus::GattOperationFailure);
        }
    }

    /// Apply the supported-locations answer of the internal procedure
    pub(crate) fn on_supported_locations(&mut self, address: BdAddr, codes: &[u8]) {
        let mask = protocol::locations_to_mask(codes);
        let Some(entry) = self.devices.get_mut(address) else {
            return;
        };
        entry.supported_sensor_locations = mask;
        debug!("{} supports locations [{}]", address, describe_locations(mask));
        self.finish_configuration(address, ConfigurationState::Configured);
    }

    /// Submit the next handshake step, failing the configuration if the
    /// request cannot be submitted.
    fn step(
        &mut self,
        address: BdAddr,
        kind: TransactionKind,
        request: GattRequest,
        next: ConfigurationState,
    ) {
        match self.submit(address, kind, ClientId::SERVER, request) {
            Ok(_) => self.set_state(address, next),
            Err(e) => {
                warn!("Could not submit {:?} for {}: {}", kind, address, e);
                self.fail_configuration(address, ConfigurationStatus::GattOperationFailure);
            }
        }
    }

    fn set_state(&mut self, address: BdAddr, state: ConfigurationState) {
        if let Some(entry) = self.devices.get_mut(address) {
            debug!("{}: {:?} -> {:?}", address, entry.state, state);
            entry.state = state;
        }
    }

    /// Terminal state reached in either direction
    fn finish_configuration(&mut self, address: BdAddr, state: ConfigurationState) {
        self.set_state(address, state);
        info!("{} is now {:?}", address, state);
        self.store_record(address);
        self.broadcast(RscEvent::ConfigurationStatusChanged {
            address,
            status: ConfigurationStatus::Success,
        });
    }

    pub(crate) fn fail_configuration(&mut self, address: BdAddr, status: ConfigurationStatus) {
        self.clear_internal_procedure(address);
        self.set_state(address, ConfigurationState::NotConfigured);
        warn!("Configuration of {} failed: {:?}", address, status);
        self.broadcast(RscEvent::ConfigurationStatusChanged { address, status });
    }
}
