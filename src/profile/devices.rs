//! Device Registry
//!
//! One [`DeviceEntry`] per connected sensor that exposes a usable RSC
//! service, keyed by address. Entries are created from the remote service
//! table and carry the configuration state, cached capability masks and the
//! control point procedure in flight.

use crate::domain::events::RscEvent;
use crate::domain::facades::GattService;
use crate::domain::models::{
    optional_characteristics, AttHandle, BdAddr, ConnectedSensor, ProcedureId, SensorLocation,
    TimerId, TransactionId,
};
use crate::profile::manager::Context;
use crate::profile::protocol::{
    ControlPointCommand, CCCD_UUID, RSC_FEATURE_UUID, RSC_MEASUREMENT_UUID,
    RSC_SERVICE_UUID, SC_CONTROL_POINT_UUID, SENSOR_LOCATION_UUID,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Configuration handshake progress.
///
/// ```text
/// NotConfigured -> EnablingMeasurements -> [EnablingControlPoint] -> GettingFeatures
///               -> [GettingSupportedLocations] -> Configured
/// Configured -> [DisablingControlPoint] -> DisablingMeasurements -> NotConfigured
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationState {
    NotConfigured,
    EnablingMeasurements,
    EnablingControlPoint,
    GettingFeatures,
    GettingSupportedLocations,
    Configured,
    DisablingControlPoint,
    DisablingMeasurements,
}

impl ConfigurationState {
    pub fn is_configuring(self) -> bool {
        matches!(
            self,
            Self::EnablingMeasurements
                | Self::EnablingControlPoint
                | Self::GettingFeatures
                | Self::GettingSupportedLocations
        )
    }

    pub fn is_unconfiguring(self) -> bool {
        matches!(self, Self::DisablingControlPoint | Self::DisablingMeasurements)
    }
}

/// Control point command in flight, with the value it will apply on success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    UpdateCumulativeValue(u32),
    UpdateSensorLocation(SensorLocation),
    RequestSupportedSensorLocations,
    StartSensorCalibration,
}

impl ProcedureKind {
    pub fn command(self) -> ControlPointCommand {
        match self {
            Self::UpdateCumulativeValue(value) => ControlPointCommand::SetCumulativeValue(value),
            Self::UpdateSensorLocation(location) => {
                ControlPointCommand::UpdateSensorLocation(location)
            }
            Self::RequestSupportedSensorLocations => {
                ControlPointCommand::RequestSupportedSensorLocations
            }
            Self::StartSensorCalibration => ControlPointCommand::StartSensorCalibration,
        }
    }

    pub fn opcode(self) -> u8 {
        self.command().opcode()
    }

    /// Run by the configuration handshake rather than by a client
    pub fn is_internal(self) -> bool {
        matches!(self, Self::RequestSupportedSensorLocations)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveProcedure {
    pub kind: ProcedureKind,
    pub id: ProcedureId,
    pub timer: TimerId,
    /// The control point write carrying the command
    pub transaction: TransactionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPointHandles {
    pub value: AttHandle,
    pub cccd: AttHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorHandles {
    pub measurement: AttHandle,
    pub measurement_cccd: AttHandle,
    pub feature: AttHandle,
    pub sensor_location: Option<AttHandle>,
    pub control_point: Option<ControlPointHandles>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub address: BdAddr,
    pub handles: SensorHandles,
    pub optional_characteristics: u32,
    pub state: ConfigurationState,
    /// Valid once `state` is `Configured`
    pub supported_features: u32,
    pub supported_sensor_locations: u32,
    pub procedure: Option<ActiveProcedure>,
    /// Mirror configuration changes to the record store
    pub persist: bool,
    pub skip_supported_locations: bool,
}

impl DeviceEntry {
    pub fn new(address: BdAddr, handles: SensorHandles) -> Self {
        let mut optional = 0;
        if handles.sensor_location.is_some() {
            optional |= optional_characteristics::SENSOR_LOCATION;
        }
        if handles.control_point.is_some() {
            optional |= optional_characteristics::CONTROL_POINT;
        }

        Self {
            address,
            handles,
            optional_characteristics: optional,
            state: ConfigurationState::NotConfigured,
            supported_features: 0,
            supported_sensor_locations: 0,
            procedure: None,
            persist: false,
            skip_supported_locations: false,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.state == ConfigurationState::Configured
    }

    pub fn to_connected_sensor(&self) -> ConnectedSensor {
        ConnectedSensor {
            address: self.address,
            configured: self.is_configured(),
            supported_optional_characteristics: self.optional_characteristics,
            supported_features: self.supported_features,
            supported_sensor_locations: self.supported_sensor_locations,
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: HashMap<BdAddr, DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: BdAddr) -> Option<&DeviceEntry> {
        self.entries.get(&address)
    }

    pub fn get_mut(&mut self, address: BdAddr) -> Option<&mut DeviceEntry> {
        self.entries.get_mut(&address)
    }

    pub fn contains(&self, address: BdAddr) -> bool {
        self.entries.contains_key(&address)
    }

    /// Returns false if the address is already present
    pub fn insert(&mut self, entry: DeviceEntry) -> bool {
        if self.entries.contains_key(&entry.address) {
            return false;
        }
        self.entries.insert(entry.address, entry);
        true
    }

    pub fn remove(&mut self, address: BdAddr) -> Option<DeviceEntry> {
        self.entries.remove(&address)
    }

    pub fn find_by_procedure(&self, procedure_id: ProcedureId) -> Option<BdAddr> {
        self.entries
            .values()
            .find(|e| e.procedure.map(|p| p.id) == Some(procedure_id))
            .map(|e| e.address)
    }

    /// Move an entry to a new address. Fails if the new address is taken.
    pub fn rekey(&mut self, old: BdAddr, new: BdAddr) -> bool {
        if old == new || self.entries.contains_key(&new) {
            return false;
        }
        match self.entries.remove(&old) {
            Some(mut entry) => {
                entry.address = new;
                self.entries.insert(new, entry);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<DeviceEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

/// Locate the RSC service in a remote service table and resolve the
/// handles the manager needs. Returns `None` when a mandatory
/// characteristic or the measurement CCCD is missing.
pub fn parse_service_table(services: &[GattService]) -> Option<SensorHandles> {
    let service = services.iter().find(|s| s.uuid == RSC_SERVICE_UUID)?;

    let mut measurement = None;
    let mut feature = None;
    let mut sensor_location = None;
    let mut control_point = None;

    for characteristic in &service.characteristics {
        let cccd = characteristic
            .descriptors
            .iter()
            .find(|d| d.uuid == CCCD_UUID)
            .map(|d| d.handle);

        if characteristic.uuid == RSC_MEASUREMENT_UUID {
            measurement = Some((characteristic.handle, cccd?));
        } else if characteristic.uuid == RSC_FEATURE_UUID {
            feature = Some(characteristic.handle);
        } else if characteristic.uuid == SENSOR_LOCATION_UUID {
            sensor_location = Some(characteristic.handle);
        } else if characteristic.uuid == SC_CONTROL_POINT_UUID {
            control_point = cccd.map(|cccd| ControlPointHandles {
                value: characteristic.handle,
                cccd,
            });
        }
    }

    let (measurement, measurement_cccd) = measurement?;

    Some(SensorHandles {
        measurement,
        measurement_cccd,
        feature: feature?,
        sensor_location,
        control_point,
    })
}

impl Context {
    /// Create the entry for a connected device if it exposes the RSC
    /// service. Discovering a known address returns the existing entry.
    pub(crate) fn discover(&mut self, address: BdAddr) -> Option<ConnectedSensor> {
        if let Some(entry) = self.devices.get(address) {
            debug!("{} already known", address);
            return Some(entry.to_connected_sensor());
        }

        let services = match self.facades.device_properties.discover_services(address) {
            Ok(services) => services,
            Err(e) => {
                warn!("Service discovery failed for {}: {:#}", address, e);
                return None;
            }
        };

        let Some(handles) = parse_service_table(&services) else {
            debug!("{} does not expose a usable RSC service", address);
            return None;
        };

        let mut entry = DeviceEntry::new(address, handles);
        self.reload_record(&mut entry);

        let sensor = entry.to_connected_sensor();
        self.devices.insert(entry);
        info!(
            "RSC sensor {} connected (optional {:#04X}, configured {})",
            address, sensor.supported_optional_characteristics, sensor.configured
        );

        self.broadcast(RscEvent::Connected {
            address,
            configured: sensor.configured,
            supported_optional_characteristics: sensor.supported_optional_characteristics,
        });

        Some(sensor)
    }

    /// Tear down a device: its timer, its transactions and the entry
    /// itself. Dispatches `Disconnected` if an entry existed.
    pub(crate) fn remove_device(&mut self, address: BdAddr) -> bool {
        let Some(entry) = self.devices.remove(address) else {
            return false;
        };

        if let Some(procedure) = entry.procedure {
            self.facades.timer.stop(procedure.timer);
        }
        let dropped = self.transactions.remove_for_device(address);
        info!("RSC sensor {} disconnected ({} transactions dropped)", address, dropped);

        self.broadcast(RscEvent::Disconnected { address });
        true
    }
}

/// Short label used in logs
pub(crate) fn describe_locations(mask: u32) -> String {
    SensorLocation::ALL
        .iter()
        .filter(|l| mask & l.mask_bit() != 0)
        .map(|l| format!("{:?}", l))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::facades::{GattCharacteristic, GattDescriptor};
    use crate::profile::test_support::{full_service_table, sensor_profile};

    #[test]
    fn test_full_service_table() {
        let handles = parse_service_table(&full_service_table()).unwrap();
        assert!(handles.sensor_location.is_some());
        assert!(handles.control_point.is_some());
        let entry = DeviceEntry::new(BdAddr::NULL, handles);
        assert_eq!(
            entry.optional_characteristics,
            optional_characteristics::SENSOR_LOCATION | optional_characteristics::CONTROL_POINT
        );
    }

    #[test]
    fn test_control_point_without_cccd_is_not_a_capability() {
        let mut services = sensor_profile(false, false);
        services[0].characteristics.push(GattCharacteristic {
            uuid: SC_CONTROL_POINT_UUID,
            handle: AttHandle(0x30),
            descriptors: vec![],
        });
        let handles = parse_service_table(&services).unwrap();
        assert!(handles.control_point.is_none());
    }

    #[test]
    fn test_missing_mandatory_parts_fail() {
        let mut no_cccd = sensor_profile(false, false);
        no_cccd[0].characteristics[0].descriptors.clear();
        assert!(parse_service_table(&no_cccd).is_none());

        let mut no_feature = sensor_profile(false, false);
        no_feature[0]
            .characteristics
            .retain(|c| c.uuid != RSC_FEATURE_UUID);
        assert!(parse_service_table(&no_feature).is_none());

        let mut other_service = sensor_profile(false, false);
        other_service[0].uuid = CCCD_UUID;
        assert!(parse_service_table(&other_service).is_none());
    }

    #[test]
    fn test_measurement_cccd_found_among_other_descriptors() {
        let mut services = sensor_profile(false, false);
        services[0].characteristics[0].descriptors.insert(
            0,
            GattDescriptor {
                uuid: SENSOR_LOCATION_UUID,
                handle: AttHandle(0x40),
            },
        );
        assert!(parse_service_table(&services).is_some());
    }

    #[test]
    fn test_registry_rekey() {
        let a: BdAddr = "00:00:00:00:00:01".parse().unwrap();
        let b: BdAddr = "00:00:00:00:00:02".parse().unwrap();
        let handles = parse_service_table(&full_service_table()).unwrap();

        let mut registry = DeviceRegistry::new();
        assert!(registry.insert(DeviceEntry::new(a, handles)));
        assert!(!registry.insert(DeviceEntry::new(a, handles)));
        assert!(registry.rekey(a, b));
        assert!(registry.get(a).is_none());
        assert_eq!(registry.get(b).map(|e| e.address), Some(b));
    }

    #[test]
    fn test_state_groups() {
        assert!(ConfigurationState::GettingFeatures.is_configuring());
        assert!(!ConfigurationState::Configured.is_configuring());
        assert!(ConfigurationState::DisablingMeasurements.is_unconfiguring());
        assert_eq!(describe_locations(0b110), "TopOfShoe,InShoe");
    }
}
