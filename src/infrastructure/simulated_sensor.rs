//! Simulated RSC Sensor
//!
//! Software stand-in for the GATT client and the remote device registry.
//! Each attached sensor serves a fixed attribute table, answers CCCD writes,
//! feature and location reads and control point commands, and can stream
//! measurements once notifications are enabled.
//!
//! Completions are never delivered inline: they go through an unbounded
//! channel that the owner drains into `RscManager::handle_gatt_event`.

use crate::domain::facades::{
    changed_properties, DeviceEvent, DeviceProperties, GattAccess, GattCharacteristic,
    GattDescriptor, GattError, GattEvent, GattService, RemoteDeviceProperties,
};
use crate::domain::models::{
    features, measurement_flags, AttHandle, BdAddr, GattTransactionId, MeasurementData,
    SensorLocation,
};
use crate::profile::protocol::{
    self, att_error, cccd, opcode, response_value, CCCD_UUID, RSC_FEATURE_UUID,
    RSC_MEASUREMENT_UUID, RSC_SERVICE_UUID, SC_CONTROL_POINT_UUID, SENSOR_LOCATION_UUID,
};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Attribute handles of the simulated service
pub mod handles {
    use crate::domain::models::AttHandle;

    pub const SERVICE_START: AttHandle = AttHandle(0x0010);
    pub const MEASUREMENT: AttHandle = AttHandle(0x0012);
    pub const MEASUREMENT_CCCD: AttHandle = AttHandle(0x0013);
    pub const FEATURE: AttHandle = AttHandle(0x0015);
    pub const SENSOR_LOCATION: AttHandle = AttHandle(0x0017);
    pub const CONTROL_POINT: AttHandle = AttHandle(0x0019);
    pub const CONTROL_POINT_CCCD: AttHandle = AttHandle(0x001A);
    pub const SERVICE_END: AttHandle = AttHandle(0x001A);
}

/// ATT "Write Not Permitted"
const WRITE_NOT_PERMITTED: u8 = 0x03;

/// What a simulated sensor exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorProfile {
    pub with_sensor_location: bool,
    pub with_control_point: bool,
    pub features: u16,
    pub supported_locations: u32,
    pub location: SensorLocation,
    pub paired: bool,
}

impl Default for SensorProfile {
    fn default() -> Self {
        Self {
            with_sensor_location: true,
            with_control_point: true,
            features: (features::INSTANTANEOUS_STRIDE_LENGTH
                | features::TOTAL_DISTANCE
                | features::WALKING_OR_RUNNING_STATUS
                | features::CALIBRATION_PROCEDURE
                | features::MULTIPLE_SENSOR_LOCATIONS) as u16,
            supported_locations: SensorLocation::TopOfShoe.mask_bit()
                | SensorLocation::InShoe.mask_bit()
                | SensorLocation::Hip.mask_bit(),
            location: SensorLocation::InShoe,
            paired: true,
        }
    }
}

/// The GATT service table of a sensor with the given optional parts
pub fn service_table(with_sensor_location: bool, with_control_point: bool) -> Vec<GattService> {
    let mut characteristics = vec![
        GattCharacteristic {
            uuid: RSC_MEASUREMENT_UUID,
            handle: handles::MEASUREMENT,
            descriptors: vec![GattDescriptor {
                uuid: CCCD_UUID,
                handle: handles::MEASUREMENT_CCCD,
            }],
        },
        GattCharacteristic {
            uuid: RSC_FEATURE_UUID,
            handle: handles::FEATURE,
            descriptors: vec![],
        },
    ];

    if with_sensor_location {
        characteristics.push(GattCharacteristic {
            uuid: SENSOR_LOCATION_UUID,
            handle: handles::SENSOR_LOCATION,
            descriptors: vec![],
        });
    }

    if with_control_point {
        characteristics.push(GattCharacteristic {
            uuid: SC_CONTROL_POINT_UUID,
            handle: handles::CONTROL_POINT,
            descriptors: vec![GattDescriptor {
                uuid: CCCD_UUID,
                handle: handles::CONTROL_POINT_CCCD,
            }],
        });
    }

    vec![GattService {
        uuid: RSC_SERVICE_UUID,
        start_handle: handles::SERVICE_START,
        end_handle: handles::SERVICE_END,
        characteristics,
    }]
}

#[derive(Debug)]
struct SensorState {
    profile: SensorProfile,
    location: SensorLocation,
    notifying: bool,
    indicating: bool,
    total_distance: u32,
    tick: u32,
}

impl SensorState {
    fn properties(&self, address: BdAddr, connected: bool) -> RemoteDeviceProperties {
        RemoteDeviceProperties {
            address,
            prior_address: None,
            supports_low_energy: true,
            connected_over_le: connected,
            paired_over_le: self.profile.paired,
            encrypted_over_le: connected && self.profile.paired,
            le_services_known: true,
        }
    }

    /// Answer a control point command, returning the indication payload
    fn control_point(&mut self, command: &[u8]) -> Vec<u8> {
        let Some(&request) = command.first() else {
            return vec![opcode::RESPONSE_CODE, 0, response_value::OP_CODE_NOT_SUPPORTED];
        };

        let mut parameter = Vec::new();
        let result = match (request, &command[1..]) {
            (opcode::SET_CUMULATIVE_VALUE, [a, b, c, d]) => {
                self.total_distance = u32::from_le_bytes([*a, *b, *c, *d]);
                response_value::SUCCESS
            }
            (opcode::START_SENSOR_CALIBRATION, []) => {
                if self.profile.features as u32 & features::CALIBRATION_PROCEDURE != 0 {
                    response_value::SUCCESS
                } else {
                    response_value::OP_CODE_NOT_SUPPORTED
                }
            }
            (opcode::UPDATE_SENSOR_LOCATION, [code]) => match SensorLocation::from_u8(*code) {
                Some(location) if self.profile.supported_locations & location.mask_bit() != 0 => {
                    self.location = location;
                    response_value::SUCCESS
                }
                _ => response_value::INVALID_PARAMETER,
            },
            (opcode::REQUEST_SUPPORTED_SENSOR_LOCATIONS, []) => {
                parameter = SensorLocation::ALL
                    .iter()
                    .filter(|l| self.profile.supported_locations & l.mask_bit() != 0)
                    .map(|l| l.code())
                    .collect();
                response_value::SUCCESS
            }
            (opcode::SET_CUMULATIVE_VALUE, _)
            | (opcode::UPDATE_SENSOR_LOCATION, _)
            | (opcode::START_SENSOR_CALIBRATION, _)
            | (opcode::REQUEST_SUPPORTED_SENSOR_LOCATIONS, _) => response_value::INVALID_PARAMETER,
            _ => response_value::OP_CODE_NOT_SUPPORTED,
        };

        let mut indication = vec![opcode::RESPONSE_CODE, request, result];
        indication.extend(parameter);
        indication
    }

    fn next_measurement(&mut self) -> MeasurementData {
        self.tick = self.tick.wrapping_add(1);
        let running = (self.tick / 30) % 2 == 1;
        let speed = if running { 3 * 256 + (self.tick % 64) as u16 } else { 384 };
        let cadence = if running { 170 } else { 110 };
        self.total_distance = self.total_distance.wrapping_add(speed as u32 * 10 / 256);

        let supported = self.profile.features as u32;
        let mut flags = 0;
        if supported & features::INSTANTANEOUS_STRIDE_LENGTH != 0 {
            flags |= measurement_flags::STRIDE_LENGTH_PRESENT;
        }
        if supported & features::TOTAL_DISTANCE != 0 {
            flags |= measurement_flags::TOTAL_DISTANCE_PRESENT;
        }
        if running {
            flags |= measurement_flags::RUNNING;
        }

        MeasurementData {
            flags,
            instantaneous_speed: speed,
            instantaneous_cadence: cadence,
            instantaneous_stride_length: (speed as u32 * 60 * 100 / 256 / cadence as u32) as u16,
            total_distance: self.total_distance,
        }
    }
}

pub struct SimulatedSensor {
    sensors: Mutex<HashMap<BdAddr, SensorState>>,
    next_transaction: AtomicU32,
    gatt_events: mpsc::UnboundedSender<GattEvent>,
    device_events: mpsc::UnboundedSender<DeviceEvent>,
}

impl SimulatedSensor {
    pub fn new(
        gatt_events: mpsc::UnboundedSender<GattEvent>,
        device_events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            sensors: Mutex::new(HashMap::new()),
            next_transaction: AtomicU32::new(1),
            gatt_events,
            device_events,
        }
    }

    /// Bring a sensor into range and report it as connected
    pub fn attach(&self, address: BdAddr, profile: SensorProfile) -> Result<()> {
        let state = SensorState {
            profile,
            location: profile.location,
            notifying: false,
            indicating: false,
            total_distance: 0,
            tick: 0,
        };
        let properties = state.properties(address, true);
        self.sensors
            .lock()
            .map_err(|_| anyhow!("Lock error"))?
            .insert(address, state);

        info!("Simulated sensor {} attached", address);
        let _ = self.device_events.send(DeviceEvent::PropertiesChanged {
            changed: changed_properties::LE_CONNECTION_STATE | changed_properties::LE_SERVICES_STATE,
            properties,
        });
        Ok(())
    }

    /// Take a sensor out of range and report the disconnection
    pub fn detach(&self, address: BdAddr) -> Result<()> {
        let state = self
            .sensors
            .lock()
            .map_err(|_| anyhow!("Lock error"))?
            .remove(&address)
            .ok_or_else(|| anyhow!("No simulated sensor at {}", address))?;

        info!("Simulated sensor {} detached", address);
        let _ = self.device_events.send(DeviceEvent::PropertiesChanged {
            changed: changed_properties::LE_CONNECTION_STATE,
            properties: state.properties(address, false),
        });
        Ok(())
    }

    fn next_id(&self) -> GattTransactionId {
        self.next_transaction.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: GattEvent) {
        trace!("Simulated GATT event: {:?}", event);
        let _ = self.gatt_events.send(event);
    }

    fn reject(&self, transaction_id: GattTransactionId, att_error_code: u8) {
        self.emit(GattEvent::ErrorResponse {
            transaction_id,
            error: GattError::ErrorResponse { att_error_code },
        });
    }

    /// Produce one measurement notification for every sensor with
    /// notifications enabled
    pub fn tick(&self) -> Result<usize> {
        let mut sensors = self.sensors.lock().map_err(|_| anyhow!("Lock error"))?;
        let mut sent = 0;
        for (address, state) in sensors.iter_mut().filter(|(_, s)| s.notifying) {
            let data = state.next_measurement();
            self.emit(GattEvent::HandleValue {
                address: *address,
                handle: handles::MEASUREMENT,
                value: protocol::encode_measurement(&data),
                indication: false,
            });
            sent += 1;
        }
        Ok(sent)
    }

    /// Stream measurements until the event channel closes
    pub async fn run_measurements(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if self.gatt_events.is_closed() {
                debug!("Measurement stream stopped");
                break;
            }
            if let Err(e) = self.tick() {
                debug!("Measurement tick failed: {}", e);
            }
        }
    }
}

impl GattAccess for SimulatedSensor {
    fn read_value(&self, address: BdAddr, handle: AttHandle) -> Result<GattTransactionId> {
        let sensors = self.sensors.lock().map_err(|_| anyhow!("Lock error"))?;
        let state = sensors
            .get(&address)
            .ok_or_else(|| anyhow!("{} is not connected", address))?;
        let id = self.next_id();

        match handle {
            handles::FEATURE => self.emit(GattEvent::ReadResponse {
                transaction_id: id,
                value: state.profile.features.to_le_bytes().to_vec(),
            }),
            handles::SENSOR_LOCATION if state.profile.with_sensor_location => {
                self.emit(GattEvent::ReadResponse {
                    transaction_id: id,
                    value: vec![state.location.code()],
                })
            }
            _ => self.reject(id, att_error::INVALID_HANDLE),
        }
        Ok(id)
    }

    fn write_value(&self, address: BdAddr, handle: AttHandle, value: &[u8]) -> Result<GattTransactionId> {
        let mut sensors = self.sensors.lock().map_err(|_| anyhow!("Lock error"))?;
        let state = sensors
            .get_mut(&address)
            .ok_or_else(|| anyhow!("{} is not connected", address))?;
        let id = self.next_id();
        let config = match value {
            [low, high] => u16::from_le_bytes([*low, *high]),
            _ => 0xFFFF,
        };

        match handle {
            handles::MEASUREMENT_CCCD if config == cccd::NOTIFY || config == cccd::DISABLE => {
                state.notifying = config == cccd::NOTIFY;
                self.emit(GattEvent::WriteResponse { transaction_id: id });
            }
            handles::CONTROL_POINT_CCCD
                if state.profile.with_control_point
                    && (config == cccd::INDICATE || config == cccd::DISABLE) =>
            {
                state.indicating = config == cccd::INDICATE;
                self.emit(GattEvent::WriteResponse { transaction_id: id });
            }
            handles::CONTROL_POINT if state.profile.with_control_point => {
                if !state.indicating {
                    self.reject(id, att_error::CCCD_IMPROPERLY_CONFIGURED);
                    return Ok(id);
                }
                let indication = state.control_point(value);
                self.emit(GattEvent::WriteResponse { transaction_id: id });
                self.emit(GattEvent::HandleValue {
                    address,
                    handle: handles::CONTROL_POINT,
                    value: indication,
                    indication: true,
                });
            }
            _ => self.reject(id, WRITE_NOT_PERMITTED),
        }
        Ok(id)
    }
}

impl DeviceProperties for SimulatedSensor {
    fn discover_services(&self, address: BdAddr) -> Result<Vec<GattService>> {
        let sensors = self.sensors.lock().map_err(|_| anyhow!("Lock error"))?;
        let state = sensors
            .get(&address)
            .ok_or_else(|| anyhow!("{} is not connected", address))?;
        Ok(service_table(
            state.profile.with_sensor_location,
            state.profile.with_control_point,
        ))
    }

    fn query_properties(&self, address: BdAddr) -> Result<RemoteDeviceProperties> {
        let sensors = self.sensors.lock().map_err(|_| anyhow!("Lock error"))?;
        let state = sensors
            .get(&address)
            .ok_or_else(|| anyhow!("Unknown device {}", address))?;
        Ok(state.properties(address, true))
    }
}
