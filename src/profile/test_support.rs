//! Recording facades and a harness driving an [`RscManager`] by hand.

use crate::domain::events::RscEvent;
use crate::domain::facades::{
    DeviceProperties, GattAccess, GattEvent, GattService, MessageBus, RecordStore,
    RemoteDeviceProperties, Timer,
};
use crate::domain::models::{
    AttHandle, BdAddr, ClientId, ConnectedSensor, GattTransactionId, ProcedureId, TimerId,
};
use crate::infrastructure::simulated_sensor::{self, handles};
use crate::profile::devices::ConfigurationState;
use crate::profile::manager::{Facades, ManagerConfig, RscManager};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn sensor_profile(with_location: bool, with_control_point: bool) -> Vec<GattService> {
    simulated_sensor::service_table(with_location, with_control_point)
}

pub fn full_service_table() -> Vec<GattService> {
    sensor_profile(true, true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCall {
    Read {
        id: GattTransactionId,
        address: BdAddr,
        handle: AttHandle,
    },
    Write {
        id: GattTransactionId,
        address: BdAddr,
        handle: AttHandle,
        value: Vec<u8>,
    },
}

impl GattCall {
    pub fn id(&self) -> GattTransactionId {
        match self {
            Self::Read { id, .. } | Self::Write { id, .. } => *id,
        }
    }

    pub fn handle(&self) -> AttHandle {
        match self {
            Self::Read { handle, .. } | Self::Write { handle, .. } => *handle,
        }
    }
}

/// Hands out ids from 100 and records every request
#[derive(Default)]
pub struct RecordingGatt {
    calls: Mutex<Vec<GattCall>>,
    next_id: Mutex<GattTransactionId>,
    fail: AtomicBool,
}

impl RecordingGatt {
    pub fn calls(&self) -> Vec<GattCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last(&self) -> GattCall {
        self.calls().last().cloned().expect("no GATT request recorded")
    }

    pub fn writes_to(&self, handle: AttHandle) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GattCall::Write { .. }) && c.handle() == handle)
            .count()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn record(&self, make: impl FnOnce(GattTransactionId) -> GattCall) -> Result<GattTransactionId> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("link down"));
        }
        let mut next = self.next_id.lock().unwrap();
        *next = (*next).max(99) + 1;
        self.calls.lock().unwrap().push(make(*next));
        Ok(*next)
    }
}

impl GattAccess for RecordingGatt {
    fn read_value(&self, address: BdAddr, handle: AttHandle) -> Result<GattTransactionId> {
        self.record(|id| GattCall::Read { id, address, handle })
    }

    fn write_value(&self, address: BdAddr, handle: AttHandle, value: &[u8]) -> Result<GattTransactionId> {
        self.record(|id| GattCall::Write {
            id,
            address,
            handle,
            value: value.to_vec(),
        })
    }
}

#[derive(Default)]
pub struct ScriptedDevices {
    services: Mutex<HashMap<BdAddr, Vec<GattService>>>,
    properties: Mutex<HashMap<BdAddr, RemoteDeviceProperties>>,
}

impl ScriptedDevices {
    pub fn set_services(&self, address: BdAddr, services: Vec<GattService>) {
        self.services.lock().unwrap().insert(address, services);
    }

    pub fn set_properties(&self, properties: RemoteDeviceProperties) {
        self.properties.lock().unwrap().insert(properties.address, properties);
    }
}

impl DeviceProperties for ScriptedDevices {
    fn discover_services(&self, address: BdAddr) -> Result<Vec<GattService>> {
        self.services
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .ok_or_else(|| anyhow!("no services for {}", address))
    }

    fn query_properties(&self, address: BdAddr) -> Result<RemoteDeviceProperties> {
        self.properties
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .ok_or_else(|| anyhow!("unknown device {}", address))
    }
}

/// Timers that only fire when the test says so
#[derive(Default)]
pub struct ManualTimer {
    next_id: Mutex<TimerId>,
    active: Mutex<HashMap<TimerId, ProcedureId>>,
    fail: AtomicBool,
}

impl ManualTimer {
    pub fn active(&self) -> Vec<ProcedureId> {
        self.active.lock().unwrap().values().copied().collect()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Expire the timer of `procedure_id` and return whether one was running
    pub fn fire(&self, procedure_id: ProcedureId) -> bool {
        let mut active = self.active.lock().unwrap();
        let before = active.len();
        active.retain(|_, p| *p != procedure_id);
        active.len() != before
    }
}

impl Timer for ManualTimer {
    fn start(&self, _timeout: Duration, procedure_id: ProcedureId) -> Result<TimerId> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("no timers left"));
        }
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        self.active.lock().unwrap().insert(*next, procedure_id);
        Ok(*next)
    }

    fn stop(&self, timer_id: TimerId) {
        self.active.lock().unwrap().remove(&timer_id);
    }
}

#[derive(Default)]
pub struct MemoryRecords {
    records: Mutex<HashMap<BdAddr, Vec<u8>>>,
}

impl MemoryRecords {
    pub fn get(&self, address: BdAddr) -> Option<Vec<u8>> {
        self.records.lock().unwrap().get(&address).cloned()
    }

    pub fn put(&self, address: BdAddr, record: Vec<u8>) {
        self.records.lock().unwrap().insert(address, record);
    }
}

impl RecordStore for MemoryRecords {
    fn load(&self, address: BdAddr) -> Result<Option<Vec<u8>>> {
        Ok(self.get(address))
    }

    fn store(&self, address: BdAddr, record: &[u8]) -> Result<()> {
        self.put(address, record.to_vec());
        Ok(())
    }

    fn clear(&self, address: BdAddr) -> Result<()> {
        self.records.lock().unwrap().remove(&address);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBus {
    sent: Mutex<Vec<(ClientId, RscEvent)>>,
}

impl RecordingBus {
    pub fn sent(&self) -> Vec<(ClientId, RscEvent)> {
        self.sent.lock().unwrap().clone()
    }
}

impl MessageBus for RecordingBus {
    fn send(&self, client: ClientId, event: &RscEvent) -> Result<()> {
        self.sent.lock().unwrap().push((client, event.clone()));
        Ok(())
    }
}

/// A manager wired to recording facades, with a local subscriber that
/// collects every event.
pub struct Harness {
    pub manager: RscManager,
    pub gatt: Arc<RecordingGatt>,
    pub devices: Arc<ScriptedDevices>,
    pub timer: Arc<ManualTimer>,
    pub records: Arc<MemoryRecords>,
    pub bus: Arc<RecordingBus>,
    events: Arc<Mutex<Vec<RscEvent>>>,
}

impl Harness {
    pub fn new() -> Self {
        let gatt = Arc::new(RecordingGatt::default());
        let devices = Arc::new(ScriptedDevices::default());
        let timer = Arc::new(ManualTimer::default());
        let records = Arc::new(MemoryRecords::default());
        let bus = Arc::new(RecordingBus::default());

        let manager = RscManager::new(
            Facades {
                gatt: gatt.clone(),
                device_properties: devices.clone(),
                timer: timer.clone(),
                records: records.clone(),
                bus: bus.clone(),
            },
            ManagerConfig::default(),
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        manager
            .register_event_callback(move |event| sink.lock().unwrap().push(event.clone()))
            .unwrap();

        Self {
            manager,
            gatt,
            devices,
            timer,
            records,
            bus,
            events,
        }
    }

    pub fn events(&self) -> Vec<RscEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn take_events(&self) -> Vec<RscEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn add_sensor(&self, address: BdAddr, with_location: bool, with_control_point: bool) {
        self.devices
            .set_services(address, sensor_profile(with_location, with_control_point));
    }

    pub fn connect(&self, address: BdAddr) -> Option<ConnectedSensor> {
        self.manager.discover(address).unwrap()
    }

    pub fn state(&self, address: BdAddr) -> Option<ConfigurationState> {
        self.manager.inspect(|ctx| ctx.devices.get(address).map(|e| e.state))
    }

    pub fn transactions(&self) -> usize {
        self.manager.inspect(|ctx| ctx.transactions.len())
    }

    pub fn ack_last_write(&self) {
        let id = self.gatt.last().id();
        self.manager
            .handle_gatt_event(GattEvent::WriteResponse { transaction_id: id });
    }

    pub fn answer_last_read(&self, value: &[u8]) {
        let id = self.gatt.last().id();
        self.manager.handle_gatt_event(GattEvent::ReadResponse {
            transaction_id: id,
            value: value.to_vec(),
        });
    }

    pub fn indicate(&self, address: BdAddr, value: &[u8]) {
        self.manager.handle_gatt_event(GattEvent::HandleValue {
            address,
            handle: handles::CONTROL_POINT,
            value: value.to_vec(),
            indication: true,
        });
    }

    /// Connect a sensor with every optional characteristic and walk it
    /// through the handshake without the locations step.
    pub fn configured_sensor(&self, address: BdAddr) {
        self.add_sensor(address, true, true);
        self.connect(address).unwrap();
        self.manager.configure_remote_sensor(address, 0).unwrap();
        self.ack_last_write();
        self.ack_last_write();
        self.answer_last_read(&[0x07, 0x00]);
        assert_eq!(self.state(address), Some(ConfigurationState::Configured));
        self.take_events();
    }
}
