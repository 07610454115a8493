//! Facades
//!
//! Boundaries to the collaborators the profile manager does not own: the
//! GATT client, the remote device registry, the timer service, the record
//! store and the IPC message bus. Each one is a trait object so the daemon
//! can plug in real transports and tests can plug in recorders.

use crate::domain::events::RscEvent;
use crate::domain::models::{AttHandle, BdAddr, ClientId, GattTransactionId, ProcedureId, TimerId};
use anyhow::Result;
use std::time::Duration;
use uuid::Uuid;

/// Issues GATT requests against remote attribute handles.
///
/// Both calls return immediately with a correlation id; the outcome arrives
/// later as a [`GattEvent`] carrying the same id.
pub trait GattAccess: Send + Sync {
    fn read_value(&self, address: BdAddr, handle: AttHandle) -> Result<GattTransactionId>;
    fn write_value(
        &self,
        address: BdAddr,
        handle: AttHandle,
        value: &[u8],
    ) -> Result<GattTransactionId>;
}

/// Why a GATT request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattError {
    /// The remote device stopped answering
    ProtocolTimeout,
    /// The remote device answered with an ATT error response
    ErrorResponse { att_error_code: u8 },
    /// Any other local failure
    Other,
}

/// Asynchronous completions and unsolicited values from the GATT client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    WriteResponse {
        transaction_id: GattTransactionId,
    },
    ReadResponse {
        transaction_id: GattTransactionId,
        value: Vec<u8>,
    },
    ErrorResponse {
        transaction_id: GattTransactionId,
        error: GattError,
    },
    HandleValue {
        address: BdAddr,
        handle: AttHandle,
        value: Vec<u8>,
        indication: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattDescriptor {
    pub uuid: Uuid,
    pub handle: AttHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub handle: AttHandle,
    pub descriptors: Vec<GattDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub start_handle: AttHandle,
    pub end_handle: AttHandle,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Snapshot of what the device registry knows about a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteDeviceProperties {
    pub address: BdAddr,
    /// Address the device used before its resolvable address rotated
    pub prior_address: Option<BdAddr>,
    pub supports_low_energy: bool,
    pub connected_over_le: bool,
    pub paired_over_le: bool,
    pub encrypted_over_le: bool,
    pub le_services_known: bool,
}

/// Members reported as changed in a [`DeviceEvent::PropertiesChanged`]
pub mod changed_properties {
    pub const LE_PAIRING_STATE: u32 = 0x01;
    pub const LE_CONNECTION_STATE: u32 = 0x02;
    pub const LE_ENCRYPTION_STATE: u32 = 0x04;
    pub const LE_SERVICES_STATE: u32 = 0x08;
    pub const PRIOR_RESOLVABLE_ADDRESS: u32 = 0x10;
}

/// Events reported by the device registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    PoweredOn,
    PoweredOff,
    PropertiesChanged {
        changed: u32,
        properties: RemoteDeviceProperties,
    },
    Deleted(BdAddr),
}

/// Remote device registry and service discovery cache.
pub trait DeviceProperties: Send + Sync {
    fn discover_services(&self, address: BdAddr) -> Result<Vec<GattService>>;
    fn query_properties(&self, address: BdAddr) -> Result<RemoteDeviceProperties>;
}

/// Single-shot procedure timeouts.
///
/// When a timer fires, the owner of the implementation hands the procedure
/// id back to `RscManager::handle_procedure_timeout`.
pub trait Timer: Send + Sync {
    fn start(&self, timeout: Duration, procedure_id: ProcedureId) -> Result<TimerId>;
    fn stop(&self, timer_id: TimerId);
}

/// Small binary records keyed by device address.
pub trait RecordStore: Send + Sync {
    fn load(&self, address: BdAddr) -> Result<Option<Vec<u8>>>;
    fn store(&self, address: BdAddr, record: &[u8]) -> Result<()>;
    fn clear(&self, address: BdAddr) -> Result<()>;
}

/// Delivery of events to out-of-process clients.
pub trait MessageBus: Send + Sync {
    fn send(&self, client: ClientId, event: &RscEvent) -> Result<()>;
}
