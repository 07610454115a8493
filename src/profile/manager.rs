//! RSC Profile Manager
//!
//! Public entry point of the profile. All state lives in one [`Context`]
//! behind one mutex; every API call and every facade callback locks it,
//! does its work, queues the resulting events and delivers them after the
//! lock is released.
//!
//! ```text
//!  API calls ─┐
//!  GATT events ├─► lock ─► Context ─► outbox ─► unlock ─► callbacks / bus
//!  timers ────┘
//! ```

use crate::domain::error::{RscError, RscResult};
use crate::domain::events::RscEvent;
use crate::domain::facades::{
    changed_properties, DeviceEvent, DeviceProperties, GattAccess, GattEvent, MessageBus,
    RecordStore, Timer,
};
use crate::domain::models::{
    BdAddr, CallbackId, ClientId, ConnectedSensor, ProcedureId, SensorLocation,
};
use crate::domain::settings::Settings;
use crate::profile::callbacks::{CallbackRegistry, EventCallback};
use crate::profile::devices::{DeviceRegistry, ProcedureKind};
use crate::profile::dispatch::{self, Outbox};
use crate::profile::transactions::{IdAllocator, TransactionRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Collaborators the manager drives
#[derive(Clone)]
pub struct Facades {
    pub gatt: Arc<dyn GattAccess>,
    pub device_properties: Arc<dyn DeviceProperties>,
    pub timer: Arc<dyn Timer>,
    pub records: Arc<dyn RecordStore>,
    pub bus: Arc<dyn MessageBus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// How long a control point procedure waits for its indication
    pub procedure_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            procedure_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Settings> for ManagerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            procedure_timeout: settings.procedure_timeout(),
        }
    }
}

/// Everything the manager owns, only touched with the lock held
pub(crate) struct Context {
    pub(crate) facades: Facades,
    pub(crate) config: ManagerConfig,
    pub(crate) devices: DeviceRegistry,
    pub(crate) transactions: TransactionRegistry,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) procedure_ids: IdAllocator,
    pub(crate) outbox: Outbox,
}

struct Inner {
    initialized: AtomicBool,
    context: Mutex<Context>,
}

/// Cheap to clone handle; clones share the same state.
#[derive(Clone)]
pub struct RscManager {
    inner: Arc<Inner>,
}

impl RscManager {
    pub fn new(facades: Facades, config: ManagerConfig) -> Self {
        info!(
            "RSC profile manager started (procedure timeout {:?})",
            config.procedure_timeout
        );
        Self {
            inner: Arc::new(Inner {
                initialized: AtomicBool::new(true),
                context: Mutex::new(Context {
                    facades,
                    config,
                    devices: DeviceRegistry::new(),
                    transactions: TransactionRegistry::new(),
                    callbacks: CallbackRegistry::new(),
                    procedure_ids: IdAllocator::new(),
                    outbox: Outbox::default(),
                }),
            }),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Stop the manager: timers are stopped and every registry is freed.
    /// Later calls fail with `NotInitialized`.
    pub fn shutdown(&self) -> RscResult<()> {
        if !self.inner.initialized.swap(false, Ordering::AcqRel) {
            return Err(RscError::NotInitialized);
        }

        let mut ctx = self
            .inner
            .context
            .lock()
            .map_err(|_| RscError::UnableToLockContext)?;
        ctx.drop_all_devices();
        ctx.callbacks.clear();
        ctx.outbox.clear();
        info!("RSC profile manager shut down");
        Ok(())
    }

    /// Run `f` against the locked context, then deliver whatever events it
    /// queued with the lock released.
    fn run<T>(&self, f: impl FnOnce(&mut Context) -> RscResult<T>) -> RscResult<T> {
        if !self.is_initialized() {
            return Err(RscError::NotInitialized);
        }

        let (result, deliveries, bus) = {
            let mut ctx = self
                .inner
                .context
                .lock()
                .map_err(|_| RscError::UnableToLockContext)?;
            let result = f(&mut *ctx);
            (result, ctx.outbox.take(), ctx.facades.bus.clone())
        };

        dispatch::deliver(&self.inner.initialized, bus.as_ref(), deliveries);
        result
    }

    /// Facade callbacks have nobody to report to, failures are logged
    fn run_callback(&self, what: &str, f: impl FnOnce(&mut Context)) {
        if let Err(e) = self.run(|ctx| {
            f(ctx);
            Ok(())
        }) {
            warn!("Dropped {}: {}", what, e);
        }
    }

    fn check_address(address: BdAddr) -> RscResult<()> {
        if address.is_null() {
            return Err(RscError::InvalidParameter);
        }
        Ok(())
    }

    /// Look for the RSC service on a connected device and start tracking
    /// it. Returns `None` if the device does not expose a usable service.
    pub fn discover(&self, address: BdAddr) -> RscResult<Option<ConnectedSensor>> {
        Self::check_address(address)?;
        self.run(|ctx| Ok(ctx.discover(address)))
    }

    /// Ask the device registry for the current state of `address` and
    /// treat it as a connection change.
    pub fn refresh_device(&self, address: BdAddr) -> RscResult<()> {
        Self::check_address(address)?;
        self.run(|ctx| {
            let properties = ctx
                .facades
                .device_properties
                .query_properties(address)
                .map_err(|e| {
                    debug!("No properties for {}: {:#}", address, e);
                    RscError::NotConnected
                })?;
            ctx.on_device_event(DeviceEvent::PropertiesChanged {
                changed: changed_properties::LE_CONNECTION_STATE,
                properties,
            });
            Ok(())
        })
    }

    pub fn register_event_callback<F>(&self, callback: F) -> RscResult<CallbackId>
    where
        F: Fn(&RscEvent) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        self.run(|ctx| Ok(ctx.callbacks.register(ClientId::SERVER, Some(callback))))
    }

    pub fn register_remote_client(&self, client: ClientId) -> RscResult<CallbackId> {
        if client.is_server() {
            return Err(RscError::InvalidParameter);
        }
        self.run(|ctx| {
            let id = ctx.callbacks.register(client, None);
            debug!("{} registered as callback {}", client, id);
            Ok(id)
        })
    }

    pub fn unregister_event_callback(&self, client: ClientId, callback_id: CallbackId) -> RscResult<()> {
        self.run(|ctx| {
            if ctx.callbacks.unregister(client, callback_id) {
                Ok(())
            } else {
                Err(RscError::InvalidParameter)
            }
        })
    }

    /// Forget every registration of an IPC client that disconnected
    pub fn process_client_unregister(&self, client: ClientId) {
        if client.is_server() {
            return;
        }
        self.run_callback("client unregister", |ctx| {
            let removed = ctx.callbacks.remove_client(client);
            debug!("{} gone, {} callbacks removed", client, removed);
        });
    }

    /// Up to `max_entries` connected sensors, sorted by address, and the
    /// total number connected. `max_entries == 0` only counts.
    pub fn query_connected_sensors(&self, max_entries: usize) -> RscResult<(Vec<ConnectedSensor>, usize)> {
        self.run(|ctx| {
            let total = ctx.devices.len();
            let mut sensors: Vec<ConnectedSensor> =
                ctx.devices.iter().map(|e| e.to_connected_sensor()).collect();
            sensors.sort_by_key(|s| s.address);
            sensors.truncate(max_entries);
            Ok((sensors, total))
        })
    }

    pub fn get_connected_sensor_info(&self, address: BdAddr) -> RscResult<ConnectedSensor> {
        Self::check_address(address)?;
        self.run(|ctx| {
            ctx.devices
                .get(address)
                .map(|e| e.to_connected_sensor())
                .ok_or(RscError::NotConnected)
        })
    }

    /// Start the configuration handshake. Completion is reported through a
    /// `ConfigurationStatusChanged` event.
    pub fn configure_remote_sensor(&self, address: BdAddr, flags: u32) -> RscResult<()> {
        Self::check_address(address)?;
        self.run(|ctx| ctx.configure(address, flags))
    }

    pub fn un_configure_remote_sensor(&self, address: BdAddr) -> RscResult<()> {
        Self::check_address(address)?;
        self.run(|ctx| ctx.un_configure(address))
    }

    /// Read the sensor location. The answer arrives as a
    /// `SensorLocationResponse` event sent to `client` only.
    pub fn get_sensor_location(&self, client: ClientId, address: BdAddr) -> RscResult<()> {
        Self::check_address(address)?;
        self.run(|ctx| ctx.get_sensor_location(client, address))
    }

    pub fn update_cumulative_value(
        &self,
        client: ClientId,
        address: BdAddr,
        cumulative_value: u32,
    ) -> RscResult<ProcedureId> {
        Self::check_address(address)?;
        self.run(|ctx| {
            ctx.start_procedure(
                address,
                client,
                ProcedureKind::UpdateCumulativeValue(cumulative_value),
            )
        })
    }

    pub fn update_sensor_location(
        &self,
        client: ClientId,
        address: BdAddr,
        location: SensorLocation,
    ) -> RscResult<ProcedureId> {
        Self::check_address(address)?;
        self.run(|ctx| {
            ctx.start_procedure(address, client, ProcedureKind::UpdateSensorLocation(location))
        })
    }

    pub fn start_sensor_calibration(&self, client: ClientId, address: BdAddr) -> RscResult<ProcedureId> {
        Self::check_address(address)?;
        self.run(|ctx| ctx.start_procedure(address, client, ProcedureKind::StartSensorCalibration))
    }

    pub fn handle_gatt_event(&self, event: GattEvent) {
        self.run_callback("GATT event", |ctx| ctx.on_gatt_event(event));
    }

    pub fn handle_device_event(&self, event: DeviceEvent) {
        self.run_callback("device event", |ctx| ctx.on_device_event(event));
    }

    pub fn handle_procedure_timeout(&self, procedure_id: ProcedureId) {
        self.run_callback("procedure timeout", |ctx| ctx.on_procedure_timeout(procedure_id));
    }

    #[cfg(test)]
    pub(crate) fn inspect<T>(&self, f: impl FnOnce(&Context) -> T) -> T {
        let ctx = self.inner.context.lock().unwrap();
        f(&*ctx)
    }
}
