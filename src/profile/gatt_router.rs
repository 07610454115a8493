//! Routes GATT completions and unsolicited values to the component that
//! owns them.

use crate::domain::events::RscEvent;
use crate::domain::facades::{GattError, GattEvent};
use crate::domain::models::{features, measurement_flags, AttHandle, BdAddr, GattTransactionId};
use crate::profile::manager::Context;
use crate::profile::protocol;
use crate::profile::transactions::{TransactionEntry, TransactionKind};
use tracing::{debug, trace, warn};

impl Context {
    pub(crate) fn on_gatt_event(&mut self, event: GattEvent) {
        match event {
            GattEvent::WriteResponse { transaction_id } => {
                if let Some(transaction) = self.resolve(transaction_id) {
                    self.on_transaction_complete(&transaction, Ok(&[][..]));
                }
            }
            GattEvent::ReadResponse {
                transaction_id,
                value,
            } => {
                if let Some(transaction) = self.resolve(transaction_id) {
                    self.on_transaction_complete(&transaction, Ok(value.as_slice()));
                }
            }
            GattEvent::ErrorResponse {
                transaction_id,
                error,
            } => {
                if let Some(transaction) = self.resolve(transaction_id) {
                    self.on_transaction_complete(&transaction, Err(error));
                }
            }
            GattEvent::HandleValue {
                address,
                handle,
                value,
                indication,
            } => self.on_handle_value(address, handle, &value, indication),
        }
    }

    fn resolve(&mut self, gatt_transaction_id: GattTransactionId) -> Option<TransactionEntry> {
        let transaction = self.transactions.resolve(gatt_transaction_id);
        if transaction.is_none() {
            debug!("Discarding completion of unknown GATT transaction {}", gatt_transaction_id);
        }
        transaction
    }

    fn on_transaction_complete(
        &mut self,
        transaction: &TransactionEntry,
        result: Result<&[u8], GattError>,
    ) {
        match transaction.kind {
            TransactionKind::ReadSensorLocation => self.on_sensor_location_read(transaction, result),
            TransactionKind::WriteControlPoint => match result {
                Ok(_) => self.on_control_point_written(transaction),
                Err(error) => self.on_control_point_write_failed(transaction, error),
            },
            kind => self.on_configuration_step(transaction.address, kind, result),
        }
    }

    fn on_handle_value(&mut self, address: BdAddr, handle: AttHandle, value: &[u8], indication: bool) {
        let Some(entry) = self.devices.get(address) else {
            trace!("Value from unknown device {}", address);
            return;
        };

        let handles = entry.handles;
        if handle == handles.measurement {
            let supported_features = entry.supported_features;
            self.on_measurement(address, supported_features, value);
        } else if handles.control_point.map(|cp| cp.value) == Some(handle) {
            if !indication {
                debug!("Control point notification from {} ignored", address);
                return;
            }
            self.on_control_point_indication(address, value);
        } else {
            trace!("Value on unrelated handle {:?} from {}", handle, address);
        }
    }

    fn on_measurement(&mut self, address: BdAddr, supported_features: u32, value: &[u8]) {
        let mut data = match protocol::parse_measurement(value) {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping measurement from {}: {:#}", address, e);
                return;
            }
        };

        if supported_features & features::WALKING_OR_RUNNING_STATUS != 0 {
            data.flags |= measurement_flags::WALKING_RUNNING_STATUS_VALID;
        }

        trace!("Measurement from {}: {:?}", address, data);
        self.broadcast(RscEvent::Measurement { address, data });
    }
}
