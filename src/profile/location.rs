use crate::domain::error::{RscError, RscResult};
use crate::domain::events::RscEvent;
use crate::domain::facades::GattError;
use crate::domain::models::{BdAddr, ClientId, SensorLocationStatus};
use crate::profile::manager::Context;
use crate::profile::protocol;
use crate::profile::transactions::{GattRequest, TransactionEntry, TransactionKind};
use tracing::debug;

impl Context {
    /// Read the Sensor Location characteristic on behalf of `client`. The
    /// answer is delivered to that client only.
    pub(crate) fn get_sensor_location(&mut self, client: ClientId, address: BdAddr) -> RscResult<()> {
        let entry = self.devices.get(address).ok_or(RscError::NotConnected)?;
        if !entry.is_configured() {
            return Err(RscError::NotConfigured);
        }
        let handle = entry
            .handles
            .sensor_location
            .ok_or(RscError::FeatureNotSupported)?;

        if self
            .transactions
            .is_outstanding(address, TransactionKind::ReadSensorLocation, client)
        {
            return Err(RscError::SameRequestOutstanding);
        }

        self.submit(
            address,
            TransactionKind::ReadSensorLocation,
            client,
            GattRequest::Read(handle),
        )?;
        Ok(())
    }

    pub(crate) fn on_sensor_location_read(
        &mut self,
        transaction: &TransactionEntry,
        result: Result<&[u8], GattError>,
    ) {
        let (status, location) = match result {
            Ok(value) => match protocol::parse_sensor_location(value) {
                Some(location) => (SensorLocationStatus::Success, Some(location)),
                None => (SensorLocationStatus::FailureUnknown, None),
            },
            Err(error) => (protocol::sensor_location_status_for(error), None),
        };

        debug!(
            "Sensor location of {} for {}: {:?} {:?}",
            transaction.address, transaction.client, status, location
        );
        self.directed(
            transaction.client,
            RscEvent::SensorLocationResponse {
                address: transaction.address,
                status,
                location,
            },
        );
    }
}
