//! Reactions to remote device registry events: power changes, LE
//! connections, pairing and address rotation.

use crate::domain::facades::{changed_properties, DeviceEvent, RemoteDeviceProperties};
use crate::domain::models::BdAddr;
use crate::profile::manager::Context;
use tracing::{debug, info};

impl Context {
    pub(crate) fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::PoweredOn => info!("Bluetooth powered on"),
            DeviceEvent::PoweredOff => {
                info!("Bluetooth powered off, dropping {} sensors", self.devices.len());
                self.drop_all_devices();
            }
            DeviceEvent::PropertiesChanged {
                changed,
                properties,
            } => self.on_properties_changed(changed, &properties),
            DeviceEvent::Deleted(address) => {
                debug!("Remote device {} deleted", address);
                self.remove_device(address);
                self.clear_record(address);
            }
        }
    }

    /// Free every device and transaction without dispatching events
    pub(crate) fn drop_all_devices(&mut self) {
        for entry in self.devices.drain() {
            if let Some(procedure) = entry.procedure {
                self.facades.timer.stop(procedure.timer);
            }
        }
        self.transactions.clear();
    }

    fn on_properties_changed(&mut self, changed: u32, properties: &RemoteDeviceProperties) {
        if changed == 0 || !properties.supports_low_energy {
            return;
        }

        let address = properties.address;

        if changed & (changed_properties::LE_CONNECTION_STATE | changed_properties::LE_SERVICES_STATE)
            != 0
        {
            if properties.connected_over_le && properties.le_services_known {
                self.on_possible_connection(properties);
            } else {
                self.remove_device(address);
                if !properties.le_services_known {
                    self.clear_record(address);
                }
            }
        }

        if changed & changed_properties::LE_PAIRING_STATE != 0 {
            if properties.paired_over_le {
                self.on_paired(address);
            } else {
                self.on_unpaired(address);
            }
        }

        if changed & changed_properties::PRIOR_RESOLVABLE_ADDRESS != 0 {
            if let Some(prior) = properties.prior_address {
                self.on_address_changed(prior, address);
            }
        }
    }

    fn on_possible_connection(&mut self, properties: &RemoteDeviceProperties) {
        let address = properties.address;
        if self.discover(address).is_none() {
            return;
        }
        if properties.paired_over_le {
            if let Some(entry) = self.devices.get_mut(address) {
                entry.persist = true;
            }
        }
    }

    fn on_paired(&mut self, address: BdAddr) {
        let Some(entry) = self.devices.get_mut(address) else {
            return;
        };
        debug!("{} paired, persisting its configuration", address);
        entry.persist = true;
        self.store_record(address);
    }

    fn on_unpaired(&mut self, address: BdAddr) {
        if let Some(entry) = self.devices.get_mut(address) {
            debug!("{} unpaired", address);
            entry.persist = false;
        }
        self.clear_record(address);
    }

    fn on_address_changed(&mut self, old: BdAddr, new: BdAddr) {
        self.clear_record(old);

        if self.devices.contains(old) {
            if !self.devices.rekey(old, new) {
                debug!("Cannot move {} to {}: address in use", old, new);
                return;
            }
            self.store_record(new);
            info!("RSC sensor {} is now {}", old, new);
        }
        self.transactions.rekey_device(old, new);
    }
}
