//! Configuration records for bonded sensors, so a reconnecting sensor is
//! reported configured without repeating the handshake.

use crate::domain::models::BdAddr;
use crate::profile::devices::{ConfigurationState, DeviceEntry};
use crate::profile::manager::Context;
use anyhow::{anyhow, Result};
use tracing::{debug, warn};

/// `[configured: u8][supported features: u32 LE][supported locations: u32 LE]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredRecord {
    pub configured: bool,
    pub supported_features: u32,
    pub supported_sensor_locations: u32,
}

impl StoredRecord {
    pub const LEN: usize = 9;

    pub fn from_entry(entry: &DeviceEntry) -> Self {
        Self {
            configured: entry.is_configured(),
            supported_features: entry.supported_features,
            supported_sensor_locations: entry.supported_sensor_locations,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[0] = self.configured as u8;
        bytes[1..5].copy_from_slice(&self.supported_features.to_le_bytes());
        bytes[5..9].copy_from_slice(&self.supported_sensor_locations.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(anyhow!("Invalid record length: {}", bytes.len()));
        }

        Ok(Self {
            configured: bytes[0] != 0,
            supported_features: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            supported_sensor_locations: u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
        })
    }
}

impl Context {
    fn load_record(&self, address: BdAddr) -> Option<StoredRecord> {
        let bytes = match self.facades.records.load(address) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to load record for {}: {:#}", address, e);
                return None;
            }
        };

        match StoredRecord::from_bytes(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring stored record for {}: {:#}", address, e);
                None
            }
        }
    }

    /// Restore a freshly discovered entry from its stored record. Having a
    /// record at all means the sensor is bonded.
    pub(crate) fn reload_record(&self, entry: &mut DeviceEntry) {
        let Some(record) = self.load_record(entry.address) else {
            return;
        };

        entry.persist = true;
        if record.configured {
            entry.state = ConfigurationState::Configured;
            entry.supported_features = record.supported_features;
            entry.supported_sensor_locations = record.supported_sensor_locations;
        }
        debug!("Reloaded record for {}: {:?}", entry.address, record);
    }

    /// Write the current configuration of a persisting device
    pub(crate) fn store_record(&self, address: BdAddr) {
        let Some(entry) = self.devices.get(address) else {
            return;
        };
        if !entry.persist {
            return;
        }

        let record = StoredRecord::from_entry(entry);
        match self.facades.records.store(address, &record.to_bytes()) {
            Ok(()) => debug!("Stored record for {}: {:?}", address, record),
            Err(e) => warn!("Failed to store record for {}: {:#}", address, e),
        }
    }

    pub(crate) fn clear_record(&self, address: BdAddr) {
        if !matches!(self.facades.records.load(address), Ok(Some(_))) {
            return;
        }
        match self.facades.records.clear(address) {
            Ok(()) => debug!("Cleared record for {}", address),
            Err(e) => warn!("Failed to clear record for {}: {:#}", address, e),
        }
    }
}
