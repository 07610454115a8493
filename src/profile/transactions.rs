//! Transaction Registry
//!
//! Every outstanding GATT request gets a local transaction id. The GATT
//! facade hands back its own correlation id on submission; completions are
//! matched to the request that caused them through that id.

use crate::domain::error::{RscError, RscResult};
use crate::domain::models::{AttHandle, BdAddr, ClientId, GattTransactionId, TransactionId};
use crate::profile::manager::Context;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Ids are never zero and wrap before reaching this bit
const ID_GUARD_BIT: u32 = 0x8000_0000;

/// Monotonic id source shared by transactions, procedures and callbacks.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u32 {
        self.last = self.last.wrapping_add(1);
        if self.last & ID_GUARD_BIT != 0 || self.last == 0 {
            self.last = 1;
        }
        self.last
    }
}

/// What an outstanding GATT request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    EnableMeasurementCccd,
    DisableMeasurementCccd,
    EnableControlPointCccd,
    DisableControlPointCccd,
    ReadFeatures,
    ReadSensorLocation,
    WriteControlPoint,
}

impl TransactionKind {
    /// Steps driven by the configuration state machine
    pub fn is_configuration_step(self) -> bool {
        !matches!(self, Self::ReadSensorLocation | Self::WriteControlPoint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEntry {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub address: BdAddr,
    /// Who the response must be routed back to
    pub client: ClientId,
    /// Set once the GATT facade accepted the request
    pub gatt_transaction_id: Option<GattTransactionId>,
}

#[derive(Debug, Default)]
pub struct TransactionRegistry {
    entries: HashMap<TransactionId, TransactionEntry>,
    by_gatt: HashMap<GattTransactionId, TransactionId>,
    ids: IdAllocator,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new request and return its id. Ids still outstanding are
    /// skipped after a wrap.
    pub fn issue(&mut self, address: BdAddr, kind: TransactionKind, client: ClientId) -> TransactionId {
        let id = loop {
            let candidate = self.ids.next_id();
            if !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        self.entries.insert(
            id,
            TransactionEntry {
                id,
                kind,
                address,
                client,
                gatt_transaction_id: None,
            },
        );
        id
    }

    /// Bind the GATT facade's correlation id to a local transaction
    pub fn attach(&mut self, id: TransactionId, gatt_transaction_id: GattTransactionId) -> RscResult<()> {
        if self.by_gatt.contains_key(&gatt_transaction_id) {
            return Err(RscError::UnableToAddEntry);
        }

        let entry = self.entries.get_mut(&id).ok_or(RscError::UnableToAddEntry)?;
        entry.gatt_transaction_id = Some(gatt_transaction_id);
        self.by_gatt.insert(gatt_transaction_id, id);
        Ok(())
    }

    /// Drop a transaction by its local id. A completion arriving for it
    /// later is discarded.
    pub fn cancel(&mut self, id: TransactionId) -> Option<TransactionEntry> {
        let entry = self.entries.remove(&id)?;
        if let Some(gatt_id) = entry.gatt_transaction_id {
            self.by_gatt.remove(&gatt_id);
        }
        Some(entry)
    }

    /// Remove and return the transaction a GATT completion belongs to
    pub fn resolve(&mut self, gatt_transaction_id: GattTransactionId) -> Option<TransactionEntry> {
        let id = self.by_gatt.remove(&gatt_transaction_id)?;
        self.entries.remove(&id)
    }

    pub fn get(&self, id: TransactionId) -> Option<&TransactionEntry> {
        self.entries.get(&id)
    }

    /// Whether `client` already has a request of `kind` pending on `address`
    pub fn is_outstanding(&self, address: BdAddr, kind: TransactionKind, client: ClientId) -> bool {
        self.entries
            .values()
            .any(|e| e.address == address && e.kind == kind && e.client == client)
    }

    pub fn count_for_device(&self, address: BdAddr) -> usize {
        self.entries.values().filter(|e| e.address == address).count()
    }

    /// Forget every transaction of a device that went away
    pub fn remove_for_device(&mut self, address: BdAddr) -> usize {
        let ids: Vec<TransactionId> = self
            .entries
            .values()
            .filter(|e| e.address == address)
            .map(|e| e.id)
            .collect();

        for id in &ids {
            self.cancel(*id);
        }
        ids.len()
    }

    pub fn rekey_device(&mut self, old: BdAddr, new: BdAddr) {
        for entry in self.entries.values_mut().filter(|e| e.address == old) {
            entry.address = new;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_gatt.clear();
    }
}

/// A GATT operation to submit for a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    Read(AttHandle),
    Write(AttHandle, Vec<u8>),
}

impl Context {
    /// Issue a transaction and hand the request to the GATT facade. A
    /// synchronous submission failure removes the transaction again.
    pub(crate) fn submit(
        &mut self,
        address: BdAddr,
        kind: TransactionKind,
        client: ClientId,
        request: GattRequest,
    ) -> RscResult<TransactionId> {
        let id = self.transactions.issue(address, kind, client);

        let submitted = match &request {
            GattRequest::Read(handle) => self.facades.gatt.read_value(address, *handle),
            GattRequest::Write(handle, value) => {
                self.facades.gatt.write_value(address, *handle, value)
            }
        };

        let gatt_id = match submitted {
            Ok(gatt_id) => gatt_id,
            Err(e) => {
                warn!("{:?} for {} rejected by GATT: {:#}", kind, address, e);
                self.transactions.cancel(id);
                return Err(RscError::Gatt(e.to_string()));
            }
        };

        if let Err(e) = self.transactions.attach(id, gatt_id) {
            warn!("Duplicate GATT transaction id {} for {}", gatt_id, address);
            self.transactions.cancel(id);
            return Err(e);
        }

        debug!("Transaction {} ({:?}) submitted for {} as GATT #{}", id, kind, address, gatt_id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> BdAddr {
        BdAddr([0x11, 0x22, 0x33, 0x44, 0x55, last])
    }

    #[test]
    fn test_allocator_never_returns_zero_and_wraps() {
        let mut ids = IdAllocator { last: ID_GUARD_BIT - 2 };
        assert_eq!(ids.next_id(), ID_GUARD_BIT - 1);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_issue_skips_outstanding_ids_after_wrap() {
        let mut registry = TransactionRegistry::new();
        let first = registry.issue(addr(1), TransactionKind::ReadFeatures, ClientId::SERVER);
        assert_eq!(first, 1);

        registry.ids.last = ID_GUARD_BIT - 1;
        let second = registry.issue(addr(1), TransactionKind::ReadFeatures, ClientId::SERVER);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_resolve_by_gatt_id() {
        let mut registry = TransactionRegistry::new();
        let id = registry.issue(addr(1), TransactionKind::ReadSensorLocation, ClientId(7));
        registry.attach(id, 500).unwrap();

        let entry = registry.resolve(500).unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.client, ClientId(7));
        assert!(registry.resolve(500).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_gatt_id_rejected() {
        let mut registry = TransactionRegistry::new();
        let a = registry.issue(addr(1), TransactionKind::ReadFeatures, ClientId::SERVER);
        let b = registry.issue(addr(2), TransactionKind::ReadFeatures, ClientId::SERVER);
        registry.attach(a, 9).unwrap();
        assert_eq!(registry.attach(b, 9), Err(RscError::UnableToAddEntry));
    }

    #[test]
    fn test_remove_and_rekey_device() {
        let mut registry = TransactionRegistry::new();
        let a = registry.issue(addr(1), TransactionKind::WriteControlPoint, ClientId::SERVER);
        registry.attach(a, 10).unwrap();
        registry.issue(addr(1), TransactionKind::ReadFeatures, ClientId::SERVER);
        registry.issue(addr(2), TransactionKind::ReadFeatures, ClientId::SERVER);

        registry.rekey_device(addr(2), addr(3));
        assert_eq!(registry.count_for_device(addr(3)), 1);

        assert_eq!(registry.remove_for_device(addr(1)), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(10).is_none());
    }

    #[test]
    fn test_outstanding_request_lookup() {
        let mut registry = TransactionRegistry::new();
        registry.issue(addr(1), TransactionKind::ReadSensorLocation, ClientId(3));
        assert!(registry.is_outstanding(addr(1), TransactionKind::ReadSensorLocation, ClientId(3)));
        assert!(!registry.is_outstanding(addr(1), TransactionKind::ReadSensorLocation, ClientId(4)));
    }
}
