//! Callback Registry
//!
//! Subscribers registered for profile events. The in-process owner registers
//! under [`ClientId::SERVER`] with a closure; IPC clients register by id and
//! are reached through the message bus.

use crate::domain::events::RscEvent;
use crate::domain::models::{CallbackId, ClientId};
use crate::profile::transactions::IdAllocator;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// In-process event subscriber
pub type EventCallback = Arc<dyn Fn(&RscEvent) + Send + Sync>;

#[derive(Clone)]
pub struct CallbackEntry {
    pub id: CallbackId,
    pub client: ClientId,
    pub callback: Option<EventCallback>,
}

impl fmt::Debug for CallbackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackEntry")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("local", &self.callback.is_some())
            .finish()
    }
}

/// Where one copy of an event goes
#[derive(Clone)]
pub enum Recipient {
    Local(EventCallback),
    Remote(ClientId),
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_) => write!(f, "Local"),
            Self::Remote(client) => write!(f, "Remote({})", client),
        }
    }
}

#[derive(Debug, Default)]
pub struct CallbackRegistry {
    entries: BTreeMap<CallbackId, CallbackEntry>,
    ids: IdAllocator,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: ClientId, callback: Option<EventCallback>) -> CallbackId {
        let id = loop {
            let candidate = self.ids.next_id();
            if !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        self.entries.insert(id, CallbackEntry { id, client, callback });
        id
    }

    /// Remove a registration, only if it belongs to `client`
    pub fn unregister(&mut self, client: ClientId, id: CallbackId) -> bool {
        match self.entries.get(&id) {
            Some(entry) if entry.client == client => {
                self.entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Drop every registration of a client that went away
    pub fn remove_client(&mut self, client: ClientId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.client != client);
        before - self.entries.len()
    }

    pub fn is_registered(&self, client: ClientId) -> bool {
        self.entries.values().any(|e| e.client == client)
    }

    /// Snapshot of everyone a broadcast reaches. Each local closure appears
    /// once per registration, each remote client once overall.
    pub fn recipients(&self, local_only: bool) -> Vec<Recipient> {
        let mut seen = HashSet::new();
        let mut recipients = Vec::new();

        for entry in self.entries.values() {
            if entry.client.is_server() {
                if let Some(callback) = &entry.callback {
                    recipients.push(Recipient::Local(callback.clone()));
                }
            } else if !local_only && seen.insert(entry.client) {
                recipients.push(Recipient::Remote(entry.client));
            }
        }

        recipients
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EventCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_remote_clients_deduplicated() {
        let mut registry = CallbackRegistry::new();
        registry.register(ClientId(5), None);
        registry.register(ClientId(5), None);
        registry.register(ClientId::SERVER, Some(noop()));
        registry.register(ClientId(6), None);

        let recipients = registry.recipients(false);
        let remote: Vec<ClientId> = recipients
            .iter()
            .filter_map(|r| match r {
                Recipient::Remote(c) => Some(*c),
                Recipient::Local(_) => None,
            })
            .collect();
        assert_eq!(remote, vec![ClientId(5), ClientId(6)]);
        assert_eq!(recipients.len(), 3);

        assert_eq!(registry.recipients(true).len(), 1);
    }

    #[test]
    fn test_unregister_checks_owner() {
        let mut registry = CallbackRegistry::new();
        let id = registry.register(ClientId(2), None);
        assert!(!registry.unregister(ClientId(3), id));
        assert!(registry.unregister(ClientId(2), id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_client() {
        let mut registry = CallbackRegistry::new();
        registry.register(ClientId(2), None);
        registry.register(ClientId(2), None);
        registry.register(ClientId::SERVER, Some(noop()));
        assert_eq!(registry.remove_client(ClientId(2)), 2);
        assert!(!registry.is_registered(ClientId(2)));
        assert_eq!(registry.len(), 1);
    }
}
