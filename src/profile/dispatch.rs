//! Event Dispatch
//!
//! Events raised while the context lock is held are queued together with a
//! snapshot of their recipients. The manager delivers the queue once the
//! lock is released, so a subscriber may call back into the manager.

use crate::domain::events::RscEvent;
use crate::domain::facades::MessageBus;
use crate::domain::models::ClientId;
use crate::profile::callbacks::Recipient;
use crate::profile::manager::Context;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub struct Delivery {
    pub event: RscEvent,
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Default)]
pub struct Outbox {
    deliveries: Vec<Delivery>,
}

impl Outbox {
    pub fn push(&mut self, event: RscEvent, recipients: Vec<Recipient>) {
        if recipients.is_empty() {
            trace!("No subscribers for {} event", event.name());
            return;
        }
        self.deliveries.push(Delivery { event, recipients });
    }

    pub fn take(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries)
    }

    pub fn clear(&mut self) {
        self.deliveries.clear();
    }
}

impl Context {
    /// Queue an event for every subscriber
    pub(crate) fn broadcast(&mut self, event: RscEvent) {
        let recipients = self.callbacks.recipients(false);
        self.outbox.push(event, recipients);
    }

    /// Queue an event for the client that asked for it. The server id means
    /// every in-process subscriber; a remote client only receives it while
    /// it still has a registration.
    pub(crate) fn directed(&mut self, client: ClientId, event: RscEvent) {
        let recipients = if client.is_server() {
            self.callbacks.recipients(true)
        } else if self.callbacks.is_registered(client) {
            vec![Recipient::Remote(client)]
        } else {
            debug!("Dropping {} event for unregistered {}", event.name(), client);
            Vec::new()
        };
        self.outbox.push(event, recipients);
    }
}

/// Deliver queued events outside the context lock. Stops as soon as the
/// manager is shut down.
pub fn deliver(initialized: &AtomicBool, bus: &dyn MessageBus, deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        for recipient in &delivery.recipients {
            if !initialized.load(Ordering::Acquire) {
                debug!("Manager shut down, abandoning event delivery");
                return;
            }

            match recipient {
                Recipient::Local(callback) => {
                    let result = catch_unwind(AssertUnwindSafe(|| callback(&delivery.event)));
                    if result.is_err() {
                        warn!("Event callback panicked on {} event", delivery.event.name());
                    }
                }
                Recipient::Remote(client) => {
                    if let Err(e) = bus.send(*client, &delivery.event) {
                        warn!("Failed to send {} event to {}: {:#}", delivery.event.name(), client, e);
                    }
                }
            }
        }
    }
}
