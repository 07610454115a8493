//! Running Speed and Cadence Profile
//!
//! Client side of the RSC service: discovers sensors, configures them, runs
//! control point procedures and fans events out to subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       RscManager                          │
//! │      (public API, one lock around the whole Context)      │
//! └─────────────────────────┬────────────────────────────────┘
//!                           │
//!      ┌────────────┬───────┴──────┬──────────────┐
//!      ▼            ▼              ▼              ▼
//! ┌─────────┐ ┌─────────────┐ ┌────────────┐ ┌───────────┐
//! │ Devices │ │Configuration│ │ Procedures │ │ Callbacks │
//! │         │ │             │ │            │ │           │
//! │-discover│ │- CCCD writes│ │- CP writes │ │- local fn │
//! │-records │ │- features   │ │- timeouts  │ │- IPC      │
//! └────┬────┘ └──────┬──────┘ └─────┬──────┘ └─────┬─────┘
//!      └─────────────┴──────┬───────┘              │
//!                           ▼                      ▼
//!                    ┌─────────────┐         ┌──────────┐
//!                    │Transactions │         │ Dispatch │
//!                    └─────────────┘         └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, control point commands and value parsing
//! - [`devices`] - Device registry and service discovery
//! - [`configuration`] - Configuration handshake
//! - [`transactions`] - Outstanding GATT request tracking
//! - [`procedures`] - Control point procedures and their timeouts
//! - [`callbacks`] / [`dispatch`] - Subscribers and event delivery
//! - [`manager`] - The [`RscManager`] handle

pub mod callbacks;
pub mod configuration;
pub mod device_events;
pub mod devices;
pub mod dispatch;
pub mod gatt_router;
pub mod location;
pub mod manager;
pub mod persistence;
pub mod procedures;
pub mod protocol;
pub mod transactions;

#[cfg(test)]
pub(crate) mod test_support;

pub use callbacks::EventCallback;
pub use devices::ConfigurationState;
pub use manager::{Facades, ManagerConfig, RscManager};
