//! Running Speed and Cadence profile manager.
//!
//! - [`domain`] - data model, events, errors, facade traits and settings
//! - [`profile`] - the profile manager core
//! - [`infrastructure`] - facade implementations, IPC and logging

pub mod domain;
pub mod infrastructure;
pub mod profile;

pub use domain::error::{RscError, RscResult};
pub use domain::events::RscEvent;
pub use profile::RscManager;
