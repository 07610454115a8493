pub mod ipc;
pub mod logging;
pub mod record_store;
pub mod simulated_sensor;
pub mod timer;
