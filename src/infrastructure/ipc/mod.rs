//! IPC Surface
//!
//! The daemon's manager reachable from other processes over a local socket.
//! Both directions carry newline-delimited JSON.
//!
//! ```text
//! RscClient ── RscRequest ──► server thread ──► RscManager
//!     ▲                                             │
//!     └──── RscMessage::{Response, Event} ◄─ IpcBus ┘
//! ```

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RscClient;
pub use protocol::{RscMessage, RscReply, RscRequest, RscResponse};
pub use server::{run_server, IpcBus};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::RscEvent;
    use crate::domain::models::ClientId;
    use crate::profile::manager::{Facades, ManagerConfig};
    use crate::profile::test_support::{
        sensor_profile, ManualTimer, MemoryRecords, RecordingGatt, ScriptedDevices,
    };
    use crate::profile::RscManager;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_client_round_trip_over_socket() {
        let socket_name = format!("rsc_ipc_test_{}.sock", std::process::id());
        let devices = Arc::new(ScriptedDevices::default());
        let bus = Arc::new(IpcBus::new());
        let manager = RscManager::new(
            Facades {
                gatt: Arc::new(RecordingGatt::default()),
                device_properties: devices.clone(),
                timer: Arc::new(ManualTimer::default()),
                records: Arc::new(MemoryRecords::default()),
                bus: bus.clone(),
            },
            ManagerConfig::default(),
        );

        let server_manager = manager.clone();
        let server_bus = bus.clone();
        let server_socket = socket_name.clone();
        std::thread::spawn(move || run_server(&server_socket, server_manager, server_bus));

        let mut client = RscClient::wait_for_server(&socket_name, Duration::from_secs(5)).unwrap();
        client.ping().unwrap();
        let callback_id = client.register().unwrap();
        assert!(callback_id > 0);
        assert_eq!(client.connected_sensors(0).unwrap(), (Vec::new(), 0));

        let address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let error = client.configure(address, 0).unwrap_err();
        assert!(error.to_string().contains("status -5"));

        devices.set_services(address, sensor_profile(true, true));
        manager.discover(address).unwrap();
        assert!(matches!(
            client.next_event().unwrap(),
            RscEvent::Connected { configured: false, .. }
        ));

        assert!(!client.sensor_info(address).unwrap().configured);
        client.configure(address, 0).unwrap();
        assert!(client.un_configure(address).is_err());
        assert!(client.start_sensor_calibration(address).is_err());
        assert!(client.update_cumulative_value(address, 10).is_err());
        assert!(client.get_sensor_location(address).is_err());
        assert!(client.unregister(callback_id + 100).is_err());

        drop(client);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while bus.client_count() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(bus.client_count(), 0);
        assert_eq!(
            manager.unregister_event_callback(ClientId(1), callback_id),
            Err(crate::RscError::InvalidParameter)
        );
    }
}
