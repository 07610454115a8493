//! Local socket server exposing the manager to other processes.
//!
//! Every accepted connection gets its own thread and client id. Requests
//! are answered in order on the same connection. Responses and events share
//! one queue per client, drained by that client's writer thread, so a client
//! may see events between a request and its response. A client that stops
//! reading loses events once its queue is full.

use crate::domain::error::RscError;
use crate::domain::events::RscEvent;
use crate::domain::facades::MessageBus;
use crate::domain::models::ClientId;
use crate::infrastructure::ipc::protocol::{encode_line, RscMessage, RscReply, RscRequest, RscResponse};
use crate::profile::RscManager;
use anyhow::{anyhow, bail, Context, Result};
use interprocess::local_socket::{
    traits::ListenerExt, GenericNamespaced, ListenerOptions, Stream as LocalStream, ToNsName,
};
use interprocess::TryClone;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Messages queued for one client before its events start being dropped
pub const OUTBOX_CAPACITY: usize = 256;

/// Queue feeding the writer thread of one client
pub type ClientOutbox = SyncSender<RscMessage>;

fn write_message(writer: &mut impl Write, message: &RscMessage) -> Result<()> {
    let line = encode_line(message)?;
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Start the thread that owns the write half of a client connection.
/// It stops when every sender is dropped or the client goes away.
pub fn spawn_writer(client: ClientId, mut writer: impl Write + Send + 'static) -> Result<ClientOutbox> {
    let (outbox, queue) = mpsc::sync_channel::<RscMessage>(OUTBOX_CAPACITY);
    std::thread::Builder::new()
        .name(format!("rsc-ipc-{}-out", client.0))
        .spawn(move || {
            for message in queue {
                if let Err(e) = write_message(&mut writer, &message) {
                    debug!("Stopped writing to {}: {:#}", client, e);
                    break;
                }
            }
        })
        .with_context(|| format!("Cannot start the writer thread for {}", client))?;
    Ok(outbox)
}

/// Message bus over the connected IPC clients. Sending never waits on a
/// client socket.
#[derive(Default)]
pub struct IpcBus {
    clients: Mutex<HashMap<ClientId, ClientOutbox>>,
}

impl IpcBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, client: ClientId, outbox: ClientOutbox) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(client, outbox);
        }
    }

    pub fn detach(&self, client: ClientId) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&client);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl MessageBus for IpcBus {
    fn send(&self, client: ClientId, event: &RscEvent) -> Result<()> {
        let outbox = self
            .clients
            .lock()
            .map_err(|_| anyhow!("Client table poisoned"))?
            .get(&client)
            .cloned()
            .ok_or_else(|| anyhow!("{} is not connected", client))?;
        match outbox.try_send(RscMessage::Event(event.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => bail!("{} is not reading, event dropped", client),
            Err(TrySendError::Disconnected(_)) => bail!("{} is gone", client),
        }
    }
}

/// Run one request against the manager on behalf of `client`
pub fn handle_request(manager: &RscManager, client: ClientId, request: RscRequest) -> RscResponse {
    let result = match request {
        RscRequest::Ping => Ok(RscReply::Pong),
        RscRequest::Register => manager
            .register_remote_client(client)
            .map(|callback_id| RscReply::Registered { callback_id }),
        RscRequest::Unregister { callback_id } => manager
            .unregister_event_callback(client, callback_id)
            .map(|_| RscReply::Done),
        RscRequest::QueryConnectedSensors { max_entries } => manager
            .query_connected_sensors(max_entries)
            .map(|(sensors, total)| RscReply::ConnectedSensors { sensors, total }),
        RscRequest::GetConnectedSensorInfo { address } => manager
            .get_connected_sensor_info(address)
            .map(RscReply::SensorInfo),
        RscRequest::Configure { address, flags } => manager
            .configure_remote_sensor(address, flags)
            .map(|_| RscReply::Done),
        RscRequest::UnConfigure { address } => manager
            .un_configure_remote_sensor(address)
            .map(|_| RscReply::Done),
        RscRequest::GetSensorLocation { address } => manager
            .get_sensor_location(client, address)
            .map(|_| RscReply::Done),
        RscRequest::UpdateCumulativeValue {
            address,
            cumulative_value,
        } => manager
            .update_cumulative_value(client, address, cumulative_value)
            .map(|procedure_id| RscReply::ProcedureStarted { procedure_id }),
        RscRequest::UpdateSensorLocation { address, location } => manager
            .update_sensor_location(client, address, location)
            .map(|procedure_id| RscReply::ProcedureStarted { procedure_id }),
        RscRequest::StartSensorCalibration { address } => manager
            .start_sensor_calibration(client, address)
            .map(|procedure_id| RscReply::ProcedureStarted { procedure_id }),
    };

    if let Err(e) = &result {
        debug!("Request from {} rejected: {}", client, e);
    }
    RscResponse::from(result)
}

/// Accept clients on `socket_name` until the listener fails. Blocks the
/// calling thread.
pub fn run_server(socket_name: &str, manager: RscManager, bus: Arc<IpcBus>) -> Result<()> {
    let name = socket_name
        .to_ns_name::<GenericNamespaced>()
        .with_context(|| format!("Invalid socket name {}", socket_name))?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_sync()
        .with_context(|| format!("Cannot listen on {}", socket_name))?;

    info!("Listening for IPC clients on {}", socket_name);

    let mut last_client = 0u32;
    for conn in listener.incoming().filter_map(|c| {
        c.map_err(|e| warn!("Failed to accept IPC client: {}", e)).ok()
    }) {
        last_client = last_client.checked_add(1).unwrap_or(1);
        let client = ClientId(last_client);
        let manager = manager.clone();
        let bus = bus.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("rsc-ipc-{}", client.0))
            .spawn(move || {
                if let Err(e) = serve_client(client, conn, &manager, &bus) {
                    warn!("{} connection error: {:#}", client, e);
                }
                manager.process_client_unregister(client);
                bus.detach(client);
                info!("{} disconnected", client);
            });
        if let Err(e) = spawned {
            error!("Cannot start a thread for {}: {}", client, e);
        }
    }

    Ok(())
}

fn serve_client(
    client: ClientId,
    stream: LocalStream,
    manager: &RscManager,
    bus: &IpcBus,
) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let outbox = spawn_writer(client, stream)?;
    bus.attach(client, outbox.clone());
    info!("{} connected", client);

    let mut buffer = String::new();
    loop {
        buffer.clear();
        if reader.read_line(&mut buffer)? == 0 {
            break;
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RscRequest>(&buffer) {
            Ok(request) => {
                debug!("{} -> {:?}", client, request);
                handle_request(manager, client, request)
            }
            Err(e) => {
                warn!("Malformed request from {}: {}", client, e);
                RscResponse::from(&RscError::InvalidParameter)
            }
        };
        outbox
            .send(RscMessage::Response(response))
            .map_err(|_| anyhow!("{} writer stopped", client))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::test_support::Harness;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Writer whose client never reads: every write waits until the test
    /// drops the sending half.
    struct StalledWriter(mpsc::Receiver<()>);

    impl Write for StalledWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .recv()
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn disconnected() -> RscEvent {
        RscEvent::Disconnected {
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
        }
    }

    #[test]
    fn test_bus_writes_event_lines() {
        let bus = IpcBus::new();
        let buffer = SharedBuffer::default();
        bus.attach(ClientId(3), spawn_writer(ClientId(3), buffer.clone()).unwrap());

        let event = disconnected();
        bus.send(ClientId(3), &event).unwrap();
        assert!(bus.send(ClientId(4), &event).is_err());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !buffer.0.lock().unwrap().ends_with(b"\n") && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let written = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let message: RscMessage = serde_json::from_str(written.trim_end()).unwrap();
        assert_eq!(message, RscMessage::Event(event));

        bus.detach(ClientId(3));
        assert_eq!(bus.client_count(), 0);
    }

    #[test]
    fn test_stalled_client_does_not_block_delivery() {
        let (release, stalled) = mpsc::channel();
        let bus = IpcBus::new();
        bus.attach(ClientId(5), spawn_writer(ClientId(5), StalledWriter(stalled)).unwrap());

        let event = disconnected();
        let dropped = (0..OUTBOX_CAPACITY + 2)
            .filter(|_| bus.send(ClientId(5), &event).is_err())
            .count();
        assert!(dropped >= 1);

        drop(release);
    }

    #[test]
    fn test_requests_map_to_manager_calls() {
        let h = Harness::new();
        let client = ClientId(12);
        let address = "AA:BB:CC:DD:EE:FF".parse().unwrap();

        assert_eq!(
            handle_request(&h.manager, client, RscRequest::Ping),
            RscResponse::Success(RscReply::Pong)
        );
        assert!(matches!(
            handle_request(&h.manager, client, RscRequest::Register),
            RscResponse::Success(RscReply::Registered { .. })
        ));
        assert_eq!(
            handle_request(&h.manager, client, RscRequest::Configure { address, flags: 0 }),
            RscResponse::from(&RscError::NotConnected)
        );

        h.configured_sensor(address);
        assert!(matches!(
            handle_request(
                &h.manager,
                client,
                RscRequest::UpdateCumulativeValue {
                    address,
                    cumulative_value: 99
                }
            ),
            RscResponse::Success(RscReply::ProcedureStarted { .. })
        ));
        assert_eq!(
            handle_request(
                &h.manager,
                client,
                RscRequest::QueryConnectedSensors { max_entries: 0 }
            ),
            RscResponse::Success(RscReply::ConnectedSensors {
                sensors: Vec::new(),
                total: 1
            })
        );
    }
}
