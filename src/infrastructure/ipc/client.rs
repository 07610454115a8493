use crate::domain::events::RscEvent;
use crate::domain::models::{BdAddr, CallbackId, ConnectedSensor, ProcedureId, SensorLocation};
use crate::infrastructure::ipc::protocol::{encode_line, RscMessage, RscReply, RscRequest, RscResponse};
use anyhow::{bail, Context, Result};
use interprocess::local_socket::{traits::Stream, GenericNamespaced, Stream as LocalStream, ToNsName};
use interprocess::TryClone;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Blocking client for the profile manager daemon.
///
/// Events that arrive while a request is waiting for its response are kept
/// and handed out by [`RscClient::next_event`].
pub struct RscClient {
    stream: LocalStream,
    reader: BufReader<LocalStream>,
    events: VecDeque<RscEvent>,
}

impl RscClient {
    pub fn connect(socket_name: &str) -> Result<Self> {
        let name = socket_name.to_ns_name::<GenericNamespaced>()?;
        let stream = LocalStream::connect(name)
            .with_context(|| format!("Cannot connect to {}", socket_name))?;
        let reader = BufReader::new(stream.try_clone()?);
        info!("Connected to RSC profile manager at {}", socket_name);
        Ok(Self {
            stream,
            reader,
            events: VecDeque::new(),
        })
    }

    /// Keep trying to connect until the daemon is listening
    pub fn wait_for_server(socket_name: &str, timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        loop {
            match Self::connect(socket_name) {
                Ok(client) => return Ok(client),
                Err(e) if start.elapsed() >= timeout => return Err(e),
                Err(_) => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    fn read_message(&mut self) -> Result<RscMessage> {
        let mut buffer = String::new();
        if self.reader.read_line(&mut buffer)? == 0 {
            bail!("Connection closed by the profile manager");
        }
        Ok(serde_json::from_str(&buffer)?)
    }

    pub fn request(&mut self, request: &RscRequest) -> Result<RscReply> {
        let line = encode_line(request)?;
        self.stream.write_all(line.as_bytes())?;
        self.stream.flush()?;

        loop {
            match self.read_message()? {
                RscMessage::Event(event) => self.events.push_back(event),
                RscMessage::Response(RscResponse::Success(reply)) => return Ok(reply),
                RscMessage::Response(RscResponse::Failure { code, message }) => {
                    bail!("{} (status {})", message, code)
                }
            }
        }
    }

    /// Block until the next event for this client
    pub fn next_event(&mut self) -> Result<RscEvent> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        loop {
            match self.read_message()? {
                RscMessage::Event(event) => return Ok(event),
                RscMessage::Response(response) => {
                    debug!("Dropping unsolicited response {:?}", response);
                }
            }
        }
    }

    pub fn ping(&mut self) -> Result<()> {
        match self.request(&RscRequest::Ping)? {
            RscReply::Pong => Ok(()),
            other => bail!("Unexpected reply {:?}", other),
        }
    }

    pub fn register(&mut self) -> Result<CallbackId> {
        match self.request(&RscRequest::Register)? {
            RscReply::Registered { callback_id } => Ok(callback_id),
            other => bail!("Unexpected reply {:?}", other),
        }
    }

    pub fn connected_sensors(&mut self, max_entries: usize) -> Result<(Vec<ConnectedSensor>, usize)> {
        match self.request(&RscRequest::QueryConnectedSensors { max_entries })? {
            RscReply::ConnectedSensors { sensors, total } => Ok((sensors, total)),
            other => bail!("Unexpected reply {:?}", other),
        }
    }

    pub fn unregister(&mut self, callback_id: CallbackId) -> Result<()> {
        self.request(&RscRequest::Unregister { callback_id })?;
        Ok(())
    }

    pub fn sensor_info(&mut self, address: BdAddr) -> Result<ConnectedSensor> {
        match self.request(&RscRequest::GetConnectedSensorInfo { address })? {
            RscReply::SensorInfo(sensor) => Ok(sensor),
            other => bail!("Unexpected reply {:?}", other),
        }
    }

    pub fn configure(&mut self, address: BdAddr, flags: u32) -> Result<()> {
        self.request(&RscRequest::Configure { address, flags })?;
        Ok(())
    }

    pub fn un_configure(&mut self, address: BdAddr) -> Result<()> {
        self.request(&RscRequest::UnConfigure { address })?;
        Ok(())
    }

    /// The answer arrives later as a `SensorLocationResponse` event
    pub fn get_sensor_location(&mut self, address: BdAddr) -> Result<()> {
        self.request(&RscRequest::GetSensorLocation { address })?;
        Ok(())
    }

    pub fn update_cumulative_value(
        &mut self,
        address: BdAddr,
        cumulative_value: u32,
    ) -> Result<ProcedureId> {
        self.start_procedure(&RscRequest::UpdateCumulativeValue {
            address,
            cumulative_value,
        })
    }

    pub fn update_sensor_location(
        &mut self,
        address: BdAddr,
        location: SensorLocation,
    ) -> Result<ProcedureId> {
        self.start_procedure(&RscRequest::UpdateSensorLocation { address, location })
    }

    pub fn start_sensor_calibration(&mut self, address: BdAddr) -> Result<ProcedureId> {
        self.start_procedure(&RscRequest::StartSensorCalibration { address })
    }

    fn start_procedure(&mut self, request: &RscRequest) -> Result<ProcedureId> {
        match self.request(request)? {
            RscReply::ProcedureStarted { procedure_id } => Ok(procedure_id),
            other => bail!("Unexpected reply {:?}", other),
        }
    }
}
