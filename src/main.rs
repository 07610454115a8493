use anyhow::{Context, Result};
use rsc_profile_manager::domain::events::RscEvent;
use rsc_profile_manager::domain::models::BdAddr;
use rsc_profile_manager::domain::settings::{Settings, SettingsService};
use rsc_profile_manager::infrastructure::ipc::{self, IpcBus};
use rsc_profile_manager::infrastructure::logging;
use rsc_profile_manager::infrastructure::record_store::FileRecordStore;
use rsc_profile_manager::infrastructure::simulated_sensor::{SensorProfile, SimulatedSensor};
use rsc_profile_manager::infrastructure::timer::TokioTimer;
use rsc_profile_manager::profile::{Facades, ManagerConfig, RscManager};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

fn main() -> Result<()> {
    let settings_service = SettingsService::new().context("Failed to load settings")?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {:#}", e))
        .ok();

    info!(
        "Starting RSC profile manager (settings: {})",
        settings_service.path().display()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let result = runtime.block_on(run(settings_service.get().clone()));
    // The IPC listener blocks in accept and never returns on its own.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(settings: Settings) -> Result<()> {
    let (gatt_tx, mut gatt_rx) = mpsc::unbounded_channel();
    let (device_tx, mut device_rx) = mpsc::unbounded_channel();
    let (expired_tx, mut expired_rx) = mpsc::unbounded_channel();

    let sensors = Arc::new(SimulatedSensor::new(gatt_tx, device_tx));
    let record_path = match &settings.record_store_file {
        Some(path) => path.clone(),
        None => FileRecordStore::default_path()?,
    };
    let records = FileRecordStore::open(record_path);
    info!("Sensor records at {}", records.path().display());

    let bus = Arc::new(IpcBus::new());
    let manager = RscManager::new(
        Facades {
            gatt: sensors.clone(),
            device_properties: sensors.clone(),
            timer: Arc::new(TokioTimer::new(Handle::current(), expired_tx)),
            records: Arc::new(records),
            bus: bus.clone(),
        },
        ManagerConfig::from(&settings),
    );

    let simulated: HashSet<BdAddr> = settings
        .simulated_sensors
        .iter()
        .filter_map(|text| {
            text.parse()
                .map_err(|e| warn!("Skipping simulated sensor: {}", e))
                .ok()
        })
        .collect();

    // Simulated sensors are configured as soon as they show up so that
    // measurements start flowing.
    let auto_configure = manager.clone();
    manager.register_event_callback(move |event| {
        match event {
            RscEvent::Connected {
                address,
                configured: false,
                ..
            } if simulated.contains(address) => {
                if let Err(e) = auto_configure.configure_remote_sensor(*address, 0) {
                    warn!("Could not configure {}: {}", address, e);
                }
            }
            RscEvent::Measurement { .. } => debug!("{:?}", event),
            _ => info!("{} event for {}", event.name(), event.address()),
        }
    })?;

    let gatt_manager = manager.clone();
    tokio::spawn(async move {
        while let Some(event) = gatt_rx.recv().await {
            gatt_manager.handle_gatt_event(event);
        }
    });

    let device_manager = manager.clone();
    tokio::spawn(async move {
        while let Some(event) = device_rx.recv().await {
            device_manager.handle_device_event(event);
        }
    });

    let timer_manager = manager.clone();
    tokio::spawn(async move {
        while let Some(procedure_id) = expired_rx.recv().await {
            timer_manager.handle_procedure_timeout(procedure_id);
        }
    });

    let server_manager = manager.clone();
    let socket_name = settings.ipc_socket_name.clone();
    let server =
        tokio::task::spawn_blocking(move || ipc::run_server(&socket_name, server_manager, bus));

    for text in &settings.simulated_sensors {
        if let Ok(address) = text.parse::<BdAddr>() {
            sensors.attach(address, SensorProfile::default())?;
        }
    }
    if !settings.simulated_sensors.is_empty() {
        tokio::spawn(
            sensors
                .clone()
                .run_measurements(Duration::from_millis(settings.simulated_measurement_interval_ms)),
        );
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received, shutting down");
        }
        stopped = server => match stopped {
            Ok(Ok(())) => warn!("IPC server stopped"),
            Ok(Err(e)) => error!("IPC server failed: {:#}", e),
            Err(e) => error!("IPC server task failed: {}", e),
        },
    }

    manager.shutdown()?;
    info!("RSC profile manager stopped");
    Ok(())
}
