use clap::{Parser, Subcommand};
use infrastructure::EventBus;
use settings::Settings;
use tokio_util::sync::CancellationToken;

use crate::{
    device::DeviceStore,
    provisioning::{FlowError, resolve_api_key},
    sensor::{SensorEntity, SensorRunner, StateStore},
    telemetry::TelemetryRunner,
};

mod adapter;
mod device;
mod provisioning;
mod sensor;
mod settings;
mod telemetry;
mod uplink;

#[derive(Parser, Debug)]
#[command(version, about = "Bridges LMT IoT devices into Home Assistant via MQTT")]
struct Cli {
    /// LMT API key, defaults to the key of an already provisioned device.
    #[arg(long, env = "LMT_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices of the account with smart home support.
    Devices,
    /// Request certificates for a device and store its connection.
    Provision { device_id: String },
    /// Forget a provisioned device.
    Remove { device_id: String },
    /// Connect all provisioned devices and publish their sensors.
    Run,
}

#[tokio::main(flavor = "multi_thread")]
pub async fn main() {
    let cli = Cli::parse();

    let settings = Settings::new().expect("Error reading configuration");
    settings.monitoring.init().expect("Error initializing monitoring");

    let result = match cli.command {
        Command::Devices => list_devices(&settings, cli.api_key.as_deref()).await,
        Command::Provision { device_id } => provision(&settings, cli.api_key.as_deref(), &device_id).await,
        Command::Remove { device_id } => remove(&settings, &device_id),
        Command::Run => run(settings).await,
    };

    if let Err(e) = result {
        tracing::error!("{:?}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn flow_error(e: FlowError) -> anyhow::Error {
    anyhow::anyhow!("{} ({})", e, e.key())
}

async fn list_devices(settings: &Settings, api_key: Option<&str>) -> anyhow::Result<()> {
    let store = DeviceStore::load(&settings.storage.entries_file)?;
    let api_key = resolve_api_key(&store, api_key).map_err(flow_error)?;

    let flow = settings.cloud.new_provisioning_flow(&api_key)?;
    let candidates = flow.discover().await.map_err(flow_error)?;

    for candidate in candidates {
        let configured = if store.contains(&candidate.id) { " [configured]" } else { "" };
        println!(
            "{}\t{}\t{}\t{} sensor(s){}",
            candidate.id,
            candidate.name,
            candidate.device_type,
            candidate.sensors.len(),
            configured
        );
    }

    Ok(())
}

async fn provision(settings: &Settings, api_key: Option<&str>, device_id: &str) -> anyhow::Result<()> {
    let mut store = DeviceStore::load(&settings.storage.entries_file)?;
    let api_key = resolve_api_key(&store, api_key).map_err(flow_error)?;

    let flow = settings.cloud.new_provisioning_flow(&api_key)?;
    let candidates = flow.discover().await.map_err(flow_error)?;
    let entry = flow.provision(&candidates, device_id, &store).await.map_err(flow_error)?;

    let title = entry.title.clone();
    store.add(entry)?;
    store.save()?;

    tracing::info!("Provisioned {}", title);
    println!("Provisioned {}", title);
    Ok(())
}

fn remove(settings: &Settings, device_id: &str) -> anyhow::Result<()> {
    let mut store = DeviceStore::load(&settings.storage.entries_file)?;
    let entry = store.remove(device_id)?;
    store.save()?;

    tracing::info!("Removed {}", entry.title);
    println!("Removed {}", entry.title);
    Ok(())
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let store = DeviceStore::load(&settings.storage.entries_file)?;
    let entries = store.entries().to_vec();
    if entries.is_empty() {
        tracing::warn!("No devices provisioned yet, nothing to connect");
    }

    let sensors = SensorEntity::for_entries(&entries);
    let states = StateStore::load(&settings.storage.state_file);

    let mut mqtt = settings.mqtt.new_client(Some(settings.homeassistant.last_will()));
    let discovery_runner = settings
        .homeassistant
        .new_discovery_runner(&mut mqtt, &entries, &sensors)
        .await?;
    let publisher = settings.homeassistant.new_state_publisher(&mqtt);

    let bus = EventBus::new(64);
    let sensor_runner = SensorRunner::new(sensors, bus.subscribe(), publisher, states);
    let telemetry_runner = TelemetryRunner::new(&entries, bus.emitter());

    let shutdown = CancellationToken::new();
    let shutdown_on_signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Error waiting for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
        }
    };

    tracing::info!("Starting main loop");

    //the broker publishes the last will once the local connection is dropped
    tokio::select!(
        _ = mqtt.run() => {},
        _ = async {
            tokio::join!(
                telemetry_runner.run(shutdown.clone()),
                sensor_runner.run(shutdown.clone()),
                discovery_runner.run(shutdown.clone()),
                shutdown_on_signal,
            )
        } => {},
    );

    Ok(())
}
