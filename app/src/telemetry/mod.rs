mod connection;

use infrastructure::EventEmitter;
use tokio_util::sync::CancellationToken;

use crate::{device::DeviceEntry, uplink::Uplink};

use connection::CloudConnection;

/// A decoded telemetry message of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkEvent {
    pub device_id: String,
    pub topic: String,
    pub payload: Uplink,
}

pub struct TelemetryRunner {
    connections: Vec<CloudConnection>,
}

impl TelemetryRunner {
    pub fn new(entries: &[DeviceEntry], emitter: EventEmitter<UplinkEvent>) -> Self {
        let connections = entries
            .iter()
            .map(|entry| CloudConnection::new(entry, emitter.clone()))
            .collect();

        Self { connections }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Starting {} cloud connection(s)", self.connections.len());

        let tasks = self
            .connections
            .into_iter()
            .map(|connection| connection.run(shutdown.clone()));

        futures::future::join_all(tasks).await;

        tracing::info!("All cloud connections closed");
    }
}
