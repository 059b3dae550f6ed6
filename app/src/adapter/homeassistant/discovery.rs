use infrastructure::{MqttSender, MqttSubscription};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{device::DeviceEntry, sensor::SensorEntity};

use super::{HomeAssistant, ONLINE};

const MANUFACTURER: &str = "LMT";

#[derive(Debug, Serialize)]
struct DiscoveryDevice<'a> {
    identifiers: [&'a str; 1],
    name: &'a str,
    manufacturer: &'a str,
    model: &'a str,
}

#[derive(Debug, Serialize)]
struct Availability {
    topic: String,
}

#[derive(Debug, Serialize)]
struct SensorDiscovery<'a> {
    name: &'a str,
    unique_id: &'a str,
    object_id: &'a str,
    state_topic: String,
    availability: [Availability; 2],
    availability_mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<String>,
    device: DiscoveryDevice<'a>,
}

#[derive(Debug, Clone, PartialEq)]
struct DiscoveryMessage {
    topic: String,
    payload: String,
}

fn discovery_messages(
    config: &HomeAssistant,
    entries: &[DeviceEntry],
    sensors: &[SensorEntity],
) -> Vec<DiscoveryMessage> {
    let mut messages = vec![];

    for sensor in sensors {
        let Some(entry) = entries.iter().find(|e| e.device_id == sensor.device_id) else {
            tracing::warn!("No device entry for sensor {}, skipping discovery", sensor.unique_id);
            continue;
        };

        let discovery = SensorDiscovery {
            name: &sensor.name,
            unique_id: &sensor.unique_id,
            object_id: &sensor.unique_id,
            state_topic: config.state_topic(sensor),
            availability: [
                Availability {
                    topic: config.bridge_availability_topic(),
                },
                Availability {
                    topic: config.availability_topic(sensor),
                },
            ],
            availability_mode: "all",
            unit_of_measurement: sensor.unit.as_deref(),
            device_class: sensor.device_class.as_deref(),
            state_class: sensor.state_class.map(|c| c.to_string()),
            device: DiscoveryDevice {
                identifiers: [entry.device_id.as_str()],
                name: &entry.title,
                manufacturer: MANUFACTURER,
                model: &entry.device_type,
            },
        };

        match serde_json::to_string(&discovery) {
            Ok(payload) => messages.push(DiscoveryMessage {
                topic: config.discovery_topic(sensor),
                payload,
            }),
            Err(e) => tracing::error!("Error serializing discovery of {}: {:?}", sensor.unique_id, e),
        }
    }

    messages
}

/// Announces all sensors to Home Assistant, again whenever Home Assistant comes back online.
pub struct HaDiscoveryRunner {
    bridge_availability_topic: String,
    messages: Vec<DiscoveryMessage>,
    sender: MqttSender,
    status: MqttSubscription,
}

impl HaDiscoveryRunner {
    pub(super) fn new(
        config: &HomeAssistant,
        entries: &[DeviceEntry],
        sensors: &[SensorEntity],
        sender: MqttSender,
        status: MqttSubscription,
    ) -> Self {
        Self {
            bridge_availability_topic: config.bridge_availability_topic(),
            messages: discovery_messages(config, entries, sensors),
            sender,
            status,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        self.announce().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                msg = self.status.recv() => match msg {
                    Some(msg) if msg.payload.trim() == ONLINE => {
                        tracing::info!("Home Assistant is online, republishing discovery");
                        self.announce().await;
                    }
                    Some(msg) => {
                        tracing::debug!("Ignoring Home Assistant status {}", msg.payload);
                    }
                    None => {
                        tracing::error!("Home Assistant status subscription closed");
                        break;
                    }
                },
            }
        }

        if let Err(e) = self.sender.send_retained(&self.bridge_availability_topic, super::OFFLINE).await {
            tracing::warn!("Error marking bridge offline: {:?}", e);
        }
    }

    async fn announce(&self) {
        tracing::info!("Publishing discovery for {} sensor(s)", self.messages.len());

        for message in self.messages.iter() {
            if let Err(e) = self.sender.send_retained(&message.topic, &message.payload).await {
                tracing::error!("Error publishing discovery to {}: {:?}", message.topic, e);
            }
        }

        if let Err(e) = self.sender.send_retained(&self.bridge_availability_topic, ONLINE).await {
            tracing::error!("Error publishing bridge availability: {:?}", e);
        }
    }
}
