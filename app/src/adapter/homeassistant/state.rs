use infrastructure::MqttSender;

use crate::sensor::{SensorEntity, SensorStatePublisher};

use super::{HomeAssistant, OFFLINE, ONLINE};

pub struct HaStatePublisher {
    config: HomeAssistant,
    sender: MqttSender,
}

impl HaStatePublisher {
    pub(super) fn new(config: HomeAssistant, sender: MqttSender) -> Self {
        Self { config, sender }
    }
}

impl SensorStatePublisher for HaStatePublisher {
    async fn publish_state(&self, sensor: &SensorEntity) -> anyhow::Result<()> {
        self.sender
            .send_retained(self.config.state_topic(sensor), state_payload(sensor))
            .await
    }

    async fn publish_availability(&self, sensor: &SensorEntity) -> anyhow::Result<()> {
        self.sender
            .send_retained(self.config.availability_topic(sensor), availability_payload(sensor))
            .await
    }
}

//read as unknown by Home Assistant
const NO_VALUE: &str = "None";

fn state_payload(sensor: &SensorEntity) -> String {
    match sensor.value() {
        Some(value) => value.to_string(),
        None => NO_VALUE.to_owned(),
    }
}

fn availability_payload(sensor: &SensorEntity) -> &'static str {
    if sensor.is_available() { ONLINE } else { OFFLINE }
}
