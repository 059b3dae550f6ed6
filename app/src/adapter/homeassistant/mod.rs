mod discovery;
mod state;

use infrastructure::{Mqtt, MqttWill};
use serde::Deserialize;

use crate::{device::DeviceEntry, sensor::SensorEntity};

pub use discovery::HaDiscoveryRunner;
pub use state::HaStatePublisher;

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

#[derive(Debug, Deserialize, Clone)]
pub struct HomeAssistant {
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_owned()
}

fn default_base_topic() -> String {
    "lmt_iot".to_owned()
}

impl Default for HomeAssistant {
    fn default() -> Self {
        Self {
            discovery_prefix: default_discovery_prefix(),
            base_topic: default_base_topic(),
        }
    }
}

impl HomeAssistant {
    /// Marks the bridge offline when the broker loses the connection.
    pub fn last_will(&self) -> MqttWill {
        MqttWill {
            topic: self.bridge_availability_topic(),
            payload: OFFLINE.to_owned(),
        }
    }

    pub fn new_state_publisher(&self, mqtt: &Mqtt) -> HaStatePublisher {
        HaStatePublisher::new(self.clone(), mqtt.sender())
    }

    pub async fn new_discovery_runner(
        &self,
        mqtt: &mut Mqtt,
        entries: &[DeviceEntry],
        sensors: &[SensorEntity],
    ) -> anyhow::Result<HaDiscoveryRunner> {
        let status = mqtt.subscribe(self.status_topic()).await?;
        Ok(HaDiscoveryRunner::new(self, entries, sensors, mqtt.sender(), status))
    }

    fn status_topic(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    fn bridge_availability_topic(&self) -> String {
        format!("{}/bridge/availability", self.base_topic)
    }

    fn discovery_topic(&self, sensor: &SensorEntity) -> String {
        format!("{}/sensor/{}/config", self.discovery_prefix, sensor.unique_id)
    }

    fn state_topic(&self, sensor: &SensorEntity) -> String {
        format!("{}/{}/{}/state", self.base_topic, sensor.device_id, sensor.key)
    }

    fn availability_topic(&self, sensor: &SensorEntity) -> String {
        format!("{}/{}/{}/availability", self.base_topic, sensor.device_id, sensor.key)
    }
}
