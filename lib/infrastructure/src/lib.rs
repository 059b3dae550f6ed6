mod bus;
mod http;
mod monitoring;
mod mqtt;

pub use monitoring::MonitoringConfig;

pub use bus::{EventBus, EventEmitter, EventListener};
pub use http::client::HttpClientConfig;
pub use mqtt::{Mqtt, MqttConfig, MqttInMessage, MqttSender, MqttSubscription, MqttWill};

pub mod meter {
    pub use super::monitoring::meter::{UplinkOutcome, record_cloud_connection, record_uplink};
}
