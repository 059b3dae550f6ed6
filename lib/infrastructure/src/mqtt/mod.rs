mod client;
mod receiver;
mod sender;

pub use client::Mqtt;
pub use receiver::{MqttInMessage, MqttSubscription};
pub use sender::MqttSender;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    port: u16,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
}

/// Retained message published by the broker when the connection drops.
#[derive(Debug, Clone)]
pub struct MqttWill {
    pub topic: String,
    pub payload: String,
}

impl MqttConfig {
    pub fn new_client(&self, will: Option<MqttWill>) -> Mqtt {
        Mqtt::connect(
            &self.host,
            self.port,
            &self.client_id,
            self.username.as_deref().zip(self.password.as_deref()),
            will,
        )
    }
}
