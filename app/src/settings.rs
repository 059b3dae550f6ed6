use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use infrastructure::{MonitoringConfig, MqttConfig};
use serde::Deserialize;

use crate::{
    adapter::homeassistant::HomeAssistant,
    provisioning::{LmtApiClient, ProvisioningFlow},
};

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub homeassistant: HomeAssistant,
    #[serde(default)]
    pub cloud: CloudSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("config.toml").required(false))
            .add_source(Environment::default().separator("_").list_separator(","));

        let s = builder.build()?;
        s.try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CloudSettings {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_root_ca_url")]
    pub root_ca_url: String,
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
}

fn default_api_url() -> String {
    "https://mobile-api.lmt-iot.com/api".to_owned()
}

fn default_root_ca_url() -> String {
    "https://www.amazontrust.com/repository/AmazonRootCA1.pem".to_owned()
}

fn default_broker_host() -> String {
    "a9eo836zhfe6w-ats.iot.eu-central-1.amazonaws.com".to_owned()
}

fn default_broker_port() -> u16 {
    8883
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            root_ca_url: default_root_ca_url(),
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
        }
    }
}

impl CloudSettings {
    pub fn new_provisioning_flow(&self, api_key: &str) -> anyhow::Result<ProvisioningFlow> {
        let api = LmtApiClient::new(&self.api_url, api_key)?;
        Ok(ProvisioningFlow::new(
            api,
            api_key,
            &self.root_ca_url,
            &self.broker_host,
            self.broker_port,
        ))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    #[serde(default = "default_entries_file")]
    pub entries_file: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_entries_file() -> PathBuf {
    PathBuf::from("data/devices.json")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("data/sensor_states.json")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            entries_file: default_entries_file(),
            state_file: default_state_file(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(content: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(content, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let settings = from_toml(
            r#"
            [mqtt]
            host = "localhost"
            port = 1883
            client_id = "lmt-iot-bridge"
            "#,
        );

        assert_eq!(settings.homeassistant.discovery_prefix, "homeassistant");
        assert_eq!(settings.cloud.api_url, "https://mobile-api.lmt-iot.com/api");
        assert_eq!(settings.cloud.broker_port, 8883);
        assert_eq!(settings.storage.entries_file, PathBuf::from("data/devices.json"));
    }

    #[test]
    fn sections_override_defaults() {
        let settings = from_toml(
            r#"
            [mqtt]
            host = "localhost"
            port = 1883
            client_id = "lmt-iot-bridge"
            username = "bridge"
            password = "secret"

            [homeassistant]
            base_topic = "lmt"

            [cloud]
            api_url = "http://localhost:8080/api"

            [storage]
            state_file = "/var/lib/lmt/states.json"
            "#,
        );

        assert_eq!(settings.homeassistant.base_topic, "lmt");
        assert_eq!(settings.homeassistant.discovery_prefix, "homeassistant");
        assert_eq!(settings.cloud.api_url, "http://localhost:8080/api");
        assert_eq!(settings.cloud.root_ca_url, default_root_ca_url());
        assert_eq!(settings.storage.state_file, PathBuf::from("/var/lib/lmt/states.json"));
    }
}
