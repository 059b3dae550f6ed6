use std::collections::HashMap;

use crate::device::{DeviceEntry, DeviceStore, SensorConfig};

use super::{
    FlowError,
    api::{ApiDevice, LmtApiClient, SmartHomeCapabilities, download_root_ca},
};

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCandidate {
    pub id: String,
    pub name: String,
    pub device_type: String,
    pub sensors: Vec<SensorConfig>,
}

pub struct ProvisioningFlow {
    api: LmtApiClient,
    api_key: String,
    root_ca_url: String,
    broker_host: String,
    broker_port: u16,
}

impl ProvisioningFlow {
    pub fn new(
        api: LmtApiClient,
        api_key: impl Into<String>,
        root_ca_url: impl Into<String>,
        broker_host: impl Into<String>,
        broker_port: u16,
    ) -> Self {
        Self {
            api,
            api_key: api_key.into(),
            root_ca_url: root_ca_url.into(),
            broker_host: broker_host.into(),
            broker_port,
        }
    }

    /// Devices of the account whose type supports smart home integration.
    pub async fn discover(&self) -> Result<Vec<DeviceCandidate>, FlowError> {
        let devices = self.api.list_devices().await?;

        let mut type_cache: HashMap<String, SmartHomeCapabilities> = HashMap::new();
        let mut candidates = vec![];

        for device in devices {
            if !type_cache.contains_key(&device.device_type) {
                match self.api.get_device_type(&device.device_type).await? {
                    Some(capabilities) => {
                        type_cache.insert(device.device_type.clone(), capabilities);
                    }
                    None => continue,
                }
            }

            let Some(capabilities) = type_cache.get(&device.device_type).filter(|c| c.enabled) else {
                tracing::debug!(
                    "Skipping device {} of type {} without smart home support",
                    device.serial_number,
                    device.device_type
                );
                continue;
            };

            candidates.push(DeviceCandidate {
                id: device.serial_number.clone(),
                name: display_name(&device),
                device_type: device.device_type.clone(),
                sensors: capabilities.sensors.clone(),
            });
        }

        if candidates.is_empty() {
            return Err(FlowError::NoDevices);
        }

        Ok(candidates)
    }

    pub async fn provision(
        &self,
        candidates: &[DeviceCandidate],
        device_id: &str,
        store: &DeviceStore,
    ) -> Result<DeviceEntry, FlowError> {
        let candidate = candidates
            .iter()
            .find(|c| c.id == device_id)
            .ok_or(FlowError::DeviceNotFound)?;

        if store.contains(device_id) {
            return Err(FlowError::AlreadyConfigured);
        }

        tracing::info!("Requesting certificates for device: {}", device_id);
        let certificates = self.api.request_certificates(device_id).await?;

        tracing::info!("Provisioning device: {}", device_id);
        let ca_cert = download_root_ca(&self.root_ca_url).await;

        tracing::info!(
            "Creating config entry for device {} with {} sensors",
            device_id,
            candidate.sensors.len()
        );

        Ok(DeviceEntry {
            title: format!("Device {}", candidate.name),
            host: self.broker_host.clone(),
            port: self.broker_port,
            ca_cert,
            client_cert: certificates.certificate_pem,
            client_key: certificates.private_key,
            device_id: device_id.to_owned(),
            api_key: self.api_key.clone(),
            sensor_config: candidate.sensors.clone(),
            device_type: candidate.device_type.clone(),
        })
    }
}

/// An explicitly given key wins, otherwise the key of an already provisioned device is reused.
pub fn resolve_api_key(store: &DeviceStore, provided: Option<&str>) -> Result<String, FlowError> {
    provided
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .or_else(|| store.api_key())
        .map(str::to_owned)
        .ok_or(FlowError::MissingApiKey)
}

/// `House - Room - (serial)`, parts that are unknown are left out.
pub fn display_name(device: &ApiDevice) -> String {
    let room = device.room.clone().unwrap_or_default();

    let room_name = match room.custom_name.filter(|n| !n.is_empty()) {
        Some(custom) => custom,
        None => room.name.map(|n| title_case(&n)).unwrap_or_default(),
    };

    let house_name = room.house.and_then(|h| h.name).unwrap_or_default();

    let mut parts = vec![];
    if !house_name.is_empty() {
        parts.push(house_name);
    }
    if !room_name.is_empty() {
        parts.push(room_name);
    }
    parts.push(format!("({})", device.serial_number));

    parts.join(" - ")
}

fn title_case(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut previous_is_letter = false;

    for c in value.chars() {
        if previous_is_letter {
            result.extend(c.to_lowercase());
        } else {
            result.extend(c.to_uppercase());
        }
        previous_is_letter = c.is_alphabetic();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support;

    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    fn devices_path() -> Matcher {
        Matcher::Regex(r"^/devices(\?limit=50)?$".to_owned())
    }

    fn device(value: serde_json::Value) -> ApiDevice {
        serde_json::from_value(value).unwrap()
    }

    fn flow(server: &ServerGuard) -> ProvisioningFlow {
        let api = LmtApiClient::new(&server.url(), "secret").unwrap();
        ProvisioningFlow::new(
            api,
            "secret",
            format!("{}/AmazonRootCA1.pem", server.url()),
            "broker.example.com",
            8883,
        )
    }

    fn empty_store() -> (tempfile::TempDir, DeviceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::load(dir.path().join("devices.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn display_name_with_house_and_room() {
        let name = display_name(&device(json!({
            "serialNumber": "X1",
            "type": "SMOKE",
            "room": {"name": "LIVING ROOM", "house": {"name": "Summer house"}}
        })));

        assert_eq!(name, "Summer house - Living Room - (X1)");
    }

    #[test]
    fn display_name_prefers_custom_room_name() {
        let name = display_name(&device(json!({
            "serialNumber": "X1",
            "type": "SMOKE",
            "room": {"name": "kitchen", "customName": "my kitchen"}
        })));

        assert_eq!(name, "my kitchen - (X1)");
    }

    #[test]
    fn display_name_without_room() {
        let name = display_name(&device(json!({"serialNumber": "X1", "type": "SMOKE"})));
        assert_eq!(name, "(X1)");
    }

    #[test]
    fn title_case_words() {
        assert_eq!(title_case("living_room"), "Living_Room");
        assert_eq!(title_case("bedroom 2"), "Bedroom 2");
    }

    #[test]
    fn explicit_api_key_wins() {
        let (_dir, mut store) = empty_store();
        store.add(test_support::entry("X1", vec![])).unwrap();

        assert_eq!(resolve_api_key(&store, Some("fresh")).unwrap(), "fresh");
        assert_eq!(resolve_api_key(&store, None).unwrap(), "api-key");
        assert_eq!(resolve_api_key(&store, Some("  ")).unwrap(), "api-key");
    }

    #[test]
    fn missing_api_key() {
        let (_dir, store) = empty_store();
        assert_eq!(resolve_api_key(&store, None), Err(FlowError::MissingApiKey));
    }

    #[tokio::test]
    async fn discover_looks_up_each_type_once() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", devices_path())
            .match_query(Matcher::UrlEncoded("limit".to_owned(), "50".to_owned()))
            .with_status(200)
            .with_body(
                json!({"data": [
                    {"serialNumber": "S1", "type": "SMOKE", "room": {"name": "hall"}},
                    {"serialNumber": "S2", "type": "SMOKE"},
                    {"serialNumber": "G1", "type": "GPS"},
                    {"serialNumber": "B1", "type": "BROKEN"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;
        let smoke = server
            .mock("GET", "/devices/types/SMOKE")
            .with_status(200)
            .with_body(
                json!({"measurements": {"smartHome": {"enabled": true, "sensors": [
                    {"key": "SMOKE_STATUS", "name": "Smoke"}
                ]}}})
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/devices/types/GPS")
            .with_status(200)
            .with_body(json!({"measurements": {"smartHome": {"enabled": false}}}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/devices/types/BROKEN")
            .with_status(500)
            .create_async()
            .await;

        let candidates = flow(&server).discover().await.unwrap();

        smoke.assert_async().await;
        assert_eq!(
            candidates.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec!["S1", "S2"]
        );
        assert_eq!(candidates[0].name, "Hall - (S1)");
        assert_eq!(candidates[0].sensors[0].key, "SMOKE_STATUS");
    }

    #[tokio::test]
    async fn discover_without_supported_devices() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", devices_path())
            .match_query(Matcher::UrlEncoded("limit".to_owned(), "50".to_owned()))
            .with_status(200)
            .with_body(json!({"data": []}).to_string())
            .create_async()
            .await;

        assert_eq!(flow(&server).discover().await, Err(FlowError::NoDevices));
    }

    #[tokio::test]
    async fn provision_creates_entry() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/devices/S1/certificates")
            .match_body(Matcher::Json(json!({"target": "SMART_HOME"})))
            .with_status(200)
            .with_body(json!({"certificatePem": "CERT", "privateKey": "KEY"}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/AmazonRootCA1.pem")
            .with_status(200)
            .with_body("-----BEGIN CERTIFICATE-----\nROOT\n-----END CERTIFICATE-----\n")
            .create_async()
            .await;

        let candidates = vec![DeviceCandidate {
            id: "S1".to_owned(),
            name: "Hall - (S1)".to_owned(),
            device_type: "SMOKE".to_owned(),
            sensors: vec![test_support::sensor("SMOKE_STATUS", "Smoke")],
        }];
        let (_dir, store) = empty_store();

        let entry = flow(&server).provision(&candidates, "S1", &store).await.unwrap();

        assert_eq!(entry.title, "Device Hall - (S1)");
        assert_eq!(entry.host, "broker.example.com");
        assert_eq!(entry.port, 8883);
        assert_eq!(entry.client_cert, "CERT");
        assert_eq!(entry.client_key, "KEY");
        assert!(entry.ca_cert.contains("ROOT"));
        assert_eq!(entry.api_key, "secret");
        assert_eq!(entry.device_type, "SMOKE");
        assert_eq!(entry.sensor_config.len(), 1);
    }

    #[tokio::test]
    async fn provision_rejects_configured_device() {
        let server = Server::new_async().await;
        let candidates = vec![DeviceCandidate {
            id: "X1".to_owned(),
            name: "(X1)".to_owned(),
            device_type: "SMOKE".to_owned(),
            sensors: vec![],
        }];
        let (_dir, mut store) = empty_store();
        store.add(test_support::entry("X1", vec![])).unwrap();

        let result = flow(&server).provision(&candidates, "X1", &store).await;
        assert_eq!(result.unwrap_err(), FlowError::AlreadyConfigured);
    }

    #[tokio::test]
    async fn provision_unknown_candidate() {
        let server = Server::new_async().await;
        let (_dir, store) = empty_store();

        let result = flow(&server).provision(&[], "X1", &store).await;
        assert_eq!(result.unwrap_err(), FlowError::DeviceNotFound);
    }
}
