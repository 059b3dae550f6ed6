use std::{fmt, time::Duration};

use anyhow::Context as _;
use infrastructure::HttpClientConfig;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Deserializer};

use crate::device::SensorConfig;

use super::FlowError;

const API_KEY_HEADER: &str = "X-API-KEY";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ROOT_CA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDevice {
    #[serde(deserialize_with = "string_or_number")]
    pub serial_number: String,
    #[serde(rename = "type", deserialize_with = "string_or_number")]
    pub device_type: String,
    #[serde(default)]
    pub room: Option<Room>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub house: Option<House>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct House {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmartHomeCapabilities {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCertificates {
    pub certificate_pem: String,
    pub private_key: String,
}

impl fmt::Debug for DeviceCertificates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCertificates")
            .field("certificate_pem", &self.certificate_pem)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct DeviceListResponse {
    #[serde(default)]
    data: Vec<ApiDevice>,
}

#[derive(Deserialize)]
struct DeviceTypeResponse {
    #[serde(default)]
    measurements: Option<DeviceTypeMeasurements>,
}

#[derive(Deserialize)]
struct DeviceTypeMeasurements {
    #[serde(default, rename = "smartHome")]
    smart_home: Option<SmartHomeCapabilities>,
}

#[derive(Debug, Clone)]
pub struct LmtApiClient {
    client: ClientWithMiddleware,
    base_url: String,
}

impl LmtApiClient {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let client = HttpClientConfig::with_api_key(API_KEY_HEADER, api_key)
            .new_tracing_client()
            .context("Error creating LMT API client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_devices(&self) -> Result<Vec<ApiDevice>, FlowError> {
        let response = self
            .client
            .get(format!("{}/devices?limit=50", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(FlowError::from_middleware)?;

        check_status(response.status(), false)?;

        let devices = response
            .json::<DeviceListResponse>()
            .await
            .map_err(|e| FlowError::from_transport(&e))?;

        tracing::debug!("API returned {} device(s)", devices.data.len());
        Ok(devices.data)
    }

    /// Smart-home capabilities of a device type, `None` if the type could not be looked up.
    #[tracing::instrument(skip(self))]
    pub async fn get_device_type(&self, device_type: &str) -> Result<Option<SmartHomeCapabilities>, FlowError> {
        let response = self
            .client
            .get(format!("{}/devices/types/{}", self.base_url, device_type))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(FlowError::from_middleware)?;

        if response.status().as_u16() >= 300 {
            tracing::warn!("Lookup of device type {} failed with status {}", device_type, response.status());
            return Ok(None);
        }

        let type_data = response
            .json::<DeviceTypeResponse>()
            .await
            .map_err(|e| FlowError::from_transport(&e))?;

        Ok(Some(
            type_data
                .measurements
                .and_then(|m| m.smart_home)
                .unwrap_or_default(),
        ))
    }

    #[tracing::instrument(skip(self))]
    pub async fn request_certificates(&self, device_id: &str) -> Result<DeviceCertificates, FlowError> {
        let response = self
            .client
            .post(format!("{}/devices/{}/certificates", self.base_url, device_id))
            .json(&serde_json::json!({ "target": "SMART_HOME" }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(FlowError::from_middleware)?;

        check_status(response.status(), true)?;

        response
            .json::<DeviceCertificates>()
            .await
            .map_err(|e| FlowError::from_transport(&e))
    }
}

/// Downloads the broker's root CA, falling back to the bundled copy on any failure.
pub async fn download_root_ca(url: &str) -> String {
    tracing::info!("Downloading root CA certificate from {}", url);

    match fetch_pem(url).await {
        Ok(pem) => pem,
        Err(e) => {
            tracing::error!("Failed to download root CA: {:?}", e);
            tracing::warn!("Using bundled Amazon Root CA 1 certificate");
            AMAZON_ROOT_CA_1.to_owned()
        }
    }
}

async fn fetch_pem(url: &str) -> anyhow::Result<String> {
    let client = HttpClientConfig::new().new_tracing_client()?;

    let response = client.get(url).timeout(ROOT_CA_TIMEOUT).send().await?;
    tracing::info!("Root CA download status: {}", response.status());

    let pem = response.error_for_status()?.text().await?;
    anyhow::ensure!(pem.contains("BEGIN CERTIFICATE"), "Response is not a PEM certificate");

    Ok(pem)
}

fn check_status(status: StatusCode, device_scoped: bool) -> Result<(), FlowError> {
    match status.as_u16() {
        401 => Err(FlowError::InvalidApiKey),
        403 => Err(FlowError::InsufficientPermissions),
        404 if device_scoped => Err(FlowError::DeviceNotFound),
        code if code >= 500 => Err(FlowError::ServerError),
        code if code >= 400 => Err(FlowError::ApiError),
        _ => Ok(()),
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(serde_json::Number),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}

pub const AMAZON_ROOT_CA_1: &str = "-----BEGIN CERTIFICATE-----
MIIDQTCCAimgAwIBAgITBmyfz5m/jAo54vB4ikPmljZbyjANBgkqhkiG9w0BAQsF
ADA5MQswCQYDVQQGEwJVUzEPMA0GA1UEChMGQW1hem9uMRkwFwYDVQQDExBBbWF6
b24gUm9vdCBDQSAxMB4XDTE1MDUyNjAwMDAwMFoXDTM4MDExNzAwMDAwMFowOTEL
MAkGA1UEBhMCVVMxDzANBgNVBAoTBkFtYXpvbjEZMBcGA1UEAxMQQW1hem9uIFJv
b3QgQ0EgMTCCASIwDQYJKoZIhvcNAQEBBQADggEPADCCAQoCggEBALJ4gHHKeNXj
ca9HgFB0fW7Y14h29Jlo91ghYPl0hAEvrAIthtOgQ3pOsqTQNroBvo3bSMgHFzZM
9O6II8c+6zf1tRn4SWiw3te5djgdYZ6k/oI2peVKVuRF4fn9tBb6dNqcmzU5L/qw
IFAGbHrQgLKm+a/sRxmPUDgH3KKHOVj4utWp+UhnMJbulHheb4mjUcAwhmahRWa6
VOujw5H5SNz/0egwLX0tdHA114gk957EWW67c4cX8jJGKLhD+rcdqsq08p8kDi1L
93FcXmn/6pUCyziKrlA4b9v7LWIbxcceVOF34GfID5yHI9Y/QCB/IIDEgEw+OyQm
jgSubJrIqg0CAwEAAaNCMEAwDwYDVR0TAQH/BAUwAwEB/zAOBgNVHQ8BAf8EBAMC
AYYwHQYDVR0OBBYEFIQYzIU07LwMlJQuCFmcx7IQTgoIMA0GCSqGSIb3DQEBCwUA
A4IBAQCY8jdaQZChGsV2USggNiMOruYou6r4lK5IpDB/G/wkjUu0yKGX9rbxenDI
U5PMCCjjmCXPI6T53iHTfIuJruydjsw2hUwsOjsQl/8gDHmG5Oq14cNA4+7QKj2V
11RUYfXTpz0AhHsHnoDcTDMxnpXb78ieQw2E+MPWbbWmXw/VWJJwpxn4OkqNGpF8
ShQl5Z6psk4ajJaGSiJOrM8fDS8acDRRVCs0Uc7pmAoTGnHXXXO2VEA5Y9Xig3CH
82o9RpR1BSiMDx0GXEcSUk1EZfFDgqSWjOhK1J8Z4jNVrqI1qbFff3RHksVK1EPe
OAD0C/X7RxbAnp/XDjgA+RFrOO/r
-----END CERTIFICATE-----
";
