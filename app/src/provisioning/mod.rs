mod api;
mod flow;

pub use api::LmtApiClient;
pub use flow::{ProvisioningFlow, resolve_api_key};

/// Reasons a provisioning step can fail. `key()` is the stable identifier shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum FlowError {
    #[display("The API key was rejected")]
    InvalidApiKey,
    #[display("The API key lacks the required permissions")]
    InsufficientPermissions,
    #[display("Device not found")]
    DeviceNotFound,
    #[display("The LMT API reported a server error")]
    ServerError,
    #[display("The LMT API rejected the request")]
    ApiError,
    #[display("The LMT API did not respond in time")]
    Timeout,
    #[display("Could not connect to the LMT API")]
    ConnectionError,
    #[display("Unexpected error talking to the LMT API")]
    CannotConnect,
    #[display("No devices with smart home support found")]
    NoDevices,
    #[display("Device is already configured")]
    AlreadyConfigured,
    #[display("No API key given and none stored")]
    MissingApiKey,
}

impl FlowError {
    pub fn key(&self) -> &'static str {
        match self {
            FlowError::InvalidApiKey => "invalid_api_key",
            FlowError::InsufficientPermissions => "insufficient_permissions",
            FlowError::DeviceNotFound => "device_not_found",
            FlowError::ServerError => "server_error",
            FlowError::ApiError => "api_error",
            FlowError::Timeout => "timeout",
            FlowError::ConnectionError => "connection_error",
            FlowError::CannotConnect => "cannot_connect",
            FlowError::NoDevices => "no_devices",
            FlowError::AlreadyConfigured => "already_configured",
            FlowError::MissingApiKey => "missing_api_key",
        }
    }

    fn from_transport(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            FlowError::Timeout
        } else if e.is_decode() {
            tracing::error!("Invalid response from LMT API: {:?}", e);
            FlowError::CannotConnect
        } else {
            tracing::warn!("Error talking to LMT API: {:?}", e);
            FlowError::ConnectionError
        }
    }

    fn from_middleware(e: reqwest_middleware::Error) -> Self {
        match e {
            reqwest_middleware::Error::Reqwest(e) => Self::from_transport(&e),
            reqwest_middleware::Error::Middleware(e) => {
                tracing::error!("Error in LMT API request: {:?}", e);
                FlowError::CannotConnect
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_keys() {
        assert_eq!(FlowError::InvalidApiKey.key(), "invalid_api_key");
        assert_eq!(FlowError::NoDevices.key(), "no_devices");
        assert_eq!(FlowError::DeviceNotFound.to_string(), "Device not found");
    }
}
