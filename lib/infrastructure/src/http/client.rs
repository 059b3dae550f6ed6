use reqwest::header::{self, HeaderMap, HeaderName};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_tracing::TracingMiddleware;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    api_key_header: Option<String>,
    api_key: Option<String>,
}

impl HttpClientConfig {
    pub fn new() -> Self {
        Self {
            api_key_header: None,
            api_key: None,
        }
    }

    pub fn with_api_key(header: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_key_header: Some(header.into()),
            api_key: Some(api_key.into()),
        }
    }

    pub fn new_tracing_client(&self) -> anyhow::Result<ClientWithMiddleware> {
        let mut headers = HeaderMap::new();

        if let (Some(name), Some(key)) = (&self.api_key_header, &self.api_key) {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            let mut value = header::HeaderValue::from_str(key)?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder().default_headers(headers).build()?;

        Ok(reqwest_middleware::ClientBuilder::new(client)
            .with(TracingMiddleware::default())
            .build())
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self::new()
    }
}
