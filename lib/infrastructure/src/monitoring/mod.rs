pub mod meter;

use std::time::Duration;

use anyhow::Context as _;
use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::{
    Resource,
    logs::SdkLoggerProvider,
    metrics::{PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    trace::SdkTracerProvider,
};
use serde::Deserialize;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub logs: LogConfig,
    pub otlp: Option<OtlpConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub default_level: String,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub json: bool,
}

/// Export of traces, logs and metrics to an OpenTelemetry collector.
#[derive(Debug, Clone, Deserialize)]
pub struct OtlpConfig {
    pub url: String,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

fn default_service_name() -> String {
    "lmt-iot-bridge".to_owned()
}

fn default_level() -> String {
    "info".to_owned()
}

fn default_metrics_interval_secs() -> u64 {
    30
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logs: LogConfig::default(),
            otlp: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: default_level(),
            filters: vec![],
            json: false,
        }
    }
}

impl MonitoringConfig {
    pub fn init(&self) -> anyhow::Result<()> {
        let mut layers = vec![self.logs.fmt_layer()?];

        if let Some(otlp) = &self.otlp {
            opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
            layers.extend(otlp.layers(&self.service_name, &self.logs)?);
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .context("Error installing tracing subscriber")?;

        if let Some(otlp) = &self.otlp {
            tracing::info!("Exporting telemetry to {}", otlp.url);
        }

        Ok(())
    }
}

impl LogConfig {
    fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        let filter = EnvFilter::builder()
            .with_default_directive(self.default_level.parse()?)
            .parse(self.filters.join(","))?;
        Ok(filter)
    }

    fn fmt_layer(&self) -> anyhow::Result<BoxedLayer> {
        let filter = self.env_filter()?;

        let layer = if self.json {
            tracing_subscriber::fmt::layer().json().with_filter(filter).boxed()
        } else {
            tracing_subscriber::fmt::layer().with_filter(filter).boxed()
        };

        Ok(layer)
    }
}

impl OtlpConfig {
    fn layers(&self, service_name: &str, logs: &LogConfig) -> anyhow::Result<Vec<BoxedLayer>> {
        let resource = Resource::builder()
            .with_attribute(KeyValue::new("service.name", service_name.to_owned()))
            .build();

        let tracer_provider = self.tracer_provider(resource.clone())?;
        let tracer = tracer_provider.tracer(service_name.to_owned());
        opentelemetry::global::set_tracer_provider(tracer_provider);

        opentelemetry::global::set_meter_provider(self.meter_provider(resource.clone())?);

        let logger_provider = self.logger_provider(resource)?;

        Ok(vec![
            OpenTelemetryLayer::new(tracer).with_filter(logs.env_filter()?).boxed(),
            OpenTelemetryTracingBridge::new(&logger_provider)
                .with_filter(logs.env_filter()?)
                .boxed(),
        ])
    }

    fn tracer_provider(&self, resource: Resource) -> anyhow::Result<SdkTracerProvider> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&self.url)
            .build()?;

        Ok(SdkTracerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(exporter)
            .build())
    }

    fn meter_provider(&self, resource: Resource) -> anyhow::Result<SdkMeterProvider> {
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(&self.url)
            .build()?;

        let reader = PeriodicReader::builder(exporter)
            .with_interval(Duration::from_secs(self.metrics_interval_secs))
            .build();

        Ok(SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource)
            .build())
    }

    fn logger_provider(&self, resource: Resource) -> anyhow::Result<SdkLoggerProvider> {
        let exporter = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(&self.url)
            .build()?;

        Ok(SdkLoggerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(exporter)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_config(default_level: &str, filters: &[&str]) -> LogConfig {
        LogConfig {
            default_level: default_level.to_owned(),
            filters: filters.iter().map(|f| f.to_string()).collect(),
            json: false,
        }
    }

    #[test]
    fn env_filter_from_default_level_and_directives() {
        let config = log_config("warn", &["lmt_iot_bridge=debug", "rumqttc=info"]);
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn invalid_directive_level_is_rejected() {
        let config = log_config("info", &["rumqttc=noisy"]);
        assert!(config.env_filter().is_err());
        assert!(config.fmt_layer().is_err());
    }

    #[test]
    fn json_log_layer() {
        let config = LogConfig {
            json: true,
            ..log_config("debug", &[])
        };
        assert!(config.fmt_layer().is_ok());
    }

    #[test]
    fn defaults_without_monitoring_section() {
        let config: MonitoringConfig = serde_json::from_str(r#"{"otlp": {"url": "http://collector:4317"}}"#).unwrap();

        assert_eq!(config.service_name, "lmt-iot-bridge");
        assert_eq!(config.logs.default_level, "info");
        assert!(!config.logs.json);
        assert_eq!(config.otlp.map(|o| o.metrics_interval_secs), Some(30));
    }
}
