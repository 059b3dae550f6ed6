use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use rumqttc::v5::{AsyncClient, mqttbytes::QoS};

//publishing waits for room in the request queue while the broker is unreachable
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct MqttSender {
    client: Arc<AsyncClient>,
}

impl MqttSender {
    pub(super) fn new(client: Arc<AsyncClient>) -> Self {
        Self { client }
    }

    /// Publishes with QoS 1, kept by the broker for late subscribers.
    #[tracing::instrument(skip_all, fields(topic = %topic.as_ref(), otel.name = format!("MQTT publish {}", topic.as_ref())))]
    pub async fn send_retained(&self, topic: impl AsRef<str>, payload: impl Into<String>) -> anyhow::Result<()> {
        let topic = topic.as_ref();
        let payload = payload.into();
        tracing::debug!("Publishing retained MQTT message to {}: {:?}", topic, payload);

        tokio::time::timeout(
            PUBLISH_TIMEOUT,
            self.client.publish(topic, QoS::AtLeastOnce, true, payload),
        )
        .await
        .with_context(|| format!("Timeout publishing MQTT message to {}", topic))?
        .with_context(|| format!("Error publishing MQTT message to {}", topic))
    }
}
