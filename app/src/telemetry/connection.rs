use std::time::Duration;

use infrastructure::{
    EventEmitter,
    meter::{self, UplinkOutcome},
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    Transport,
};
use tokio_util::sync::CancellationToken;

use crate::{device::DeviceEntry, uplink::parse_uplink_message};

use super::UplinkEvent;

const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);
const MAX_PACKET_SIZE: usize = 256 * 1024;

pub fn telemetry_topic(device_id: &str) -> String {
    format!("things/{}/telemetry", device_id)
}

/// TLS mutual-auth MQTT session of one device with the cloud broker.
pub struct CloudConnection {
    device_id: String,
    endpoint: String,
    topic: String,
    client: AsyncClient,
    event_loop: EventLoop,
    emitter: EventEmitter<UplinkEvent>,
}

impl CloudConnection {
    pub fn new(entry: &DeviceEntry, emitter: EventEmitter<UplinkEvent>) -> Self {
        let mut options = MqttOptions::new(&entry.device_id, &entry.host, entry.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        //certificates are handed over in memory, nothing touches the disk
        options.set_transport(Transport::tls(
            entry.ca_cert.clone().into_bytes(),
            Some((entry.client_cert.clone().into_bytes(), entry.client_key.clone().into_bytes())),
            None,
        ));

        let (client, event_loop) = AsyncClient::new(options, 10);

        Self {
            device_id: entry.device_id.clone(),
            endpoint: format!("{}:{}", entry.host, entry.port),
            topic: telemetry_topic(&entry.device_id),
            client,
            event_loop,
            emitter,
        }
    }

    #[tracing::instrument(skip_all, fields(device_id = %self.device_id))]
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Connecting to {} as {}", self.endpoint, self.device_id);

        let mut reconnect_delay = MIN_RECONNECT_DELAY;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                    tracing::info!("Connected to LMT IoT Cloud");
                    reconnect_delay = MIN_RECONNECT_DELAY;
                    meter::record_cloud_connection(&self.device_id, true);
                    self.subscribe().await;
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    tracing::debug!("Subscription confirmed: pkid={}, codes={:?}", ack.pkid, ack.return_codes);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(publish);
                }
                Ok(_) => {}
                Err(e) => {
                    meter::record_cloud_connection(&self.device_id, false);

                    match &e {
                        ConnectionError::ConnectionRefused(code) => {
                            tracing::error!(
                                "Failed to connect to LMT IoT Cloud: {} ({:?})",
                                connect_result_name(*code),
                                code
                            );
                        }
                        _ => {
                            tracing::warn!(
                                "Disconnected from LMT IoT Cloud: {}, reconnecting in {}s",
                                e,
                                reconnect_delay.as_secs()
                            );
                        }
                    }

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }

                    reconnect_delay = next_reconnect_delay(reconnect_delay);
                }
            }
        }

        self.disconnect().await;
    }

    async fn subscribe(&self) {
        match self.client.subscribe(&self.topic, QoS::AtLeastOnce).await {
            Ok(()) => tracing::info!("Subscribed to topic: {}", self.topic),
            Err(e) => tracing::error!("Error subscribing to {}: {}", self.topic, e),
        }
    }

    fn handle_publish(&self, publish: Publish) {
        if let Some(event) = decode_publish(&self.device_id, &publish.topic, &publish.payload) {
            self.emitter.send(event);
        }
    }

    async fn disconnect(mut self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::warn!("Error requesting disconnect: {}", e);
            return;
        }

        //poll until the DISCONNECT packet left or the connection is gone
        let flushed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            tracing::warn!("Timeout while disconnecting from LMT IoT Cloud");
        } else {
            tracing::info!("Disconnected from LMT IoT Cloud");
        }
    }
}

fn decode_publish(device_id: &str, topic: &str, payload: &[u8]) -> Option<UplinkEvent> {
    meter::record_uplink(device_id, UplinkOutcome::Received);

    let json: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Error parsing message on {}: {}", topic, e);
            meter::record_uplink(device_id, UplinkOutcome::Invalid);
            return None;
        }
    };

    tracing::debug!("Received message on {}: {}", topic, json);

    match parse_uplink_message(&json) {
        Some(parsed) => {
            tracing::debug!("Parsed data: {:?}", parsed);
            Some(UplinkEvent {
                device_id: device_id.to_owned(),
                topic: topic.to_owned(),
                payload: parsed,
            })
        }
        None => {
            tracing::debug!("Message on {} contained no usable measurements", topic);
            meter::record_uplink(device_id, UplinkOutcome::Ignored);
            None
        }
    }
}

fn next_reconnect_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RECONNECT_DELAY)
}

fn connect_result_name(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "SUCCESS",
        ConnectReturnCode::RefusedProtocolVersion => "INCORRECT_PROTOCOL",
        ConnectReturnCode::BadClientId => "INVALID_CLIENT_ID",
        ConnectReturnCode::ServiceUnavailable => "SERVER_UNAVAILABLE",
        ConnectReturnCode::BadUserNamePassword => "BAD_CREDENTIALS",
        ConnectReturnCode::NotAuthorized => "NOT_AUTHORIZED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uplink::MeasurementValue;

    #[test]
    fn telemetry_topic_of_device() {
        assert_eq!(telemetry_topic("869999051234567"), "things/869999051234567/telemetry");
    }

    #[test]
    fn decodes_v2_payload() {
        let payload = br#"{"version":"V2","measurements":{"TEMP":[[0,"21.5"]]}}"#;

        let event = decode_publish("X1", "things/X1/telemetry", payload).unwrap();

        assert_eq!(event.device_id, "X1");
        assert_eq!(event.topic, "things/X1/telemetry");
        assert_eq!(event.payload.get("TEMP"), Some(&MeasurementValue::Float(21.5)));
    }

    #[test]
    fn invalid_json_is_dropped() {
        assert_eq!(decode_publish("X1", "things/X1/telemetry", b"{\"version\":"), None);
        assert_eq!(decode_publish("X1", "things/X1/telemetry", &[0xff, 0xfe]), None);
    }

    #[test]
    fn unusable_payload_is_dropped() {
        assert_eq!(decode_publish("X1", "things/X1/telemetry", br#"{"hello":"world"}"#), None);
    }

    #[test]
    fn reconnect_delay_doubles_up_to_limit() {
        let mut delay = MIN_RECONNECT_DELAY;
        let mut delays = vec![];
        for _ in 0..9 {
            delays.push(delay.as_secs());
            delay = next_reconnect_delay(delay);
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 120, 120]);
    }

    #[test]
    fn connect_result_names() {
        assert_eq!(connect_result_name(ConnectReturnCode::NotAuthorized), "NOT_AUTHORIZED");
        assert_eq!(connect_result_name(ConnectReturnCode::BadClientId), "INVALID_CLIENT_ID");
    }
}
