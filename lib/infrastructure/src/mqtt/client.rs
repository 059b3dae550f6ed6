use std::{sync::Arc, time::Duration};

#[cfg(any(test, feature = "test-util"))]
use rumqttc::v5::Request;
use rumqttc::v5::{
    AsyncClient, Event, EventLoop, MqttOptions,
    mqttbytes::{
        QoS,
        v5::{ConnAck, ConnectProperties, LastWill, Packet, Publish},
    },
};
use tokio::sync::mpsc;

use super::*;

/// Connection to the local broker. Incoming messages are routed to subscribers by topic filter.
pub struct Mqtt {
    client: Arc<AsyncClient>,
    event_loop: EventLoop,
    subscriptions: Vec<Subscription>,
    connected_before: bool,
}

struct Subscription {
    filter: String,
    txs: Vec<mpsc::Sender<MqttInMessage>>,
}

impl Mqtt {
    pub fn connect(
        host: &str,
        port: u16,
        client_id: &str,
        credentials: Option<(&str, &str)>,
        will: Option<MqttWill>,
    ) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(false);

        if let Some((username, password)) = credentials {
            options.set_credentials(username, password);
        }

        if let Some(will) = will {
            options.set_last_will(LastWill::new(will.topic, will.payload, QoS::AtLeastOnce, true, None));
        }

        let mut connect_props = ConnectProperties::new();
        connect_props.session_expiry_interval = Some(60);
        connect_props.max_packet_size = Some(1024 * 1024);
        options.set_connect_properties(connect_props);

        let (client, event_loop) = AsyncClient::new(options, 32);

        Mqtt {
            client: Arc::new(client),
            event_loop,
            subscriptions: vec![],
            connected_before: false,
        }
    }

    pub async fn subscribe(&mut self, topic: impl Into<String>) -> anyhow::Result<MqttSubscription> {
        self.subscribe_all(&[topic.into()]).await
    }

    pub async fn subscribe_all(&mut self, filters: &[String]) -> anyhow::Result<MqttSubscription> {
        let (tx, rx) = mpsc::channel::<MqttInMessage>(32);

        for filter in filters {
            if let Some(subscription) = self.subscriptions.iter_mut().find(|s| s.filter == *filter) {
                tracing::debug!("Adding subscriber to existing subscription {}", filter);
                subscription.txs.push(tx.clone());
                continue;
            }

            tracing::info!("Subscribing to {}", filter);
            self.client.subscribe(filter.clone(), QoS::AtLeastOnce).await?;

            self.subscriptions.push(Subscription {
                filter: filter.clone(),
                txs: vec![tx.clone()],
            });
        }

        Ok(MqttSubscription::new(rx))
    }

    pub fn sender(&self) -> MqttSender {
        MqttSender::new(self.client.clone())
    }

    pub async fn run(mut self) {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(publish).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    self.handle_connected(ack).await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Connection to local MQTT broker failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_connected(&mut self, ack: ConnAck) {
        tracing::info!("Connected to local MQTT broker (session present: {})", ack.session_present);

        //a new session on reconnect has lost all subscriptions
        if self.connected_before && !ack.session_present {
            for subscription in self.subscriptions.iter() {
                tracing::info!("Resubscribing to {}", subscription.filter);
                if let Err(e) = self.client.subscribe(subscription.filter.clone(), QoS::AtLeastOnce).await {
                    tracing::error!("Error resubscribing to {}: {}", subscription.filter, e);
                }
            }
        }

        self.connected_before = true;
    }

    async fn handle_publish(&self, publish: Publish) {
        match MqttInMessage::try_from(&publish) {
            Ok(msg) => self.dispatch(msg).await,
            Err(e) => tracing::error!("Error decoding MQTT message: {}", e),
        }
    }

    async fn dispatch(&self, msg: MqttInMessage) {
        tracing::trace!("Received MQTT message on topic {}", msg.topic);

        for subscription in self.subscriptions.iter().filter(|s| topic_matches(&s.filter, &msg.topic)) {
            for tx in subscription.txs.iter() {
                if let Err(e) = tx.send_timeout(msg.clone(), Duration::from_secs(5)).await {
                    tracing::error!("Failed to forward MQTT message of {}: {}", subscription.filter, e);
                }
            }
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Mqtt {
    /// Messages published through this client so far. Works without a broker connection.
    pub fn take_published(&mut self) -> Vec<MqttInMessage> {
        self.take_requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::Publish(publish) => MqttInMessage::try_from(&publish).ok(),
                _ => None,
            })
            .collect()
    }

    /// Hands a message to the subscribers as if the broker had sent it.
    pub async fn deliver(&self, topic: &str, payload: &str) {
        self.dispatch(MqttInMessage {
            topic: topic.to_owned(),
            payload: payload.to_owned(),
        })
        .await;
    }

    fn take_requests(&mut self) -> Vec<Request> {
        self.event_loop.clean();
        self.event_loop.pending.drain(..).collect()
    }
}

fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
