use std::collections::HashMap;

use futures::StreamExt;
use infrastructure::EventListener;
use tokio_util::{
    sync::CancellationToken,
    time::{DelayQueue, delay_queue},
};

use crate::telemetry::UplinkEvent;

use super::{SensorEntity, StateStore};

/// Writes sensor updates to wherever the sensors are exposed.
pub trait SensorStatePublisher {
    async fn publish_state(&self, sensor: &SensorEntity) -> anyhow::Result<()>;
    async fn publish_availability(&self, sensor: &SensorEntity) -> anyhow::Result<()>;
}

pub struct SensorRunner<P: SensorStatePublisher> {
    sensors: Vec<SensorEntity>,
    listener: EventListener<UplinkEvent>,
    publisher: P,
    states: StateStore,
    timeouts: DelayQueue<usize>,
    timeout_keys: HashMap<usize, delay_queue::Key>,
}

impl<P: SensorStatePublisher> SensorRunner<P> {
    pub fn new(
        sensors: Vec<SensorEntity>,
        listener: EventListener<UplinkEvent>,
        publisher: P,
        states: StateStore,
    ) -> Self {
        Self {
            sensors,
            listener,
            publisher,
            states,
            timeouts: DelayQueue::new(),
            timeout_keys: HashMap::new(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        self.restore().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = self.listener.recv() => match event {
                    Some(event) => self.handle_uplink(event).await,
                    None => break,
                },

                Some(expired) = self.timeouts.next() => {
                    self.handle_timeout(expired.into_inner()).await;
                }
            }
        }

        self.save_states();
        tracing::info!("Sensor runner stopped");
    }

    async fn restore(&mut self) {
        for sensor in self.sensors.iter_mut() {
            tracing::info!("Setting up sensor: {} (unique_id: {})", sensor.name, sensor.unique_id);

            let last_state = self.states.get(&sensor.unique_id).map(|s| s.state.as_str());
            sensor.restore(last_state);
        }

        for sensor in self.sensors.iter() {
            self.publish(sensor).await;
        }
    }

    async fn handle_uplink(&mut self, event: UplinkEvent) {
        let mut updated = vec![];

        for (index, sensor) in self.sensors.iter_mut().enumerate() {
            if sensor.apply(&event.device_id, &event.payload) {
                updated.push(index);
            }
        }

        if updated.is_empty() {
            return;
        }

        for index in updated {
            self.schedule_timeout(index);

            let sensor = &self.sensors[index];
            self.states.record(&sensor.unique_id, sensor.state());
            self.publish(sensor).await;
        }

        self.save_states();
    }

    async fn handle_timeout(&mut self, index: usize) {
        self.timeout_keys.remove(&index);

        let Some(sensor) = self.sensors.get_mut(index) else {
            return;
        };

        sensor.mark_unavailable();
        self.states.record(&sensor.unique_id, sensor.state());

        let sensor = &self.sensors[index];
        if let Err(e) = self.publisher.publish_availability(sensor).await {
            tracing::error!("Error publishing availability of {}: {:?}", sensor.unique_id, e);
        }

        self.save_states();
    }

    fn schedule_timeout(&mut self, index: usize) {
        let timeout = self.sensors[index].availability_timeout;

        match self.timeout_keys.get(&index) {
            Some(key) => self.timeouts.reset(key, timeout),
            None => {
                let key = self.timeouts.insert(index, timeout);
                self.timeout_keys.insert(index, key);
            }
        }
    }

    async fn publish(&self, sensor: &SensorEntity) {
        if let Err(e) = self.publisher.publish_availability(sensor).await {
            tracing::error!("Error publishing availability of {}: {:?}", sensor.unique_id, e);
        }

        //without a value this clears the retained state of the previous run
        if let Err(e) = self.publisher.publish_state(sensor).await {
            tracing::error!("Error publishing state of {}: {:?}", sensor.unique_id, e);
        }
    }

    fn save_states(&self) {
        if let Err(e) = self.states.save() {
            tracing::error!("Error saving sensor states: {:?}", e);
        }
    }
}
