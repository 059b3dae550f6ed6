use cached::proc_macro::cached;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Gauge},
};

const METER: &str = "lmt_iot";
const CLOUD_CONNECTED: &str = "lmt_cloud_connected";

/// What became of a message received from the device's telemetry topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UplinkOutcome {
    Received,
    Invalid,
    Ignored,
}

impl UplinkOutcome {
    fn metric_name(self) -> &'static str {
        match self {
            UplinkOutcome::Received => "lmt_uplink_received",
            UplinkOutcome::Invalid => "lmt_uplink_invalid",
            UplinkOutcome::Ignored => "lmt_uplink_ignored",
        }
    }
}

pub fn record_uplink(device_id: &str, outcome: UplinkOutcome) {
    uplink_counter(outcome).add(1, &[device(device_id)]);
}

/// 1 while the device's cloud session is up, 0 after it dropped.
pub fn record_cloud_connection(device_id: &str, connected: bool) {
    gauge(CLOUD_CONNECTED).record(u64::from(connected), &[device(device_id)]);
}

fn device(device_id: &str) -> KeyValue {
    KeyValue::new("device_id", device_id.to_owned())
}

#[cached]
fn uplink_counter(outcome: UplinkOutcome) -> Counter<u64> {
    opentelemetry::global::meter(METER)
        .u64_counter(outcome.metric_name())
        .build()
}

#[cached]
fn gauge(name: &'static str) -> Gauge<u64> {
    opentelemetry::global::meter(METER).u64_gauge(name).build()
}
