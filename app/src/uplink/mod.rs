mod value;

use std::collections::BTreeMap;

use serde_json::{Map, Value};

pub use value::MeasurementValue;

use value::{to_float, to_integer};

/// Decoded uplink: measurement name to its latest value.
pub type Uplink = BTreeMap<String, MeasurementValue>;

const SIGNAL_STRENGTH: &str = "SIGNAL_STRENGTH";

const V1_SERIES: [(&str, &str); 4] = [
    ("mTempData", "TEMPERATURE"),
    ("mHumidData", "HUMIDITY"),
    ("mCoData", "CO"),
    ("mIaqData", "IAQ"),
];

const SIGNAL_FIELDS: [(&str, &str); 3] = [("mRsrp", "RSRP"), ("mRsrq", "RSRQ"), ("mSinr", "SINR")];

/// Decodes a telemetry payload in either the keyed (`"version": "V2"`) or the legacy
/// nested-array format. Malformed fields are skipped; `None` means nothing usable was found.
pub fn parse_uplink_message(payload: &Value) -> Option<Uplink> {
    let payload = payload.as_object()?;

    if payload.get("version").and_then(Value::as_str) == Some("V2") {
        parse_v2_uplink(payload)
    } else if payload.contains_key("data") && payload.contains_key("msdInfoData") {
        parse_v1_uplink(payload)
    } else {
        None
    }
}

fn parse_v1_uplink(payload: &Map<String, Value>) -> Option<Uplink> {
    let data = payload.get("data")?.as_array()?;
    let server_identity = non_null(payload.get("msdInfoData")?.as_object()?.get("mServerIdentity"));

    //first match wins, other devices in the same report are ignored
    let device = data
        .iter()
        .filter_map(Value::as_object)
        .find(|device| same_serial(non_null(device.get("mSerial")), server_identity))?;

    let mut parsed = Uplink::new();

    for (field, name) in V1_SERIES {
        if let Some(value) = latest_series_value(device, field) {
            parsed.insert(name.to_owned(), value);
        }
    }

    if let Some(status) = device.get("mSmokeStatus") {
        parsed.insert(
            "SMOKE_STATUS".to_owned(),
            MeasurementValue::Text(smoke_status(status).to_owned()),
        );
    }

    for (field, name) in SIGNAL_FIELDS {
        if let Some(value) = non_null(device.get(field)).and_then(MeasurementValue::from_json) {
            parsed.insert(name.to_owned(), value);
        }
    }

    (!parsed.is_empty()).then_some(parsed)
}

fn parse_v2_uplink(payload: &Map<String, Value>) -> Option<Uplink> {
    let measurements = payload.get("measurements")?.as_object()?;

    let mut parsed = Uplink::new();

    for (key, samples) in measurements {
        let Some(sample) = samples.as_array().and_then(|s| s.last()).and_then(Value::as_array) else {
            continue;
        };

        if key == SIGNAL_STRENGTH {
            if sample.len() < 4 {
                continue;
            }

            for (index, name) in [(1, "RSRP"), (2, "RSRQ"), (3, "SINR")] {
                if let Some(value) = to_integer(&sample[index]) {
                    parsed.insert(name.to_owned(), MeasurementValue::Integer(value));
                }
            }
        } else if let Some(value) = sample.get(1).and_then(to_float) {
            parsed.insert(key.clone(), MeasurementValue::Float(value));
        }
    }

    (!parsed.is_empty()).then_some(parsed)
}

// data[field][0].mData[-1]
fn latest_series_value(device: &Map<String, Value>, field: &str) -> Option<MeasurementValue> {
    device
        .get(field)?
        .as_array()?
        .first()?
        .get("mData")?
        .as_array()?
        .last()
        .and_then(MeasurementValue::from_json)
}

fn smoke_status(status: &Value) -> &'static str {
    let code = match status {
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        _ => None,
    };

    match code {
        Some(0) => "OK",
        Some(1) => "WARNING",
        Some(2) => "ALARM",
        _ => "UNKNOWN",
    }
}

//numbers are equal by value, so 5 and 5.0 name the same device
fn same_serial(serial: Option<&Value>, identity: Option<&Value>) -> bool {
    match (serial, identity) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        (serial, identity) => serial == identity,
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}
