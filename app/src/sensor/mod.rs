mod runner;
mod state;

use std::{fmt, time::Duration};

use crate::{
    device::{DeviceEntry, SensorConfig},
    uplink::{MeasurementValue, Uplink},
};

pub use runner::{SensorRunner, SensorStatePublisher};
pub use state::StateStore;

const UNKNOWN_STATE: &str = "unknown";
const UNAVAILABLE_STATE: &str = "unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SensorStateClass {
    #[display("measurement")]
    Measurement,
    #[display("total")]
    Total,
    #[display("total_increasing")]
    TotalIncreasing,
}

impl SensorStateClass {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "measurement" => Some(Self::Measurement),
            "total" => Some(Self::Total),
            "total_increasing" => Some(Self::TotalIncreasing),
            other => {
                tracing::warn!("Unknown state class: {}", other);
                None
            }
        }
    }
}

const DEVICE_CLASSES: &[&str] = &[
    "apparent_power",
    "aqi",
    "area",
    "atmospheric_pressure",
    "battery",
    "blood_glucose_concentration",
    "carbon_dioxide",
    "carbon_monoxide",
    "conductivity",
    "current",
    "data_rate",
    "data_size",
    "date",
    "distance",
    "duration",
    "energy",
    "energy_distance",
    "energy_storage",
    "enum",
    "frequency",
    "gas",
    "humidity",
    "illuminance",
    "irradiance",
    "moisture",
    "monetary",
    "nitrogen_dioxide",
    "nitrogen_monoxide",
    "nitrous_oxide",
    "ozone",
    "ph",
    "pm1",
    "pm10",
    "pm25",
    "power",
    "power_factor",
    "precipitation",
    "precipitation_intensity",
    "pressure",
    "reactive_power",
    "signal_strength",
    "sound_pressure",
    "speed",
    "sulphur_dioxide",
    "temperature",
    "timestamp",
    "volatile_organic_compounds",
    "volatile_organic_compounds_parts",
    "voltage",
    "volume",
    "volume_flow_rate",
    "volume_storage",
    "water",
    "weight",
    "wind_direction",
    "wind_speed",
];

fn parse_device_class(value: &str) -> Option<String> {
    let value = value.to_lowercase();
    if DEVICE_CLASSES.contains(&value.as_str()) {
        Some(value)
    } else {
        tracing::warn!("Unknown device class: {}", value);
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Number(v) => write!(f, "{}", v),
            SensorValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<&MeasurementValue> for SensorValue {
    fn from(value: &MeasurementValue) -> Self {
        match value.as_f64() {
            Some(number) => SensorValue::Number(number),
            None => SensorValue::Text(value.to_string()),
        }
    }
}

/// One measurement of one device as exposed to Home Assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorEntity {
    pub device_id: String,
    pub key: String,
    pub name: String,
    pub unique_id: String,
    pub unit: Option<String>,
    pub state_class: Option<SensorStateClass>,
    pub device_class: Option<String>,
    pub availability_timeout: Duration,
    value: Option<SensorValue>,
    available: bool,
}

impl SensorEntity {
    pub fn new(device_id: &str, config: &SensorConfig) -> Self {
        Self {
            device_id: device_id.to_owned(),
            key: config.key.clone(),
            name: format!("{} {}", device_id, config.name),
            unique_id: format!("{}_{}", device_id, config.key),
            unit: config.unit.clone(),
            state_class: config.state_class.as_deref().and_then(SensorStateClass::parse),
            device_class: config.device_class.as_deref().and_then(parse_device_class),
            availability_timeout: config.availability_timeout(),
            value: None,
            available: true,
        }
    }

    pub fn for_entries(entries: &[DeviceEntry]) -> Vec<Self> {
        let sensors: Vec<Self> = entries
            .iter()
            .flat_map(|entry| entry.sensor_config.iter().map(|c| Self::new(&entry.device_id, c)))
            .collect();

        for entry in entries {
            tracing::info!(
                "Creating {} sensors for device {}",
                entry.sensor_config.len(),
                entry.device_id
            );
        }

        sensors
    }

    pub fn value(&self) -> Option<&SensorValue> {
        self.value.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// State as written to Home Assistant.
    pub fn state(&self) -> String {
        match (&self.value, self.available) {
            (_, false) => UNAVAILABLE_STATE.to_owned(),
            (Some(value), true) => value.to_string(),
            (None, true) => UNKNOWN_STATE.to_owned(),
        }
    }

    pub fn restore(&mut self, last_state: Option<&str>) {
        let last_state = match last_state {
            Some(state) if state != UNKNOWN_STATE && state != UNAVAILABLE_STATE => state,
            _ => {
                tracing::info!("No valid last state to restore for {}", self.name);
                return;
            }
        };

        if self.state_class.is_none() {
            self.value = Some(SensorValue::Text(last_state.to_owned()));
        } else {
            match last_state.trim().parse::<f64>() {
                Ok(number) => self.value = Some(SensorValue::Number(number)),
                Err(e) => {
                    tracing::warn!("Could not restore state for {}: {} - {}", self.name, last_state, e);
                    return;
                }
            }
        }

        tracing::info!("Restored {}: {}", self.name, last_state);
    }

    /// Takes over the value of this sensor if the uplink carries it.
    pub fn apply(&mut self, device_id: &str, uplink: &Uplink) -> bool {
        if device_id != self.device_id {
            return false;
        }

        let Some(value) = uplink.get(&self.key) else {
            return false;
        };

        self.value = Some(SensorValue::from(value));
        self.available = true;

        tracing::debug!(
            "{} updated: {}{}",
            self.name,
            self.state(),
            self.unit.as_deref().unwrap_or_default()
        );

        true
    }

    pub fn mark_unavailable(&mut self) {
        self.available = false;
        tracing::warn!(
            "{} marked unavailable (no data for {}s)",
            self.name,
            self.availability_timeout.as_secs()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::sensor;

    fn config(state_class: Option<&str>, device_class: Option<&str>) -> SensorConfig {
        SensorConfig {
            unit: Some("°C".to_owned()),
            state_class: state_class.map(str::to_owned),
            device_class: device_class.map(str::to_owned),
            availability_timeout: Some(600),
            ..sensor("TEMP", "Temperature")
        }
    }

    fn uplink(key: &str, value: MeasurementValue) -> Uplink {
        Uplink::from([(key.to_owned(), value)])
    }

    #[test]
    fn entity_from_config() {
        let entity = SensorEntity::new("X1", &config(Some("MEASUREMENT"), Some("Temperature")));

        assert_eq!(entity.name, "X1 Temperature");
        assert_eq!(entity.unique_id, "X1_TEMP");
        assert_eq!(entity.unit.as_deref(), Some("°C"));
        assert_eq!(entity.state_class, Some(SensorStateClass::Measurement));
        assert_eq!(entity.device_class.as_deref(), Some("temperature"));
        assert_eq!(entity.availability_timeout, Duration::from_secs(600));
        assert!(entity.is_available());
        assert_eq!(entity.state(), "unknown");
    }

    #[test]
    fn unknown_classes_are_ignored() {
        let entity = SensorEntity::new("X1", &config(Some("average"), Some("smokiness")));

        assert_eq!(entity.state_class, None);
        assert_eq!(entity.device_class, None);
    }

    #[test]
    fn default_availability_timeout() {
        let entity = SensorEntity::new("X1", &sensor("TEMP", "Temperature"));
        assert_eq!(entity.availability_timeout, Duration::from_secs(7200));
    }

    #[test]
    fn restores_number_with_state_class() {
        let mut entity = SensorEntity::new("X1", &config(Some("measurement"), None));
        entity.restore(Some("21.5"));
        assert_eq!(entity.value(), Some(&SensorValue::Number(21.5)));
    }

    #[test]
    fn restores_text_without_state_class() {
        let mut entity = SensorEntity::new("X1", &config(None, None));
        entity.restore(Some("OK"));
        assert_eq!(entity.value(), Some(&SensorValue::Text("OK".to_owned())));
    }

    #[test]
    fn does_not_restore_placeholders_or_garbage() {
        for last in [None, Some("unknown"), Some("unavailable"), Some("warm")] {
            let mut entity = SensorEntity::new("X1", &config(Some("measurement"), None));
            entity.restore(last);
            assert_eq!(entity.value(), None, "restored from {:?}", last);
        }
    }

    #[test]
    fn numeric_values_become_float() {
        let mut entity = SensorEntity::new("X1", &config(Some("measurement"), None));

        assert!(entity.apply("X1", &uplink("TEMP", MeasurementValue::Integer(21))));
        assert_eq!(entity.value(), Some(&SensorValue::Number(21.0)));
        assert_eq!(entity.state(), "21");
    }

    #[test]
    fn text_values_stay_text() {
        let mut entity = SensorEntity::new("X1", &sensor("SMOKE_STATUS", "Smoke"));

        assert!(entity.apply("X1", &uplink("SMOKE_STATUS", MeasurementValue::Text("OK".to_owned()))));
        assert_eq!(entity.state(), "OK");
    }

    #[test]
    fn ignores_other_devices_and_keys() {
        let mut entity = SensorEntity::new("X1", &config(Some("measurement"), None));

        assert!(!entity.apply("X2", &uplink("TEMP", MeasurementValue::Float(1.0))));
        assert!(!entity.apply("X1", &uplink("HUMIDITY", MeasurementValue::Float(1.0))));
        assert_eq!(entity.value(), None);
    }

    #[test]
    fn update_makes_sensor_available_again() {
        let mut entity = SensorEntity::new("X1", &config(Some("measurement"), None));
        entity.apply("X1", &uplink("TEMP", MeasurementValue::Float(20.0)));
        entity.mark_unavailable();
        assert_eq!(entity.state(), "unavailable");

        entity.apply("X1", &uplink("TEMP", MeasurementValue::Float(20.5)));
        assert!(entity.is_available());
        assert_eq!(entity.state(), "20.5");
    }
}
