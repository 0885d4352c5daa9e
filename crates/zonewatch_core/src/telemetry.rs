use serde::{Deserialize, Serialize};

use crate::error::{Result, ZonewatchError};
use crate::zone::{SectionId, ZoneId};

/// A single temperature/humidity reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSample {
    pub temperature: f64,
    pub humidity: f64,
}

impl TemperatureSample {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature,
            humidity,
        }
    }
}

/// Reporting mode of the producing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultType {
    Real,
    Dead,
    TooLow,
    TooHigh,
    Flux,
    EveryOther,
}

impl FaultType {
    /// Modes a healthy device can fall into.
    pub const FAULTS: [FaultType; 5] = [
        FaultType::Dead,
        FaultType::TooLow,
        FaultType::TooHigh,
        FaultType::Flux,
        FaultType::EveryOther,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultType::Real => "REAL",
            FaultType::Dead => "DEAD",
            FaultType::TooLow => "TOO_LOW",
            FaultType::TooHigh => "TOO_HIGH",
            FaultType::Flux => "FLUX",
            FaultType::EveryOther => "EVERY_OTHER",
        }
    }
}

impl std::fmt::Display for FaultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telemetry as produced by a device.
///
/// Field names follow the device wire format:
/// `{"id", "zone", "section", "invalid", "type", "temperature": {"temperature", "humidity"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "id")]
    pub device_id: String,
    pub zone: ZoneId,
    pub section: SectionId,
    #[serde(rename = "temperature")]
    pub sample: TemperatureSample,
    #[serde(default)]
    pub invalid: bool,
    #[serde(rename = "type", default)]
    pub fault_type: Option<FaultType>,
}

impl TelemetryEvent {
    pub fn new(
        device_id: impl Into<String>,
        zone: ZoneId,
        section: SectionId,
        sample: TemperatureSample,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            zone,
            section,
            sample,
            invalid: false,
            fault_type: None,
        }
    }

    /// Marks the event as deliberately faulty.
    pub fn with_fault(mut self, fault: FaultType) -> Self {
        self.invalid = fault != FaultType::Real;
        self.fault_type = Some(fault);
        self
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ZonewatchError::MalformedTelemetry(e.to_string()))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_wire_format() {
        let body = br#"{
            "temperature": {"temperature": 44.12, "humidity": 51.3},
            "zone": 2,
            "section": 7,
            "id": "dev-7",
            "invalid": true,
            "type": "TOO_HIGH"
        }"#;
        let event = TelemetryEvent::from_slice(body).unwrap();
        assert_eq!(event.device_id, "dev-7");
        assert_eq!(event.zone, 2);
        assert_eq!(event.section, 7);
        assert_eq!(event.sample, TemperatureSample::new(44.12, 51.3));
        assert!(event.invalid);
        assert_eq!(event.fault_type, Some(FaultType::TooHigh));
    }

    #[test]
    fn optional_fields_default() {
        let body =
            br#"{"id":"a","zone":1,"section":1,"temperature":{"temperature":1.0,"humidity":2.0}}"#;
        let event = TelemetryEvent::from_slice(body).unwrap();
        assert!(!event.invalid);
        assert_eq!(event.fault_type, None);

        let body = br#"{"id":"a","zone":1,"section":1,"type":null,
            "temperature":{"temperature":1.0,"humidity":2.0}}"#;
        assert_eq!(TelemetryEvent::from_slice(body).unwrap().fault_type, None);
    }

    #[test]
    fn garbage_is_malformed() {
        let negative_zone: &[u8] =
            br#"{"id":"a","zone":-1,"section":1,"temperature":{"temperature":1,"humidity":1}}"#;
        for body in [&b"not json"[..], br#"{"id":"a"}"#, negative_zone] {
            assert!(matches!(
                TelemetryEvent::from_slice(body),
                Err(ZonewatchError::MalformedTelemetry(_))
            ));
        }
    }

    #[test]
    fn real_mode_is_not_invalid() {
        let event = TelemetryEvent::new("d", 1, 1, TemperatureSample::new(1.0, 1.0));
        assert!(!event.clone().with_fault(FaultType::Real).invalid);
        assert!(event.with_fault(FaultType::Dead).invalid);
    }
}
