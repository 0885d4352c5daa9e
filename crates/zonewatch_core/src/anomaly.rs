use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correlation::{CorrelationReason, CorrelationResult};
use crate::telemetry::{FaultType, TelemetryEvent};
use crate::zone::{SectionId, ZoneId};

/// Persisted projection of a rejected event and the check that caught it.
///
/// Append-only: records are written once and never read back by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub device_id: String,
    pub zone: ZoneId,
    pub section: SectionId,
    /// Reporting mode claimed by the device, if any.
    pub fault_type: Option<FaultType>,
    pub invalid: bool,
    pub reason: CorrelationReason,
    pub deviation_percent: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub recorded_at: DateTime<Utc>,
}

impl AnomalyRecord {
    pub fn from_rejection(event: &TelemetryEvent, result: &CorrelationResult) -> Self {
        Self {
            device_id: event.device_id.clone(),
            zone: event.zone,
            section: event.section,
            fault_type: event.fault_type,
            invalid: event.invalid,
            reason: result.reason,
            deviation_percent: result.deviation_percent,
            temperature: event.sample.temperature,
            humidity: event.sample.humidity,
            recorded_at: Utc::now(),
        }
    }
}
