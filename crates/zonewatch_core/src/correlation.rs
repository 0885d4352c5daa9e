//! Correlation engine.
//!
//! Decides whether a reading is consistent with the recent history of its
//! zone and section. The pipeline runs three checks in a fixed order and stops
//! at the first failure:
//!
//! 1. touching-zone check (always passes, see [`TouchingZoneCheck`])
//! 2. zone-wide check against the mean of the zone's section means
//! 3. own-section check against the section's own mean
//!
//! The pipeline only runs for events flagged invalid by the producer, or once
//! the store as a whole holds `window_capacity` samples. Before that every
//! reading is accepted to seed the baselines.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::anomaly::AnomalyRecord;
use crate::error::Result;
use crate::history::{HistoryStore, ZoneGuard};
use crate::telemetry::{TelemetryEvent, TemperatureSample};
use crate::zone::ZoneTable;

/// Which check rejected a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrelationReason {
    None,
    WithinBoundingZones,
    NotWithinZone,
    NotWithinZoneSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub passed: bool,
    pub reason: CorrelationReason,
    pub deviation_percent: f64,
}

impl CorrelationResult {
    pub fn passed() -> Self {
        Self {
            passed: true,
            reason: CorrelationReason::None,
            deviation_percent: 0.0,
        }
    }

    pub fn failed(reason: CorrelationReason, deviation_percent: f64) -> Self {
        Self {
            passed: false,
            reason,
            deviation_percent,
        }
    }
}

/// Result of a single check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub deviation_percent: f64,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            deviation_percent: 0.0,
        }
    }

    /// Compares `value` to `baseline`; a missing baseline passes.
    ///
    /// A zero baseline gives a non-finite deviation, which never satisfies
    /// the limit.
    pub fn against(value: f64, baseline: Option<f64>, limit: f64) -> Self {
        match baseline {
            None => Self::pass(),
            Some(baseline) => {
                let deviation = deviation_percent(value, baseline);
                Self {
                    passed: deviation <= limit,
                    deviation_percent: deviation,
                }
            }
        }
    }
}

/// `|value / baseline - 1| * 100`
pub fn deviation_percent(value: f64, baseline: f64) -> f64 {
    ((value / baseline) - 1.0).abs() * 100.0
}

/// One stage of the validation pipeline.
pub trait CorrelationCheck: Send + Sync {
    /// Reason reported when this check fails.
    fn reason(&self) -> CorrelationReason;

    fn check(&self, view: &ZoneGuard<'_>, sample: &TemperatureSample) -> CheckOutcome;
}

/// Meant to catch a device whose readings sit closer to a neighbouring zone's
/// band than to its own. It has never compared anything and unconditionally
/// passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TouchingZoneCheck;

impl CorrelationCheck for TouchingZoneCheck {
    fn reason(&self) -> CorrelationReason {
        CorrelationReason::WithinBoundingZones
    }

    fn check(&self, _view: &ZoneGuard<'_>, _sample: &TemperatureSample) -> CheckOutcome {
        CheckOutcome::pass()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZoneWideCheck {
    pub limit: f64,
}

impl CorrelationCheck for ZoneWideCheck {
    fn reason(&self) -> CorrelationReason {
        CorrelationReason::NotWithinZone
    }

    fn check(&self, view: &ZoneGuard<'_>, sample: &TemperatureSample) -> CheckOutcome {
        CheckOutcome::against(sample.temperature, view.zone_baseline(), self.limit)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OwnSectionCheck {
    pub limit: f64,
}

impl CorrelationCheck for OwnSectionCheck {
    fn reason(&self) -> CorrelationReason {
        CorrelationReason::NotWithinZoneSection
    }

    fn check(&self, view: &ZoneGuard<'_>, sample: &TemperatureSample) -> CheckOutcome {
        CheckOutcome::against(sample.temperature, view.section_baseline(), self.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Per-section history capacity, also the warm-up threshold on the total
    /// number of stored samples.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Maximum deviation (percent) from the zone baseline.
    #[serde(default = "default_zone_limit")]
    pub zone_deviation_limit: f64,
    /// Maximum deviation (percent) from the section baseline.
    #[serde(default = "default_section_limit")]
    pub section_deviation_limit: f64,
}

fn default_window_capacity() -> usize {
    50
}

fn default_zone_limit() -> f64 {
    15.0
}

fn default_section_limit() -> f64 {
    12.5
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            zone_deviation_limit: default_zone_limit(),
            section_deviation_limit: default_section_limit(),
        }
    }
}

/// Outcome of processing one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Sample appended to its section history; forward downstream.
    Accepted {
        /// Whether the pipeline ran for this event.
        validated: bool,
        /// Flagged invalid by the producer yet passed every check.
        missed_invalid: bool,
    },
    /// Sample dropped; persist the record.
    Rejected(AnomalyRecord),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }
}

pub struct CorrelationEngine {
    zones: Arc<ZoneTable>,
    history: HistoryStore,
    checks: Vec<Box<dyn CorrelationCheck>>,
    config: CorrelationConfig,
}

impl CorrelationEngine {
    pub fn new(zones: Arc<ZoneTable>, config: CorrelationConfig) -> Result<Self> {
        let history = HistoryStore::new(zones.max_section(), config.window_capacity)?;
        let checks: Vec<Box<dyn CorrelationCheck>> = vec![
            Box::new(TouchingZoneCheck),
            Box::new(ZoneWideCheck {
                limit: config.zone_deviation_limit,
            }),
            Box::new(OwnSectionCheck {
                limit: config.section_deviation_limit,
            }),
        ];
        Ok(Self {
            zones,
            history,
            checks,
            config,
        })
    }

    pub fn zones(&self) -> &Arc<ZoneTable> {
        &self.zones
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Whether the pipeline runs for `event` given the current fill level.
    pub fn should_validate(&self, event: &TelemetryEvent) -> bool {
        event.invalid || self.history.total_samples() >= self.config.window_capacity
    }

    /// Runs the checks in order against a locked zone view.
    pub fn evaluate(&self, view: &ZoneGuard<'_>, sample: &TemperatureSample) -> CorrelationResult {
        for check in &self.checks {
            let outcome = check.check(view, sample);
            if !outcome.passed {
                return CorrelationResult::failed(check.reason(), outcome.deviation_percent);
            }
        }
        CorrelationResult::passed()
    }

    /// Decides one event and applies the history side of the decision.
    ///
    /// Fails only for an event whose zone/section is unknown or inconsistent
    /// with the zone table; nothing is mutated in that case.
    pub fn process(&self, event: &TelemetryEvent) -> Result<Verdict> {
        let zone = self.zones.locate(event.zone, event.section)?;
        let mut view = self.history.lock_zone(zone, event.section)?;

        let validated = self.should_validate(event);
        if validated {
            let result = self.evaluate(&view, &event.sample);
            if !result.passed {
                info!(
                    device_id = %event.device_id,
                    zone = event.zone,
                    section = event.section,
                    invalid = event.invalid,
                    fault_type = ?event.fault_type,
                    reason = ?result.reason,
                    deviation_percent = result.deviation_percent,
                    temperature = event.sample.temperature,
                    "Correlation check failed"
                );
                return Ok(Verdict::Rejected(AnomalyRecord::from_rejection(
                    event, &result,
                )));
            }
        }

        view.append(event.sample);
        debug!(
            device_id = %event.device_id,
            section = event.section,
            validated = validated,
            "Sample accepted"
        );

        Ok(Verdict::Accepted {
            validated,
            missed_invalid: validated && event.invalid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ZonewatchError;
    use crate::telemetry::FaultType;

    fn engine(capacity: usize) -> CorrelationEngine {
        CorrelationEngine::new(
            Arc::new(ZoneTable::reference()),
            CorrelationConfig {
                window_capacity: capacity,
                ..CorrelationConfig::default()
            },
        )
        .unwrap()
    }

    fn event(section: u32, temperature: f64) -> TelemetryEvent {
        let zone = ZoneTable::reference().zone_for_section(section).unwrap().id;
        TelemetryEvent::new(
            format!("dev-{section}"),
            zone,
            section,
            TemperatureSample::new(temperature, 40.0),
        )
    }

    fn seed(engine: &CorrelationEngine, section: u32, temperature: f64, count: usize) {
        for _ in 0..count {
            assert!(engine.process(&event(section, temperature)).unwrap().is_accepted());
        }
    }

    #[test]
    fn deviation_formula() {
        assert_eq!(deviation_percent(112.5, 100.0), 12.5);
        assert!((deviation_percent(80.0, 50.0) - 60.0).abs() < 1e-9);
        assert!((deviation_percent(116.0, 100.0) - 16.0).abs() < 1e-9);
        assert!((deviation_percent(84.0, 100.0) - 16.0).abs() < 1e-9);
        assert!(!deviation_percent(0.0, 0.0).is_finite());
    }

    #[test]
    fn check_outcome_boundaries() {
        assert!(!CheckOutcome::against(116.0, Some(100.0), 15.0).passed);
        let passing = CheckOutcome::against(114.0, Some(100.0), 15.0);
        assert!(passing.passed);
        assert!((passing.deviation_percent - 14.0).abs() < 1e-9);

        let boundary = CheckOutcome::against(112.5, Some(100.0), 12.5);
        assert!(boundary.passed);
        assert_eq!(boundary.deviation_percent, 12.5);
        assert!(!CheckOutcome::against(112.6, Some(100.0), 12.5).passed);

        assert_eq!(CheckOutcome::against(1e9, None, 0.0), CheckOutcome::pass());
        assert!(!CheckOutcome::against(0.0, Some(0.0), 15.0).passed);
        assert!(!CheckOutcome::against(5.0, Some(0.0), 15.0).passed);
    }

    #[test]
    fn first_sample_is_always_accepted() {
        let engine = engine(1);
        let wild = event(5, 1_000_000.0).with_fault(FaultType::TooHigh);
        assert_eq!(
            engine.process(&wild).unwrap(),
            Verdict::Accepted {
                validated: true,
                missed_invalid: true
            }
        );
        assert_eq!(engine.history().snapshot(5).unwrap().len(), 1);
    }

    #[test]
    fn warm_up_accepts_without_validation() {
        let engine = engine(3);
        seed(&engine, 5, 50.0, 1);
        assert_eq!(
            engine.process(&event(6, 500.0)).unwrap(),
            Verdict::Accepted {
                validated: false,
                missed_invalid: false
            }
        );
        assert_eq!(engine.history().total_samples(), 2);
    }

    #[test]
    fn invalid_events_are_validated_during_warm_up() {
        let engine = engine(50);
        seed(&engine, 5, 50.0, 2);
        let verdict = engine
            .process(&event(5, 0.0).with_fault(FaultType::Dead))
            .unwrap();
        match verdict {
            Verdict::Rejected(record) => {
                assert_eq!(record.reason, CorrelationReason::NotWithinZone);
                assert_eq!(record.deviation_percent, 100.0);
                assert_eq!(record.fault_type, Some(FaultType::Dead));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(engine.history().section_len(5).unwrap(), 2);
    }

    #[test]
    fn zone_wide_threshold() {
        let engine = engine(3);
        // zone baseline 100 from section 5, section 6 stays empty
        seed(&engine, 5, 100.0, 3);

        match engine.process(&event(6, 116.0)).unwrap() {
            Verdict::Rejected(record) => {
                assert_eq!(record.reason, CorrelationReason::NotWithinZone);
                assert!((record.deviation_percent - 16.0).abs() < 1e-9);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(engine.process(&event(6, 114.0)).unwrap().is_accepted());
    }

    #[test]
    fn own_section_threshold_is_inclusive() {
        let engine = engine(4);
        // sections 5 and 6 both at 100 keep the zone baseline at 100 while
        // section 5's own mean is what the last check sees
        seed(&engine, 5, 100.0, 2);
        seed(&engine, 6, 100.0, 2);

        assert!(engine.process(&event(5, 112.5)).unwrap().is_accepted());

        let engine = self::engine(4);
        seed(&engine, 5, 100.0, 2);
        seed(&engine, 6, 130.0, 2);
        // zone baseline 115 -> 112.6 is 2.1% off; section baseline 100 -> 12.6%
        match engine.process(&event(5, 112.6)).unwrap() {
            Verdict::Rejected(record) => {
                assert_eq!(record.reason, CorrelationReason::NotWithinZoneSection);
                assert!((record.deviation_percent - 12.6).abs() < 1e-9);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn rejected_samples_never_enter_history() {
        let engine = engine(3);
        seed(&engine, 5, 50.0, 3);
        let before = engine.history().snapshot(5).unwrap();

        let verdict = engine.process(&event(5, 80.0)).unwrap();
        match verdict {
            Verdict::Rejected(record) => {
                // the zone-wide check runs first and sees the same 50.0 baseline
                assert_eq!(record.reason, CorrelationReason::NotWithinZone);
                assert!((record.deviation_percent - 60.0).abs() < 1e-9);
                assert_eq!(record.temperature, 80.0);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(engine.history().snapshot(5).unwrap(), before);
        assert_eq!(engine.history().total_samples(), 3);
    }

    #[test]
    fn accepted_sample_lands_at_tail_and_capacity_holds() {
        let engine = engine(3);
        for t in [50.0, 51.0, 52.0, 53.0, 54.0] {
            assert!(engine.process(&event(5, t)).unwrap().is_accepted());
            let history = engine.history().snapshot(5).unwrap();
            assert_eq!(history.last().map(|s| s.temperature), Some(t));
            assert!(history.len() <= 3);
        }
        let temps: Vec<f64> = engine
            .history()
            .snapshot(5)
            .unwrap()
            .iter()
            .map(|s| s.temperature)
            .collect();
        assert_eq!(temps, vec![52.0, 53.0, 54.0]);
    }

    #[test]
    fn unknown_locations_do_not_mutate() {
        let engine = engine(3);
        let mut bad = event(5, 50.0);
        bad.zone = 1;
        assert!(matches!(
            engine.process(&bad),
            Err(ZonewatchError::SectionOutsideZone { zone: 1, section: 5 })
        ));
        bad.zone = 42;
        assert_eq!(engine.process(&bad), Err(ZonewatchError::UnknownZone(42)));
        assert_eq!(engine.history().total_samples(), 0);
    }

    #[test]
    fn touching_zone_check_always_passes() {
        let engine = engine(3);
        let zone = engine.zones().zone(1).unwrap();
        let view = engine.history().lock_zone(zone, 1).unwrap();
        let outcome = TouchingZoneCheck.check(&view, &TemperatureSample::new(-500.0, 0.0));
        assert_eq!(outcome, CheckOutcome::pass());
    }
}
