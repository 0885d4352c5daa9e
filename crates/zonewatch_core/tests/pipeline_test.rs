//! End-to-end behaviour of the allocator and correlation engine together.

use std::sync::Arc;
use std::thread;

use zonewatch_core::{
    CorrelationConfig, CorrelationEngine, CorrelationReason, FaultType, SectionAllocator,
    TelemetryEvent, TemperatureSample, Verdict, ZoneTable,
};

fn engine(window_capacity: usize) -> CorrelationEngine {
    CorrelationEngine::new(
        Arc::new(ZoneTable::reference()),
        CorrelationConfig {
            window_capacity,
            ..CorrelationConfig::default()
        },
    )
    .unwrap()
}

fn reading(section: u32, temperature: f64) -> TelemetryEvent {
    TelemetryEvent::new("device", 2, section, TemperatureSample::new(temperature, 45.0))
}

/// Three 50.0 readings fill the window; an 80.0 reading is then caught.
#[test]
fn warm_up_then_rejection() {
    let engine = engine(3);
    let mut records = Vec::new();

    for temperature in [50.0, 50.0, 50.0, 80.0] {
        if let Verdict::Rejected(record) = engine.process(&reading(5, temperature)).unwrap() {
            records.push(record);
        }
    }

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.temperature, 80.0);
    assert!((record.deviation_percent - 60.0).abs() < 1e-9);
    // only section 5 has history, so the zone-wide baseline is also 50.0 and
    // the zone-wide stage is the one that fires
    assert_eq!(record.reason, CorrelationReason::NotWithinZone);

    let history = engine.history().snapshot(5).unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|sample| sample.temperature == 50.0));
}

/// A reading that agrees with the zone but not with its own section.
#[test]
fn own_section_rejection_behind_a_consistent_zone() {
    let engine = engine(6);
    for _ in 0..3 {
        assert!(engine.process(&reading(5, 50.0)).unwrap().is_accepted());
        assert!(engine.process(&reading(6, 110.0)).unwrap().is_accepted());
    }

    match engine.process(&reading(5, 80.0)).unwrap() {
        Verdict::Rejected(record) => {
            assert_eq!(record.reason, CorrelationReason::NotWithinZoneSection);
            assert!((record.deviation_percent - 60.0).abs() < 1e-9);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

/// Flagged-invalid readings that pass every check are accepted, with no record.
#[test]
fn flagged_reading_within_tolerance_is_missed() {
    let engine = engine(50);
    for _ in 0..5 {
        engine.process(&reading(7, 45.0)).unwrap();
    }
    let verdict = engine
        .process(&reading(7, 46.0).with_fault(FaultType::Flux))
        .unwrap();
    assert_eq!(
        verdict,
        Verdict::Accepted {
            validated: true,
            missed_invalid: true
        }
    );
    assert_eq!(engine.history().section_len(7).unwrap(), 6);
}

/// Zones decide in parallel; each section keeps its own arrival order.
#[test]
fn parallel_zones_keep_per_section_order() {
    let zones = Arc::new(ZoneTable::reference());
    let engine = Arc::new(
        CorrelationEngine::new(
            Arc::clone(&zones),
            CorrelationConfig {
                window_capacity: 10,
                // wide limits so the ramp is never rejected
                zone_deviation_limit: 1_000.0,
                section_deviation_limit: 1_000.0,
            },
        )
        .unwrap(),
    );

    let handles: Vec<_> = zones
        .zones()
        .iter()
        .cloned()
        .map(|zone| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for step in 0..40 {
                    for section in zone.sections.iter() {
                        let event = TelemetryEvent::new(
                            format!("z{}", zone.id),
                            zone.id,
                            section,
                            TemperatureSample::new(100.0 + step as f64, 0.0),
                        );
                        assert!(engine.process(&event).unwrap().is_accepted());
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for section in 1..=zones.max_section() {
        let temps: Vec<f64> = engine
            .history()
            .snapshot(section)
            .unwrap()
            .iter()
            .map(|sample| sample.temperature)
            .collect();
        let expected: Vec<f64> = (30..40).map(|step| 100.0 + step as f64).collect();
        assert_eq!(temps, expected, "section {section}");
    }
    assert_eq!(engine.history().total_samples(), 36 * 10);
}

/// Registered devices report from their assigned location and stay live.
#[test]
fn registration_feeds_reports() {
    let zones = Arc::new(ZoneTable::reference());
    let allocator = SectionAllocator::new(Arc::clone(&zones), Default::default());
    let engine = engine(50);

    for _ in 0..72 {
        let assignment = allocator.register().unwrap();
        let band = assignment.zone.temperature;
        let event = TelemetryEvent::new(
            assignment.device_id.clone(),
            assignment.zone.id,
            assignment.zone.section,
            TemperatureSample::new((band.min + band.max) / 2.0, 50.0),
        );
        allocator
            .touch(&event.device_id, event.zone, event.section)
            .unwrap();
        assert!(engine.process(&event).unwrap().is_accepted());
    }

    assert_eq!(allocator.allocated_count(), 72);
    assert_eq!(allocator.sweep().live, 72);
    for section in 1..=36 {
        assert_eq!(engine.history().section_len(section).unwrap(), 2);
    }
}
