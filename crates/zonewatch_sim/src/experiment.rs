//! Offline detection experiment.
//!
//! Registers a fleet of simulated devices with a [`SectionAllocator`], feeds
//! their readings straight into a [`CorrelationEngine`] tick by tick and
//! tallies, per reporting mode, how many readings were caught or missed.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use zonewatch_core::{
    AllocatorConfig, CorrelationConfig, CorrelationEngine, FaultType, SectionAllocator, Verdict,
    ZoneTable,
};

use crate::device::{DeviceProfile, SimDevice};

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub devices: usize,
    pub ticks: usize,
    pub seed: u64,
    pub correlation: CorrelationConfig,
    pub profile: DeviceProfile,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            devices: 36,
            ticks: 200,
            seed: 42,
            correlation: CorrelationConfig::default(),
            profile: DeviceProfile::default(),
        }
    }
}

/// Outcome counts for one reporting mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultTally {
    pub sent: u64,
    /// Invalid readings rejected.
    pub caught: u64,
    /// Invalid readings accepted.
    pub missed: u64,
    /// Valid readings rejected.
    pub false_positives: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TallyRow {
    pub fault_type: FaultType,
    pub sent: u64,
    pub caught: u64,
    pub missed: u64,
    pub false_positives: u64,
    pub detection_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentReport {
    pub tallies: BTreeMap<&'static str, (FaultType, FaultTally)>,
}

impl ExperimentReport {
    fn record(&mut self, fault: FaultType, invalid: bool, rejected: bool) {
        let (_, tally) = self
            .tallies
            .entry(fault.as_str())
            .or_insert((fault, FaultTally::default()));
        tally.sent += 1;
        match (invalid, rejected) {
            (true, true) => tally.caught += 1,
            (true, false) => tally.missed += 1,
            (false, true) => tally.false_positives += 1,
            (false, false) => {}
        }
    }

    pub fn tally(&self, fault: FaultType) -> FaultTally {
        self.tallies
            .get(fault.as_str())
            .map(|(_, tally)| *tally)
            .unwrap_or_default()
    }

    pub fn total(&self) -> FaultTally {
        self.tallies
            .values()
            .fold(FaultTally::default(), |mut acc, (_, tally)| {
                acc.sent += tally.sent;
                acc.caught += tally.caught;
                acc.missed += tally.missed;
                acc.false_positives += tally.false_positives;
                acc
            })
    }

    pub fn rows(&self) -> Vec<TallyRow> {
        self.tallies
            .values()
            .map(|(fault, tally)| {
                let invalid = tally.caught + tally.missed;
                TallyRow {
                    fault_type: *fault,
                    sent: tally.sent,
                    caught: tally.caught,
                    missed: tally.missed,
                    false_positives: tally.false_positives,
                    detection_rate: if invalid == 0 {
                        0.0
                    } else {
                        tally.caught as f64 / invalid as f64
                    },
                }
            })
            .collect()
    }

    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in self.rows() {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub fn run_experiment(config: &ExperimentConfig) -> anyhow::Result<ExperimentReport> {
    let zones = Arc::new(ZoneTable::reference());
    let allocator = SectionAllocator::new(Arc::clone(&zones), AllocatorConfig::default());
    let engine = CorrelationEngine::new(Arc::clone(&zones), config.correlation.clone())?;

    let mut devices = (0..config.devices)
        .map(|i| {
            let assignment = allocator.register()?;
            let rng = StdRng::seed_from_u64(config.seed.wrapping_add(i as u64));
            Ok(SimDevice::new(assignment, config.profile, rng))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut report = ExperimentReport::default();
    for _ in 0..config.ticks {
        for device in devices.iter_mut() {
            let event = device.next_reading();
            allocator.touch(&event.device_id, event.zone, event.section)?;
            let rejected = matches!(engine.process(&event)?, Verdict::Rejected(_));
            report.record(device.fault(), event.invalid, rejected);
        }
    }

    let total = report.total();
    info!(
        devices = config.devices,
        ticks = config.ticks,
        sent = total.sent,
        caught = total.caught,
        missed = total.missed,
        false_positives = total.false_positives,
        "Experiment finished"
    );
    Ok(report)
}
