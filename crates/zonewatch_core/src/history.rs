//! Bounded per-section sample history.
//!
//! Every section owns a FIFO of recently accepted samples behind its own
//! `RwLock`. A decision for one event locks all sections of the event's zone in
//! ascending section order (write for the event's own section, read for the
//! rest); the fixed order keeps concurrent decisions deadlock-free.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use crate::error::{Result, ZonewatchError};
use crate::telemetry::TemperatureSample;
use crate::zone::{SectionId, Zone};

#[derive(Debug, Clone)]
pub struct SectionHistory {
    samples: VecDeque<TemperatureSample>,
    capacity: usize,
}

impl SectionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample, returning the evicted oldest sample when full.
    pub fn push(&mut self, sample: TemperatureSample) -> Option<TemperatureSample> {
        self.samples.push_back(sample);
        if self.samples.len() > self.capacity {
            self.samples.pop_front()
        } else {
            None
        }
    }

    /// Mean temperature, `None` while empty.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(|s| s.temperature).sum();
        Some(sum / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&TemperatureSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TemperatureSample> {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<TemperatureSample> {
        self.samples.iter().copied().collect()
    }
}

/// One history per section, pre-allocated for sections `1..=max_section`.
#[derive(Debug)]
pub struct HistoryStore {
    sections: Vec<RwLock<SectionHistory>>,
    total: AtomicUsize,
    capacity: usize,
}

impl HistoryStore {
    pub fn new(max_section: SectionId, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ZonewatchError::ZeroCapacity);
        }
        let sections = (0..max_section)
            .map(|_| RwLock::new(SectionHistory::new(capacity)))
            .collect();
        Ok(Self {
            sections,
            total: AtomicUsize::new(0),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Number of samples currently held across every section.
    pub fn total_samples(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn snapshot(&self, section: SectionId) -> Result<Vec<TemperatureSample>> {
        Ok(read_section(self.slot(section)?).to_vec())
    }

    pub fn section_len(&self, section: SectionId) -> Result<usize> {
        Ok(read_section(self.slot(section)?).len())
    }

    pub fn section_mean(&self, section: SectionId) -> Result<Option<f64>> {
        Ok(read_section(self.slot(section)?).mean())
    }

    /// Locks every section of `zone`, holding `section` for writing.
    pub fn lock_zone(&self, zone: &Zone, section: SectionId) -> Result<ZoneGuard<'_>> {
        if !zone.sections.contains(section) {
            return Err(ZonewatchError::SectionOutsideZone {
                zone: zone.id,
                section,
            });
        }

        let mut own = None;
        let mut neighbours = Vec::with_capacity(zone.sections.len().saturating_sub(1));
        for current in zone.sections.iter() {
            let slot = self.slot(current)?;
            if current == section {
                own = Some(write_section(slot));
            } else {
                neighbours.push(read_section(slot));
            }
        }

        let own = own.ok_or(ZonewatchError::UnknownSection(section))?;
        Ok(ZoneGuard {
            section,
            own,
            neighbours,
            total: &self.total,
        })
    }

    fn slot(&self, section: SectionId) -> Result<&RwLock<SectionHistory>> {
        section
            .checked_sub(1)
            .and_then(|idx| self.sections.get(idx as usize))
            .ok_or(ZonewatchError::UnknownSection(section))
    }
}

fn read_section(lock: &RwLock<SectionHistory>) -> RwLockReadGuard<'_, SectionHistory> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("Section history lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn write_section(lock: &RwLock<SectionHistory>) -> RwLockWriteGuard<'_, SectionHistory> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("Section history lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Consistent view of one zone's histories for a single decision.
pub struct ZoneGuard<'a> {
    section: SectionId,
    own: RwLockWriteGuard<'a, SectionHistory>,
    neighbours: Vec<RwLockReadGuard<'a, SectionHistory>>,
    total: &'a AtomicUsize,
}

impl ZoneGuard<'_> {
    pub fn section(&self) -> SectionId {
        self.section
    }

    pub fn own(&self) -> &SectionHistory {
        &self.own
    }

    /// Mean of the per-section means over every non-empty section of the zone.
    pub fn zone_baseline(&self) -> Option<f64> {
        let means: Vec<f64> = std::iter::once(&*self.own)
            .chain(self.neighbours.iter().map(|guard| &**guard))
            .filter_map(SectionHistory::mean)
            .collect();
        if means.is_empty() {
            return None;
        }
        Some(means.iter().sum::<f64>() / means.len() as f64)
    }

    pub fn section_baseline(&self) -> Option<f64> {
        self.own.mean()
    }

    /// Appends to the locked section and keeps the global sample count in step.
    pub fn append(&mut self, sample: TemperatureSample) {
        if self.own.push(sample).is_none() {
            self.total.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::ZoneTable;
    use std::sync::Arc;

    fn sample(t: f64) -> TemperatureSample {
        TemperatureSample::new(t, 0.0)
    }

    #[test]
    fn section_history_evicts_oldest() {
        let mut history = SectionHistory::new(3);
        assert_eq!(history.mean(), None);
        for t in [1.0, 2.0, 3.0] {
            assert_eq!(history.push(sample(t)), None);
        }
        assert_eq!(history.push(sample(4.0)), Some(sample(1.0)));
        assert_eq!(history.len(), 3);
        assert_eq!(history.latest(), Some(&sample(4.0)));
        assert_eq!(history.mean(), Some(3.0));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            HistoryStore::new(36, 0).unwrap_err(),
            ZonewatchError::ZeroCapacity
        );
    }

    #[test]
    fn total_tracks_appends_but_not_evictions() {
        let table = ZoneTable::reference();
        let store = HistoryStore::new(table.max_section(), 2).unwrap();
        let zone = table.zone(2).unwrap();
        for t in [10.0, 20.0, 30.0] {
            store.lock_zone(zone, 5).unwrap().append(sample(t));
        }
        store.lock_zone(zone, 6).unwrap().append(sample(40.0));
        assert_eq!(store.total_samples(), 3);
        assert_eq!(store.snapshot(5).unwrap(), vec![sample(20.0), sample(30.0)]);
    }

    #[test]
    fn zone_baseline_is_mean_of_section_means() {
        let table = ZoneTable::reference();
        let store = HistoryStore::new(table.max_section(), 10).unwrap();
        let zone = table.zone(2).unwrap();
        for t in [10.0, 20.0, 30.0] {
            store.lock_zone(zone, 5).unwrap().append(sample(t));
        }
        store.lock_zone(zone, 9).unwrap().append(sample(40.0));

        let guard = store.lock_zone(zone, 12).unwrap();
        // (20 + 40) / 2, the empty section 12 does not count
        assert_eq!(guard.zone_baseline(), Some(30.0));
        assert_eq!(guard.section_baseline(), None);
    }

    #[test]
    fn other_zones_do_not_leak_into_baseline() {
        let table = ZoneTable::reference();
        let store = HistoryStore::new(table.max_section(), 10).unwrap();
        store
            .lock_zone(table.zone(1).unwrap(), 1)
            .unwrap()
            .append(sample(55.0));
        let guard = store.lock_zone(table.zone(2).unwrap(), 5).unwrap();
        assert_eq!(guard.zone_baseline(), None);
    }

    #[test]
    fn lock_zone_validates_section() {
        let table = ZoneTable::reference();
        let store = HistoryStore::new(table.max_section(), 10).unwrap();
        assert!(matches!(
            store.lock_zone(table.zone(1).unwrap(), 5),
            Err(ZonewatchError::SectionOutsideZone { zone: 1, section: 5 })
        ));
        assert_eq!(
            store.snapshot(0).unwrap_err(),
            ZonewatchError::UnknownSection(0)
        );
        assert_eq!(
            store.snapshot(37).unwrap_err(),
            ZonewatchError::UnknownSection(37)
        );
    }

    #[test]
    fn concurrent_writers_in_one_zone_do_not_deadlock() {
        let table = Arc::new(ZoneTable::reference());
        let store = Arc::new(HistoryStore::new(table.max_section(), 50).unwrap());

        let handles: Vec<_> = (5..=16)
            .map(|section| {
                let table = Arc::clone(&table);
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let zone = table.zone(2).unwrap();
                    for i in 0..25 {
                        let mut guard = store.lock_zone(zone, section).unwrap();
                        let _ = guard.zone_baseline();
                        guard.append(sample(i as f64));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.total_samples(), 12 * 25);
        for section in 5..=16 {
            assert_eq!(store.section_len(section).unwrap(), 25);
        }
    }
}
