//! Section allocator.
//!
//! Hands out sections round-robin to registering devices and tracks which
//! devices are still reporting. Each zone's allocation list sits behind its own
//! mutex; the registration cursor has a separate mutex that is always taken
//! before any zone mutex.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, ZonewatchError};
use crate::zone::{SectionId, TemperatureRange, ZoneId, ZoneTable};

/// How far a telemetry report's self-declared location is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustPolicy {
    /// Zone/section are taken as reported.
    #[default]
    Trusting,
    /// Reports that contradict an existing allocation are rejected.
    Verified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default = "default_liveness_ttl")]
    pub liveness_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub trust: TrustPolicy,
}

fn default_liveness_ttl() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    5
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            liveness_ttl_secs: default_liveness_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            trust: TrustPolicy::default(),
        }
    }
}

impl AllocatorConfig {
    pub fn liveness_ttl(&self) -> Duration {
        Duration::from_secs(self.liveness_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Registration reply, shaped the way devices expect it:
/// `{"id", "zone": {"id", "section", "temperature": {"min", "max"}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(rename = "id")]
    pub device_id: String,
    pub zone: AssignedZone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedZone {
    pub id: ZoneId,
    pub section: SectionId,
    pub temperature: TemperatureRange,
}

#[derive(Debug, Clone)]
struct Allocation {
    device_id: String,
    section: SectionId,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct ZoneAllocations {
    allocations: Vec<Allocation>,
    amount: usize,
}

/// What `touch` did with a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    Refreshed,
    Inserted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SweepReport {
    pub evicted: usize,
    pub live: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationView {
    pub device_id: String,
    pub section: SectionId,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneOccupancy {
    pub zone: ZoneId,
    pub amount: usize,
    pub allocations: Vec<AllocationView>,
}

pub struct SectionAllocator {
    zones: Arc<ZoneTable>,
    lists: Vec<Mutex<ZoneAllocations>>,
    cursor: Mutex<usize>,
    config: AllocatorConfig,
}

impl SectionAllocator {
    pub fn new(zones: Arc<ZoneTable>, config: AllocatorConfig) -> Self {
        let lists = zones
            .zones()
            .iter()
            .map(|_| Mutex::new(ZoneAllocations::default()))
            .collect();
        Self {
            zones,
            lists,
            cursor: Mutex::new(0),
            config,
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn zones(&self) -> &Arc<ZoneTable> {
        &self.zones
    }

    /// Registration cursor; equal to the live allocation count after a sweep.
    pub fn allocated_count(&self) -> usize {
        *lock(&self.cursor)
    }

    pub fn register(&self) -> Result<Assignment> {
        self.register_at(Instant::now())
    }

    pub fn register_at(&self, now: Instant) -> Result<Assignment> {
        let mut cursor = lock(&self.cursor);
        let max_section = self.zones.max_section() as usize;
        let section = ((*cursor % max_section) + 1) as SectionId;
        let zone = self.zones.zone_for_section(section)?;
        let idx = self.zones.zone_index(zone.id)?;

        let device_id = Uuid::new_v4().to_string();
        {
            let mut list = lock(&self.lists[idx]);
            list.allocations.push(Allocation {
                device_id: device_id.clone(),
                section,
                last_seen: now,
            });
            list.amount += 1;
        }
        *cursor += 1;

        debug!(
            device_id = %device_id,
            zone = zone.id,
            section = section,
            "Device registered"
        );

        Ok(Assignment {
            device_id,
            zone: AssignedZone {
                id: zone.id,
                section,
                temperature: zone.temperature,
            },
        })
    }

    pub fn touch(&self, device_id: &str, zone: ZoneId, section: SectionId) -> Result<TouchOutcome> {
        self.touch_at(device_id, zone, section, Instant::now())
    }

    /// Checks a report against the zone table and, under the verified policy,
    /// against the current allocations. Nothing is recorded.
    pub fn validate(&self, device_id: &str, zone: ZoneId, section: SectionId) -> Result<()> {
        self.zones.locate(zone, section)?;
        if self.config.trust == TrustPolicy::Verified {
            let lists = self.lock_all();
            self.verify_location(&lists, device_id, zone, section)?;
        }
        Ok(())
    }

    /// Refreshes (or records) the device's allocation in the reported zone.
    pub fn touch_at(
        &self,
        device_id: &str,
        zone: ZoneId,
        section: SectionId,
        now: Instant,
    ) -> Result<TouchOutcome> {
        self.zones.locate(zone, section)?;
        let idx = self.zones.zone_index(zone)?;

        match self.config.trust {
            TrustPolicy::Trusting => {
                let mut list = lock(&self.lists[idx]);
                Ok(record_touch(&mut list, device_id, zone, section, now))
            }
            TrustPolicy::Verified => {
                // all zones stay locked from the check to the insert
                let mut lists = self.lock_all();
                self.verify_location(&lists, device_id, zone, section)?;
                Ok(record_touch(&mut lists[idx], device_id, zone, section, now))
            }
        }
    }

    /// Locks every zone list in table order.
    fn lock_all(&self) -> Vec<MutexGuard<'_, ZoneAllocations>> {
        self.lists.iter().map(lock).collect()
    }

    fn verify_location(
        &self,
        lists: &[MutexGuard<'_, ZoneAllocations>],
        device_id: &str,
        zone: ZoneId,
        section: SectionId,
    ) -> Result<()> {
        for (owner, list) in self.zones.zones().iter().zip(lists) {
            let Some(allocation) = list
                .allocations
                .iter()
                .find(|allocation| allocation.device_id == device_id)
            else {
                continue;
            };
            if owner.id != zone || allocation.section != section {
                warn!(
                    device_id = %device_id,
                    reported_zone = zone,
                    reported_section = section,
                    zone = owner.id,
                    section = allocation.section,
                    "Report contradicts allocation"
                );
                return Err(ZonewatchError::AllocationMismatch {
                    device: device_id.to_string(),
                    zone: owner.id,
                    section: allocation.section,
                });
            }
            return Ok(());
        }
        Ok(())
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Drops allocations idle for at least the TTL and recomputes the counts.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let ttl = self.config.liveness_ttl();
        let mut cursor = lock(&self.cursor);
        let mut report = SweepReport::default();

        for list in &self.lists {
            let mut list = lock(list);
            let before = list.allocations.len();
            list.allocations
                .retain(|allocation| now.saturating_duration_since(allocation.last_seen) < ttl);
            list.amount = list.allocations.len();
            report.evicted += before - list.amount;
            report.live += list.amount;
        }
        *cursor = report.live;

        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                live = report.live,
                "Liveness sweep evicted stale devices"
            );
        }
        report
    }

    pub fn snapshot(&self) -> Vec<ZoneOccupancy> {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Vec<ZoneOccupancy> {
        self.zones
            .zones()
            .iter()
            .zip(&self.lists)
            .map(|(zone, list)| {
                let list = lock(list);
                ZoneOccupancy {
                    zone: zone.id,
                    amount: list.amount,
                    allocations: list
                        .allocations
                        .iter()
                        .map(|allocation| AllocationView {
                            device_id: allocation.device_id.clone(),
                            section: allocation.section,
                            idle_ms: now.saturating_duration_since(allocation.last_seen).as_millis()
                                as u64,
                        })
                        .collect(),
                }
            })
            .collect()
    }
}

fn record_touch(
    list: &mut ZoneAllocations,
    device_id: &str,
    zone: ZoneId,
    section: SectionId,
    now: Instant,
) -> TouchOutcome {
    if let Some(existing) = list
        .allocations
        .iter_mut()
        .find(|allocation| allocation.device_id == device_id)
    {
        existing.last_seen = now;
        return TouchOutcome::Refreshed;
    }

    list.allocations.push(Allocation {
        device_id: device_id.to_string(),
        section,
        last_seen: now,
    });
    list.amount += 1;
    debug!(
        device_id = %device_id,
        zone = zone,
        section = section,
        "Unregistered device observed"
    );
    TouchOutcome::Inserted
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Allocator mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}
