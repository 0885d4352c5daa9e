//! zonewatch core
//!
//! The two stateful engines of a zoned sensor network:
//!
//! * [`allocator::SectionAllocator`] hands out round-robin sections to devices and
//!   evicts registrations that stop reporting.
//! * [`correlation::CorrelationEngine`] keeps a bounded temperature history per
//!   section and decides whether each reading is consistent with its neighborhood
//!   before admitting it.
//!
//! Everything here is synchronous and guarded by std locks, so the crate can be
//! embedded in the async daemon and in the offline simulator alike.

pub mod allocator;
pub mod anomaly;
pub mod correlation;
pub mod error;
pub mod history;
pub mod telemetry;
pub mod zone;

pub use allocator::{
    AllocationView, AllocatorConfig, AssignedZone, Assignment, SectionAllocator, SweepReport,
    TouchOutcome, TrustPolicy, ZoneOccupancy,
};
pub use anomaly::AnomalyRecord;
pub use correlation::{
    CorrelationConfig, CorrelationEngine, CorrelationReason, CorrelationResult, Verdict,
};
pub use error::{Result, ZonewatchError};
pub use history::{HistoryStore, SectionHistory, ZoneGuard};
pub use telemetry::{FaultType, TelemetryEvent, TemperatureSample};
pub use zone::{MAX_SECTION, SectionId, SectionRange, TemperatureRange, Zone, ZoneId, ZoneTable};
