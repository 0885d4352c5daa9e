use thiserror::Error;

use crate::zone::{SectionId, ZoneId};

/// Errors raised by the zone table, allocator and correlation engine.
///
/// Every variant describes input that was rejected before any state was
/// mutated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ZonewatchError {
    #[error("zone table is empty")]
    EmptyZoneTable,

    #[error("zone {zone} has an inverted section range {min}..={max}")]
    InvalidSectionRange {
        zone: ZoneId,
        min: SectionId,
        max: SectionId,
    },

    #[error("zone {zone} has an inverted temperature range {min}..{max}")]
    InvalidTemperatureRange { zone: ZoneId, min: f64, max: f64 },

    #[error("duplicate zone id {0}")]
    DuplicateZone(ZoneId),

    #[error("section {section} is claimed by zone {first} and zone {second}")]
    OverlappingSection {
        section: SectionId,
        first: ZoneId,
        second: ZoneId,
    },

    #[error("zone {zone} reaches section {max}, above the limit of {limit}")]
    SectionLimit {
        zone: ZoneId,
        max: SectionId,
        limit: SectionId,
    },

    #[error("section {0} is not covered by any zone")]
    SectionGap(SectionId),

    #[error("unknown zone {0}")]
    UnknownZone(ZoneId),

    #[error("unknown section {0}")]
    UnknownSection(SectionId),

    #[error("section {section} does not belong to zone {zone}")]
    SectionOutsideZone { zone: ZoneId, section: SectionId },

    #[error(
        "device {device} is allocated to zone {zone}/section {section}, not the reported location"
    )]
    AllocationMismatch {
        device: String,
        zone: ZoneId,
        section: SectionId,
    },

    #[error("malformed telemetry payload: {0}")]
    MalformedTelemetry(String),

    #[error("history capacity must be greater than zero")]
    ZeroCapacity,
}

pub type Result<T> = std::result::Result<T, ZonewatchError>;
