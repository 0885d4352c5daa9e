//! Static zone table.
//!
//! A zone owns a contiguous run of section numbers and an expected temperature
//! band. The table is validated once at load: the section ranges of all zones
//! must partition `1..=max_section` with no gaps and no overlaps.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ZonewatchError};

pub type ZoneId = u32;
pub type SectionId = u32;

/// Highest section number a zone table may use.
pub const MAX_SECTION: SectionId = 65_536;

/// Expected temperature band of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRange {
    pub min: f64,
    pub max: f64,
}

/// Inclusive range of section numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRange {
    pub min: SectionId,
    pub max: SectionId,
}

impl SectionRange {
    pub fn new(min: SectionId, max: SectionId) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, section: SectionId) -> bool {
        (self.min..=self.max).contains(&section)
    }

    pub fn len(&self) -> usize {
        (self.max - self.min + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.max < self.min
    }

    pub fn iter(&self) -> impl Iterator<Item = SectionId> {
        self.min..=self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub temperature: TemperatureRange,
    pub sections: SectionRange,
}

impl Zone {
    pub fn new(id: ZoneId, temperature: (f64, f64), sections: (SectionId, SectionId)) -> Self {
        Self {
            id,
            temperature: TemperatureRange {
                min: temperature.0,
                max: temperature.1,
            },
            sections: SectionRange::new(sections.0, sections.1),
        }
    }
}

/// Validated, immutable list of zones ordered by section range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Zone>", into = "Vec<Zone>")]
pub struct ZoneTable {
    zones: Vec<Zone>,
    max_section: SectionId,
}

impl ZoneTable {
    pub fn new(mut zones: Vec<Zone>) -> Result<Self> {
        if zones.is_empty() {
            return Err(ZonewatchError::EmptyZoneTable);
        }

        for (i, zone) in zones.iter().enumerate() {
            if zone.sections.min == 0 || zone.sections.is_empty() {
                return Err(ZonewatchError::InvalidSectionRange {
                    zone: zone.id,
                    min: zone.sections.min,
                    max: zone.sections.max,
                });
            }
            if zone.sections.max > MAX_SECTION {
                return Err(ZonewatchError::SectionLimit {
                    zone: zone.id,
                    max: zone.sections.max,
                    limit: MAX_SECTION,
                });
            }
            let band = zone.temperature;
            if !band.min.is_finite() || !band.max.is_finite() || band.min > band.max {
                return Err(ZonewatchError::InvalidTemperatureRange {
                    zone: zone.id,
                    min: band.min,
                    max: band.max,
                });
            }
            if zones[..i].iter().any(|other| other.id == zone.id) {
                return Err(ZonewatchError::DuplicateZone(zone.id));
            }
        }

        zones.sort_by_key(|zone| zone.sections.min);

        let mut expected: SectionId = 1;
        for (i, zone) in zones.iter().enumerate() {
            if zone.sections.min < expected {
                return Err(ZonewatchError::OverlappingSection {
                    section: zone.sections.min,
                    first: zones[i - 1].id,
                    second: zone.id,
                });
            }
            if zone.sections.min > expected {
                return Err(ZonewatchError::SectionGap(expected));
            }
            expected = zone
                .sections
                .max
                .checked_add(1)
                .ok_or(ZonewatchError::SectionLimit {
                    zone: zone.id,
                    max: zone.sections.max,
                    limit: MAX_SECTION,
                })?;
        }

        Ok(Self {
            max_section: expected - 1,
            zones,
        })
    }

    /// The three-zone, 36-section reference deployment.
    pub fn reference() -> Self {
        Self {
            zones: vec![
                Zone::new(1, (50.0, 60.0), (1, 4)),
                Zone::new(2, (40.0, 50.0), (5, 16)),
                Zone::new(3, (20.0, 40.0), (17, 36)),
            ],
            max_section: 36,
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn max_section(&self) -> SectionId {
        self.max_section
    }

    pub fn zone(&self, id: ZoneId) -> Result<&Zone> {
        self.zones
            .iter()
            .find(|zone| zone.id == id)
            .ok_or(ZonewatchError::UnknownZone(id))
    }

    /// Position of a zone in section order, used to index per-zone state.
    pub fn zone_index(&self, id: ZoneId) -> Result<usize> {
        self.zones
            .iter()
            .position(|zone| zone.id == id)
            .ok_or(ZonewatchError::UnknownZone(id))
    }

    pub fn zone_for_section(&self, section: SectionId) -> Result<&Zone> {
        if section == 0 || section > self.max_section {
            return Err(ZonewatchError::UnknownSection(section));
        }
        let idx = self
            .zones
            .partition_point(|zone| zone.sections.max < section);
        self.zones
            .get(idx)
            .ok_or(ZonewatchError::UnknownSection(section))
    }

    /// Validates a reported zone/section pair against the table.
    pub fn locate(&self, zone: ZoneId, section: SectionId) -> Result<&Zone> {
        let owner = self.zone(zone)?;
        if section == 0 || section > self.max_section {
            return Err(ZonewatchError::UnknownSection(section));
        }
        if !owner.sections.contains(section) {
            return Err(ZonewatchError::SectionOutsideZone { zone, section });
        }
        Ok(owner)
    }
}

impl Default for ZoneTable {
    fn default() -> Self {
        Self::reference()
    }
}

impl TryFrom<Vec<Zone>> for ZoneTable {
    type Error = ZonewatchError;

    fn try_from(zones: Vec<Zone>) -> Result<Self> {
        Self::new(zones)
    }
}

impl From<ZoneTable> for Vec<Zone> {
    fn from(table: ZoneTable) -> Self {
        table.zones
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reference_table_is_a_valid_partition() {
        let reference = ZoneTable::reference();
        let rebuilt = ZoneTable::new(reference.zones().to_vec()).unwrap();
        assert_eq!(rebuilt, reference);
        assert_eq!(rebuilt.max_section(), 36);
    }

    #[test]
    fn zone_for_section_follows_ranges() {
        let table = ZoneTable::reference();
        assert_eq!(table.zone_for_section(1).unwrap().id, 1);
        assert_eq!(table.zone_for_section(4).unwrap().id, 1);
        assert_eq!(table.zone_for_section(5).unwrap().id, 2);
        assert_eq!(table.zone_for_section(16).unwrap().id, 2);
        assert_eq!(table.zone_for_section(17).unwrap().id, 3);
        assert_eq!(table.zone_for_section(36).unwrap().id, 3);
        assert_eq!(
            table.zone_for_section(0),
            Err(ZonewatchError::UnknownSection(0))
        );
        assert_eq!(
            table.zone_for_section(37),
            Err(ZonewatchError::UnknownSection(37))
        );
    }

    #[test]
    fn locate_rejects_mismatched_pairs() {
        let table = ZoneTable::reference();
        assert!(table.locate(2, 7).is_ok());
        assert_eq!(table.locate(9, 7), Err(ZonewatchError::UnknownZone(9)));
        assert_eq!(
            table.locate(1, 7),
            Err(ZonewatchError::SectionOutsideZone {
                zone: 1,
                section: 7
            })
        );
        assert_eq!(table.locate(1, 40), Err(ZonewatchError::UnknownSection(40)));
    }

    #[test]
    fn gaps_and_overlaps_are_rejected() {
        let gap = ZoneTable::new(vec![
            Zone::new(1, (0.0, 1.0), (1, 4)),
            Zone::new(2, (0.0, 1.0), (6, 9)),
        ]);
        assert_eq!(gap, Err(ZonewatchError::SectionGap(5)));

        let overlap = ZoneTable::new(vec![
            Zone::new(1, (0.0, 1.0), (1, 4)),
            Zone::new(2, (0.0, 1.0), (4, 9)),
        ]);
        assert_eq!(
            overlap,
            Err(ZonewatchError::OverlappingSection {
                section: 4,
                first: 1,
                second: 2
            })
        );

        let late_start = ZoneTable::new(vec![Zone::new(1, (0.0, 1.0), (2, 4))]);
        assert_eq!(late_start, Err(ZonewatchError::SectionGap(1)));
    }

    #[test]
    fn malformed_zones_are_rejected() {
        assert_eq!(ZoneTable::new(vec![]), Err(ZonewatchError::EmptyZoneTable));
        assert_eq!(
            ZoneTable::new(vec![Zone::new(1, (0.0, 1.0), (3, 1))]),
            Err(ZonewatchError::InvalidSectionRange {
                zone: 1,
                min: 3,
                max: 1
            })
        );
        assert!(matches!(
            ZoneTable::new(vec![Zone::new(1, (9.0, 1.0), (1, 2))]),
            Err(ZonewatchError::InvalidTemperatureRange { zone: 1, .. })
        ));
        assert_eq!(
            ZoneTable::new(vec![
                Zone::new(1, (0.0, 1.0), (1, 2)),
                Zone::new(1, (0.0, 1.0), (3, 4)),
            ]),
            Err(ZonewatchError::DuplicateZone(1))
        );
    }

    #[test]
    fn oversized_tables_are_rejected() {
        assert_eq!(
            ZoneTable::new(vec![Zone::new(1, (0.0, 1.0), (1, u32::MAX))]),
            Err(ZonewatchError::SectionLimit {
                zone: 1,
                max: u32::MAX,
                limit: MAX_SECTION
            })
        );
        assert!(matches!(
            ZoneTable::new(vec![
                Zone::new(1, (0.0, 1.0), (1, MAX_SECTION)),
                Zone::new(2, (0.0, 1.0), (MAX_SECTION + 1, MAX_SECTION + 2)),
            ]),
            Err(ZonewatchError::SectionLimit { zone: 2, .. })
        ));
        let largest = ZoneTable::new(vec![Zone::new(1, (0.0, 1.0), (1, MAX_SECTION))]).unwrap();
        assert_eq!(largest.max_section(), MAX_SECTION);
    }

    #[test]
    fn unordered_input_is_sorted_by_section() {
        let table = ZoneTable::new(vec![
            Zone::new(7, (0.0, 1.0), (5, 8)),
            Zone::new(3, (0.0, 1.0), (1, 4)),
        ])
        .unwrap();
        let ids: Vec<ZoneId> = table.zones().iter().map(|z| z.id).collect();
        assert_eq!(ids, vec![3, 7]);
        assert_eq!(table.zone_index(7).unwrap(), 1);
    }

    #[test]
    fn toml_round_trip_validates() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            zones: ZoneTable,
        }

        let text = toml::to_string(&Wrapper {
            zones: ZoneTable::reference(),
        })
        .unwrap();
        let parsed: Wrapper = toml::from_str(&text).unwrap();
        assert_eq!(parsed.zones, ZoneTable::reference());

        let broken = text.replace("min = 5\n", "min = 6\n");
        assert_ne!(broken, text);
        assert!(toml::from_str::<Wrapper>(&broken).is_err());
    }

    fn widths() -> impl Strategy<Value = Vec<u32>> {
        prop::collection::vec(1u32..12, 1..8)
    }

    fn partition(widths: &[u32]) -> Vec<Zone> {
        let mut start = 1;
        widths
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let zone = Zone::new(i as ZoneId + 1, (10.0, 20.0), (start, start + w - 1));
                start += w;
                zone
            })
            .collect()
    }

    proptest! {
        #[test]
        fn contiguous_partitions_always_validate(widths in widths()) {
            let table = ZoneTable::new(partition(&widths)).unwrap();
            prop_assert_eq!(table.max_section(), widths.iter().sum::<u32>());
            for section in 1..=table.max_section() {
                let owners = table
                    .zones()
                    .iter()
                    .filter(|z| z.sections.contains(section))
                    .count();
                prop_assert_eq!(owners, 1);
                prop_assert!(table.zone_for_section(section).unwrap().sections.contains(section));
            }
        }

        #[test]
        fn shifted_boundaries_never_validate(
            widths in prop::collection::vec(1u32..12, 2..8),
            pick in any::<prop::sample::Index>(),
            grow in any::<bool>(),
        ) {
            let mut zones = partition(&widths);
            let idx = pick.index(zones.len() - 1) + 1;
            if grow {
                zones[idx].sections.min -= 1;
            } else {
                zones[idx].sections.min += 1;
                if zones[idx].sections.is_empty() {
                    zones[idx].sections.max = zones[idx].sections.min;
                }
            }
            prop_assert!(ZoneTable::new(zones).is_err());
        }
    }
}
