//! Converting per-channel legacy inventory into ledger entries.
//!
//! Legacy systems keep one inventory slice per channel: each channel owns
//! some physical units and reports its own `total_rooms`. Reconciliation
//! pools them into one capacity per room type and replays occupancy as
//! channel-tagged reservations.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ulid::Ulid;

use crate::engine::{Ledger, LedgerError};
use crate::limits::*;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyOccupant {
    pub reservation_id: Ulid,
    pub label: Option<String>,
    #[serde(default)]
    pub booked_at: Option<DateTime<Utc>>,
}

/// One physical unit on one date as a single channel's legacy system saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyUnitRecord {
    pub property_id: Ulid,
    pub room_type_id: Ulid,
    pub date: NaiveDate,
    pub channel: Channel,
    pub unit_id: String,
    pub total_rooms: u32,
    pub occupant: Option<LegacyOccupant>,
}

/// A date whose legacy capacity disagreed with the corrected room capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityInconsistency {
    pub property_id: Ulid,
    pub room_type_id: Ulid,
    pub date: NaiveDate,
    /// Distinct values seen on this date (unit count and reported totals).
    pub observed: Vec<u32>,
    pub corrected: u32,
}

/// An occupant dropped because its unit, or its reservation, was already
/// occupied on that date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateOccupancy {
    pub key: EntryKey,
    pub unit_id: String,
    pub channel: Channel,
    pub reservation_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedEntry {
    pub key: EntryKey,
    pub total_capacity: u32,
    pub occupancy: Vec<Reservation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Ascending by key.
    pub entries: Vec<ConvertedEntry>,
    pub inconsistencies: Vec<CapacityInconsistency>,
    pub duplicates: Vec<DuplicateOccupancy>,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.inconsistencies.is_empty() && self.duplicates.is_empty()
    }
}

#[derive(Debug, Default)]
struct DateObservation {
    units: BTreeSet<String>,
    reported: BTreeSet<u32>,
    occupied_units: HashSet<String>,
    reservation_ids: HashSet<Ulid>,
    occupancy: Vec<Reservation>,
}

impl DateObservation {
    fn unit_count(&self) -> u32 {
        u32::try_from(self.units.len()).unwrap_or(u32::MAX)
    }

    fn observed(&self) -> Vec<u32> {
        let mut values: BTreeSet<u32> = self.reported.clone();
        values.insert(self.unit_count());
        values.into_iter().collect()
    }
}

/// Pool per-channel legacy records into one entry per (room type, date).
///
/// Each room type gets one corrected capacity for its whole horizon: the
/// largest value any date reports or implies, never below one. Dates that
/// disagree are flagged, not silently kept.
pub fn reconcile(records: &[LegacyUnitRecord]) -> Reconciliation {
    let mut rooms: BTreeMap<RoomTypeKey, BTreeMap<NaiveDate, DateObservation>> = BTreeMap::new();
    let mut duplicates = Vec::new();
    let fallback_booked_at = Utc::now();

    for record in records {
        let room = RoomTypeKey::new(record.property_id, record.room_type_id);
        let obs = rooms.entry(room).or_default().entry(record.date).or_default();
        obs.units.insert(record.unit_id.clone());
        obs.reported.insert(record.total_rooms);

        let Some(occupant) = &record.occupant else {
            continue;
        };
        // Only an accepted occupant claims its unit and reservation id.
        if obs.occupied_units.contains(&record.unit_id)
            || obs.reservation_ids.contains(&occupant.reservation_id)
        {
            duplicates.push(DuplicateOccupancy {
                key: room.on(record.date),
                unit_id: record.unit_id.clone(),
                channel: record.channel,
                reservation_id: occupant.reservation_id,
            });
            continue;
        }
        obs.occupied_units.insert(record.unit_id.clone());
        obs.reservation_ids.insert(occupant.reservation_id);
        obs.occupancy.push(Reservation {
            reservation_id: occupant.reservation_id,
            channel: record.channel,
            label: occupant.label.clone(),
            created_at: occupant.booked_at.unwrap_or(fallback_booked_at),
        });
    }

    let mut out = Reconciliation {
        duplicates,
        ..Default::default()
    };
    for (room, dates) in rooms {
        let corrected = dates
            .values()
            .flat_map(|obs| obs.observed())
            .max()
            .unwrap_or(1)
            .max(1);

        for (date, obs) in dates {
            let observed = obs.observed();
            if observed.iter().any(|v| *v != corrected) {
                warn!(
                    "capacity inconsistency on {}: observed {observed:?}, corrected to {corrected}",
                    room.on(date)
                );
                out.inconsistencies.push(CapacityInconsistency {
                    property_id: room.property_id,
                    room_type_id: room.room_type_id,
                    date,
                    observed,
                    corrected,
                });
            }
            out.entries.push(ConvertedEntry {
                key: room.on(date),
                total_capacity: corrected,
                occupancy: obs.occupancy,
            });
        }
    }

    for dup in &out.duplicates {
        warn!(
            "duplicate occupancy on {}: unit {} ({}) for {}",
            dup.key, dup.unit_id, dup.channel, dup.reservation_id
        );
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailure {
    pub key: EntryKey,
    /// `None` when opening the entry itself failed.
    pub reservation_id: Option<Ulid>,
    pub cause: LedgerError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub entries_opened: usize,
    pub reservations_replayed: usize,
    pub failures: Vec<ImportFailure>,
}

impl Ledger {
    /// Open every converted entry and replay its reservations.
    ///
    /// Rates and restrictions come from `defaults`; capacity comes from the
    /// reconciliation. Business and setup failures are collected per entry
    /// (an existing key reports `DuplicateEntry` and its reservations are
    /// skipped); a storage failure aborts the import.
    pub async fn import(
        &self,
        reconciliation: &Reconciliation,
        defaults: &EntrySpec,
    ) -> Result<ImportReport, LedgerError> {
        let records: usize = reconciliation
            .entries
            .iter()
            .map(|e| 1 + e.occupancy.len())
            .sum();
        if records > MAX_IMPORT_RECORDS {
            return Err(LedgerError::LimitExceeded("import too large"));
        }

        let mut report = ImportReport::default();
        for converted in &reconciliation.entries {
            let spec = EntrySpec {
                total_capacity: converted.total_capacity,
                ..defaults.clone()
            };
            match self.open(converted.key, spec).await {
                Ok(()) => report.entries_opened += 1,
                Err(e @ LedgerError::Storage(_)) => return Err(e),
                Err(cause) => {
                    report.failures.push(ImportFailure {
                        key: converted.key,
                        reservation_id: None,
                        cause,
                    });
                    continue;
                }
            }

            for r in &converted.occupancy {
                match self
                    .reserve_at(converted.key, r.channel, r.reservation_id, r.label.clone(), r.created_at)
                    .await
                {
                    Ok(_) => report.reservations_replayed += 1,
                    Err(e @ LedgerError::Storage(_)) => return Err(e),
                    Err(cause) => report.failures.push(ImportFailure {
                        key: converted.key,
                        reservation_id: Some(r.reservation_id),
                        cause,
                    }),
                }
            }
        }

        info!(
            "import: {} entries, {} reservations, {} failures",
            report.entries_opened,
            report.reservations_replayed,
            report.failures.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{date, usd};
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stayledger_test_reconcile");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn unit(
        room: RoomTypeKey,
        day: &str,
        channel: Channel,
        unit_id: &str,
        total_rooms: u32,
        occupant: Option<Ulid>,
    ) -> LegacyUnitRecord {
        LegacyUnitRecord {
            property_id: room.property_id,
            room_type_id: room.room_type_id,
            date: date(day),
            channel,
            unit_id: unit_id.into(),
            total_rooms,
            occupant: occupant.map(|reservation_id| LegacyOccupant {
                reservation_id,
                label: None,
                booked_at: None,
            }),
        }
    }

    #[test]
    fn inconsistent_totals_corrected_to_one_value() {
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let records = vec![
            // Nov 15: both channels agree on 3.
            unit(room, "2025-11-15", Channel::Airbnb, "101", 3, None),
            unit(room, "2025-11-15", Channel::Booking, "102", 3, None),
            unit(room, "2025-11-15", Channel::Booking, "103", 3, None),
            // Nov 16: one channel under-reports.
            unit(room, "2025-11-16", Channel::Airbnb, "101", 2, None),
            unit(room, "2025-11-16", Channel::Booking, "102", 3, None),
            unit(room, "2025-11-16", Channel::Booking, "103", 3, None),
            // Nov 17: only two units exported.
            unit(room, "2025-11-17", Channel::Airbnb, "101", 3, None),
            unit(room, "2025-11-17", Channel::Booking, "102", 3, None),
        ];

        let rec = reconcile(&records);
        assert_eq!(rec.entries.len(), 3);
        assert!(rec.entries.iter().all(|e| e.total_capacity == 3));

        let flagged: Vec<NaiveDate> = rec.inconsistencies.iter().map(|i| i.date).collect();
        assert_eq!(flagged, vec![date("2025-11-16"), date("2025-11-17")]);
        assert_eq!(rec.inconsistencies[0].observed, vec![2, 3]);
        assert_eq!(rec.inconsistencies[1].observed, vec![2, 3]);
        assert!(rec.inconsistencies.iter().all(|i| i.corrected == 3));
    }

    #[test]
    fn units_beyond_reported_total_raise_capacity() {
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let records = vec![
            unit(room, "2025-12-01", Channel::Expedia, "a", 1, None),
            unit(room, "2025-12-01", Channel::Vrbo, "b", 1, None),
        ];
        let rec = reconcile(&records);
        assert_eq!(rec.entries[0].total_capacity, 2);
        assert_eq!(rec.inconsistencies.len(), 1);
    }

    #[test]
    fn occupancy_keeps_original_channel() {
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let a = Ulid::new();
        let b = Ulid::new();
        let records = vec![
            unit(room, "2025-11-15", Channel::Airbnb, "101", 2, Some(a)),
            unit(room, "2025-11-15", Channel::Booking, "102", 2, Some(b)),
        ];
        let rec = reconcile(&records);
        assert!(rec.is_clean());
        let occ = &rec.entries[0].occupancy;
        assert_eq!(occ.len(), 2);
        assert_eq!(occ[0].channel, Channel::Airbnb);
        assert_eq!(occ[1].reservation_id, b);
    }

    #[test]
    fn duplicate_occupancy_flagged_and_replayed_once() {
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let first = Ulid::new();
        let records = vec![
            unit(room, "2025-11-15", Channel::Airbnb, "101", 2, Some(first)),
            unit(room, "2025-11-15", Channel::Booking, "101", 2, Some(Ulid::new())),
        ];
        let rec = reconcile(&records);
        assert_eq!(rec.entries[0].occupancy.len(), 1);
        assert_eq!(rec.entries[0].occupancy[0].reservation_id, first);
        assert_eq!(rec.duplicates.len(), 1);
        assert_eq!(rec.duplicates[0].unit_id, "101");
        assert_eq!(rec.duplicates[0].channel, Channel::Booking);
    }

    #[test]
    fn rejected_occupant_claims_nothing() {
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let first = Ulid::new();
        let moved = Ulid::new();
        let records = vec![
            unit(room, "2025-11-15", Channel::Airbnb, "101", 3, Some(first)),
            // Refused: 101 is taken.
            unit(room, "2025-11-15", Channel::Booking, "101", 3, Some(moved)),
            // The same booking on a free unit is fine.
            unit(room, "2025-11-15", Channel::Booking, "102", 3, Some(moved)),
            // Refused: `first` already holds 101.
            unit(room, "2025-11-15", Channel::Airbnb, "103", 3, Some(first)),
            // So 103 is still free.
            unit(room, "2025-11-15", Channel::Direct, "103", 3, Some(Ulid::new())),
        ];
        let rec = reconcile(&records);
        assert_eq!(rec.duplicates.len(), 2);
        assert_eq!(rec.duplicates[0].unit_id, "101");
        assert_eq!(rec.duplicates[1].unit_id, "103");
        assert_eq!(rec.duplicates[1].reservation_id, first);

        let occ = &rec.entries[0].occupancy;
        assert_eq!(occ.len(), 3);
        assert_eq!(occ[1].reservation_id, moved);
        assert_eq!(occ[1].channel, Channel::Booking);
        assert_eq!(occ[2].channel, Channel::Direct);
    }

    #[test]
    fn empty_input() {
        let rec = reconcile(&[]);
        assert!(rec.entries.is_empty());
        assert!(rec.is_clean());
    }

    #[tokio::test]
    async fn import_pools_channels_into_one_capacity() {
        let path = test_wal_path("import_pool.wal");
        let ledger = Ledger::new(path, Arc::new(NotifyHub::new())).unwrap();
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let records = vec![
            unit(room, "2025-11-15", Channel::Airbnb, "101", 2, Some(Ulid::new())),
            unit(room, "2025-11-15", Channel::Booking, "102", 3, None),
            unit(room, "2025-11-15", Channel::Booking, "103", 3, Some(Ulid::new())),
        ];
        let rec = reconcile(&records);
        let report = ledger.import(&rec, &EntrySpec::new(1, usd(15_000))).await.unwrap();
        assert_eq!(report.entries_opened, 1);
        assert_eq!(report.reservations_replayed, 2);
        assert!(report.failures.is_empty());

        let entry = ledger.entry(&room.on(date("2025-11-15"))).await.unwrap();
        assert_eq!(entry.total_capacity(), 3);
        assert_eq!(entry.available_units(), 1);
        assert_eq!(entry.base_rate(), usd(15_000));
    }

    #[tokio::test]
    async fn import_reports_existing_entries() {
        let path = test_wal_path("import_existing.wal");
        let ledger = Ledger::new(path, Arc::new(NotifyHub::new())).unwrap();
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let key = room.on(date("2025-11-15"));
        ledger.open(key, EntrySpec::new(5, usd(10_000))).await.unwrap();

        let rec = reconcile(&[unit(room, "2025-11-15", Channel::Direct, "1", 1, Some(Ulid::new()))]);
        let report = ledger.import(&rec, &EntrySpec::new(1, usd(10_000))).await.unwrap();
        assert_eq!(report.entries_opened, 0);
        assert_eq!(report.reservations_replayed, 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].cause, LedgerError::DuplicateEntry(key));
        assert_eq!(report.failures[0].reservation_id, None);
    }
}
