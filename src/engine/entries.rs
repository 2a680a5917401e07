use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admission::{check_admission, validate_capacity, validate_label, validate_restrictions};
use super::{detached, Ledger, LedgerError};

fn validate_spec(spec: &EntrySpec) -> Result<(), LedgerError> {
    validate_capacity(spec.total_capacity)?;
    validate_restrictions(&spec.restrictions)
}

fn warn_if_overcommitted(entry: &LedgerEntry) {
    if entry.overcommitted() {
        warn!(
            "entry {} over-committed: capacity {}, occupied {}, blocked {}",
            entry.key(),
            entry.total_capacity(),
            entry.occupied_units(),
            entry.blocked_units()
        );
        metrics::counter!(crate::observability::OVERCOMMITTED_TOTAL).increment(1);
    }
}

impl Ledger {
    /// Provision inventory for one (property, room type, date).
    pub async fn open(&self, key: EntryKey, spec: EntrySpec) -> Result<(), LedgerError> {
        validate_spec(&spec)?;
        if self.entries.len() >= MAX_ENTRIES {
            return Err(LedgerError::LimitExceeded("too many entries"));
        }
        let _keyset = self.keyset_gate.read().await;

        // The entry is published already write-locked, so nothing can act on
        // it before its opening is durable.
        let cell = Arc::new(RwLock::new(LedgerEntry::open(key, spec.clone())));
        let mut guard = cell.clone().write_owned().await;
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(LedgerError::DuplicateEntry(key)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(cell);
            }
        }

        let committer = self.committer.clone();
        let entries = Arc::clone(&self.entries);
        detached(async move {
            let event = Event::EntryOpened { key, spec };
            if let Err(e) = committer.append(&event).await {
                guard.retire();
                entries.remove(&key);
                return Err(e);
            }
            metrics::gauge!(crate::observability::ENTRIES).set(entries.len() as f64);
            committer.publish(&guard, &event);
            Ok(())
        })
        .await
    }

    /// Open `days` consecutive dates starting at `first_date` from room-type
    /// master data. Dates that already have an entry are left untouched.
    /// Returns how many entries were opened.
    pub async fn open_horizon(
        &self,
        room: RoomTypeKey,
        first_date: NaiveDate,
        days: u32,
        defaults: &EntrySpec,
    ) -> Result<u32, LedgerError> {
        if days > MAX_HORIZON_DAYS {
            return Err(LedgerError::LimitExceeded("horizon too long"));
        }
        validate_spec(defaults)?;
        let mut opened = 0;
        for date in first_date.iter_days().take(days as usize) {
            match self.open(room.on(date), defaults.clone()).await {
                Ok(()) => opened += 1,
                Err(LedgerError::DuplicateEntry(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(
            "opened {opened}/{days} entries for {}/{} from {first_date}",
            room.property_id, room.room_type_id
        );
        Ok(opened)
    }

    /// Consume one unit of `key` for `reservation_id`.
    ///
    /// The admission check and the append happen under the entry's write
    /// lock: of two callers racing for the last unit exactly one succeeds.
    pub async fn reserve(
        &self,
        key: EntryKey,
        channel: Channel,
        reservation_id: Ulid,
        label: Option<String>,
    ) -> Result<Reservation, LedgerError> {
        self.reserve_at(key, channel, reservation_id, label, Utc::now()).await
    }

    pub(crate) async fn reserve_at(
        &self,
        key: EntryKey,
        channel: Channel,
        reservation_id: Ulid,
        label: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError> {
        validate_label(label.as_deref())?;
        let guard = self.lock_entry(&key).await?;
        if let Err(e) = check_admission(&guard, channel, reservation_id) {
            record_admission(channel, Err(&e));
            return Err(e);
        }
        if guard.occupancy().len() >= MAX_OCCUPANCY_PER_ENTRY {
            return Err(LedgerError::LimitExceeded("too many reservations on entry"));
        }

        let reservation = Reservation {
            reservation_id,
            channel,
            label,
            created_at,
        };
        let event = Event::Reserved {
            key,
            reservation: reservation.clone(),
        };
        let guard = self.persist_and_apply(guard, event).await?;
        record_admission(channel, Ok(()));
        Ok(reservation)
    }

    /// Give back the unit held by `reservation_id` on `key`.
    ///
    /// Not idempotent: releasing twice fails with `ReservationNotFound`,
    /// which callers treat as "already released".
    pub async fn release(&self, key: EntryKey, reservation_id: Ulid) -> Result<Reservation, LedgerError> {
        let guard = self.lock_entry(&key).await?;
        let held = guard
            .occupancy()
            .iter()
            .find(|r| r.reservation_id == reservation_id)
            .cloned()
            .ok_or(LedgerError::ReservationNotFound { key, reservation_id })?;

        let event = Event::Released { key, reservation_id };
        let guard = self.persist_and_apply(guard, event).await?;
        debug!("released {reservation_id} on {key}");
        Ok(held)
    }

    /// Set the physical capacity. Existing reservations are never evicted: if
    /// commitments now exceed capacity, availability clamps at zero and the
    /// over-commitment is logged.
    pub async fn adjust_capacity(&self, key: EntryKey, total_capacity: u32) -> Result<LedgerEntry, LedgerError> {
        validate_capacity(total_capacity)?;
        let guard = self.lock_entry(&key).await?;
        let event = Event::CapacityAdjusted { key, total_capacity };
        let guard = self.persist_and_apply(guard, event).await?;
        warn_if_overcommitted(&guard);
        Ok(guard.clone())
    }

    /// Hold `count` more units out of sale.
    pub async fn block(&self, key: EntryKey, count: u32) -> Result<LedgerEntry, LedgerError> {
        let guard = self.lock_entry(&key).await?;
        let blocked_units = guard
            .blocked_units()
            .checked_add(count)
            .filter(|b| *b <= MAX_CAPACITY)
            .ok_or(LedgerError::LimitExceeded("too many blocked units"))?;
        let event = Event::BlockedSet { key, blocked_units };
        let guard = self.persist_and_apply(guard, event).await?;
        warn_if_overcommitted(&guard);
        Ok(guard.clone())
    }

    /// Return up to `count` blocked units to sale; saturates at zero.
    pub async fn unblock(&self, key: EntryKey, count: u32) -> Result<LedgerEntry, LedgerError> {
        let guard = self.lock_entry(&key).await?;
        let blocked_units = guard.blocked_units().saturating_sub(count);
        let event = Event::BlockedSet { key, blocked_units };
        let guard = self.persist_and_apply(guard, event).await?;
        Ok(guard.clone())
    }

    /// `Closed` and `Maintenance` stop new reservations; occupancy is untouched.
    pub async fn set_status(&self, key: EntryKey, status: EntryStatus) -> Result<LedgerEntry, LedgerError> {
        let guard = self.lock_entry(&key).await?;
        let event = Event::StatusSet { key, status };
        let guard = self.persist_and_apply(guard, event).await?;
        if status != EntryStatus::Open && guard.occupied_units() > 0 {
            info!(
                "{key} set {status} with {} existing reservation(s) kept",
                guard.occupied_units()
            );
        }
        Ok(guard.clone())
    }
}

pub(super) fn record_admission(channel: Channel, outcome: Result<(), &LedgerError>) {
    let outcome = match outcome {
        Ok(()) => "admitted",
        Err(e) => e.code(),
    };
    metrics::counter!(
        crate::observability::ADMISSIONS_TOTAL,
        "channel" => channel.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}
