use chrono::{NaiveDate, Utc};
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;

use super::admission::{check_admission, check_stay_length, stay_nights, validate_label};
use super::entries::record_admission;
use super::rates::stay_quote;
use super::{apply_to_entry, detached, DateFailure, Ledger, LedgerError};

/// A booking workflow's request for one room over `[check_in, check_out)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StayRequest {
    pub property_id: Ulid,
    pub room_type_id: Ulid,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub channel: Channel,
    pub reservation_id: Ulid,
    pub label: Option<String>,
}

impl StayRequest {
    pub fn room(&self) -> RoomTypeKey {
        RoomTypeKey::new(self.property_id, self.room_type_id)
    }
}

/// A committed stay. The workflow persists its own booking record from this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StayReservation {
    pub reservation_id: Ulid,
    pub room: RoomTypeKey,
    pub channel: Channel,
    pub nights: Vec<NaiveDate>,
    /// Nightly rates summed for the channel; `None` on mixed currencies.
    pub total: Option<Rate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: Vec<NaiveDate>,
    /// Nights with nothing to release: already released or never provisioned.
    pub not_released: Vec<DateFailure>,
}

impl ReleaseReport {
    pub fn is_complete(&self) -> bool {
        self.not_released.is_empty()
    }
}

/// Write guards of every night of a stay, ascending, plus how many of them
/// currently carry the reservation. Dropping an uncommitted stay removes the
/// reservation from those nights, so a refused night or a failed WAL write
/// cannot leave part of a stay behind.
pub(super) struct StagedStay {
    reservation_id: Ulid,
    guards: Vec<OwnedRwLockWriteGuard<LedgerEntry>>,
    staged: usize,
    committed: bool,
}

impl StagedStay {
    pub(super) fn new(reservation_id: Ulid, guards: Vec<OwnedRwLockWriteGuard<LedgerEntry>>) -> Self {
        Self {
            reservation_id,
            guards,
            staged: 0,
            committed: false,
        }
    }

    /// Reserve night by night. On the first refusal, release what was taken
    /// and keep checking the rest so the error names every failing night.
    pub(super) fn admit(&mut self, reservation: &Reservation) -> Result<(), Vec<DateFailure>> {
        let mut failures = Vec::new();
        for guard in self.guards.iter_mut() {
            if !failures.is_empty() {
                if let Err(cause) = check_admission(guard, reservation.channel, reservation.reservation_id) {
                    failures.push(DateFailure { date: guard.date(), cause: Box::new(cause) });
                }
                continue;
            }
            match check_admission(guard, reservation.channel, reservation.reservation_id) {
                Ok(()) => {
                    guard.push_reservation(reservation.clone());
                    self.staged += 1;
                }
                Err(cause) => failures.push(DateFailure { date: guard.date(), cause: Box::new(cause) }),
            }
        }
        if failures.is_empty() {
            return Ok(());
        }
        self.rollback();
        Err(failures)
    }

    fn rollback(&mut self) {
        let id = self.reservation_id;
        for guard in self.guards[..self.staged].iter_mut().rev() {
            guard.remove_reservation(id);
        }
        self.staged = 0;
    }

    pub(super) fn commit(mut self) -> Vec<OwnedRwLockWriteGuard<LedgerEntry>> {
        self.committed = true;
        std::mem::take(&mut self.guards)
    }
}

impl Drop for StagedStay {
    fn drop(&mut self) {
        if !self.committed && self.staged > 0 {
            warn!(
                "rolling back {} staged night(s) of {}",
                self.staged, self.reservation_id
            );
            self.rollback();
        }
    }
}

impl Ledger {
    pub(super) async fn lock_nights(
        &self,
        room: RoomTypeKey,
        nights: &[NaiveDate],
    ) -> Result<Vec<OwnedRwLockWriteGuard<LedgerEntry>>, LedgerError> {
        let mut guards = Vec::with_capacity(nights.len());
        // Ascending: every caller uses the same order, so no deadlock.
        for night in nights {
            guards.push(self.lock_entry(&room.on(*night)).await?);
        }
        Ok(guards)
    }

    /// Reserve every night of `[check_in, check_out)` or none of them.
    ///
    /// Stay length is checked against each night's restrictions before any
    /// unit is taken. A partial failure is rolled back before this returns,
    /// so the caller never sees a half-committed stay. No internal retry.
    pub async fn reserve_stay(&self, req: StayRequest) -> Result<StayReservation, LedgerError> {
        validate_label(req.label.as_deref())?;
        let nights = stay_nights(req.check_in, req.check_out)?;
        let room = req.room();

        let guards = self.lock_nights(room, &nights).await?;
        let count = nights.len() as Nights;
        for guard in &guards {
            check_stay_length(guard, count)?;
        }

        let reservation = Reservation {
            reservation_id: req.reservation_id,
            channel: req.channel,
            label: req.label,
            created_at: Utc::now(),
        };
        let mut staged = StagedStay::new(req.reservation_id, guards);
        if let Err(failures) = staged.admit(&reservation) {
            metrics::counter!(crate::observability::STAY_ROLLBACKS_TOTAL).increment(1);
            let error = LedgerError::CrossDateReservationFailure { failures };
            record_admission(req.channel, Err(&error));
            debug!("stay {} rejected: {error}", req.reservation_id);
            return Err(error);
        }

        let event = Event::StayReserved {
            room,
            nights: nights.clone(),
            reservation,
        };
        let committer = self.committer.clone();
        let channel = req.channel;
        let total = detached(async move {
            // A failed append drops `staged` here, which rolls it back.
            committer.append(&event).await?;
            let guards = staged.commit();
            for guard in &guards {
                committer.publish(guard, &event);
            }
            Ok(stay_quote(guards.iter().map(|g| &**g), channel))
        })
        .await?;
        record_admission(req.channel, Ok(()));
        info!(
            "reserved {} night(s) {}..{} for {} via {}",
            nights.len(),
            req.check_in,
            req.check_out,
            req.reservation_id,
            req.channel
        );

        Ok(StayReservation {
            reservation_id: req.reservation_id,
            room,
            channel: req.channel,
            nights,
            total,
        })
    }

    /// Release every night of a stay that still holds `reservation_id`.
    ///
    /// Nights already released (or never provisioned) are tolerated and
    /// reported; only a storage failure aborts the call.
    pub async fn release_stay(
        &self,
        room: RoomTypeKey,
        check_in: NaiveDate,
        check_out: NaiveDate,
        reservation_id: Ulid,
    ) -> Result<ReleaseReport, LedgerError> {
        let nights = stay_nights(check_in, check_out)?;
        let mut report = ReleaseReport::default();
        let mut held = Vec::with_capacity(nights.len());

        for night in &nights {
            let key = room.on(*night);
            match self.lock_entry(&key).await {
                Ok(guard) if guard.holds(reservation_id) => held.push(guard),
                Ok(_) => report.not_released.push(DateFailure {
                    date: *night,
                    cause: Box::new(LedgerError::ReservationNotFound { key, reservation_id }),
                }),
                Err(cause) => report.not_released.push(DateFailure { date: *night, cause: Box::new(cause) }),
            }
        }
        if held.is_empty() {
            debug!("release of {reservation_id}: nothing held on {} night(s)", nights.len());
            return Ok(report);
        }

        let released: Vec<NaiveDate> = held.iter().map(|g| g.date()).collect();
        let event = Event::StayReleased {
            room,
            nights: released.clone(),
            reservation_id,
        };
        let committer = self.committer.clone();
        detached(async move {
            committer.append(&event).await?;
            for guard in held.iter_mut() {
                apply_to_entry(guard, &event);
                committer.publish(guard, &event);
            }
            Ok(())
        })
        .await?;
        if !report.is_complete() {
            info!(
                "released {reservation_id} on {} night(s); {} already released",
                released.len(),
                report.not_released.len()
            );
        }
        report.released = released;
        Ok(report)
    }
}
