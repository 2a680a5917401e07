use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::LedgerError;

/// The nights of `[check_in, check_out)`, ascending. Check-out is not occupied.
pub(crate) fn stay_nights(check_in: NaiveDate, check_out: NaiveDate) -> Result<Vec<NaiveDate>, LedgerError> {
    if check_out <= check_in {
        return Err(LedgerError::InvalidStay { check_in, check_out });
    }
    let nights = (check_out - check_in).num_days();
    if nights > MAX_STAY_NIGHTS as i64 {
        return Err(LedgerError::LimitExceeded("stay too long"));
    }
    Ok(check_in.iter_days().take(nights as usize).collect())
}

pub(crate) fn validate_label(label: Option<&str>) -> Result<(), LedgerError> {
    if let Some(l) = label
        && l.len() > MAX_LABEL_LEN {
            return Err(LedgerError::LimitExceeded("label too long"));
        }
    Ok(())
}

pub(crate) fn validate_capacity(total_capacity: u32) -> Result<(), LedgerError> {
    if total_capacity == 0 {
        return Err(LedgerError::InvalidCapacity(total_capacity));
    }
    if total_capacity > MAX_CAPACITY {
        return Err(LedgerError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

pub(crate) fn validate_restrictions(r: &StayRestrictions) -> Result<(), LedgerError> {
    if !r.is_valid() {
        return Err(LedgerError::InvalidStayBounds {
            min_stay: r.min_stay,
            max_stay: r.max_stay,
        });
    }
    Ok(())
}

/// Can `channel` take one more unit of this entry for `reservation_id`?
///
/// Evaluated under the entry's write lock, immediately before the append, so
/// a status, closure or capacity change made after any earlier query is
/// still enforced.
pub(crate) fn check_admission(
    entry: &LedgerEntry,
    channel: Channel,
    reservation_id: Ulid,
) -> Result<(), LedgerError> {
    let key = entry.key();
    if entry.status() != EntryStatus::Open {
        return Err(LedgerError::EntryNotOpen { key, status: entry.status() });
    }
    if entry.is_channel_closed(channel) {
        return Err(LedgerError::ChannelClosed { key, channel });
    }
    if entry.holds(reservation_id) {
        return Err(LedgerError::DuplicateReservation { key, reservation_id });
    }
    if entry.available_units() == 0 {
        return Err(LedgerError::CapacityExhausted(key));
    }
    Ok(())
}

pub(crate) fn check_stay_length(entry: &LedgerEntry, nights: Nights) -> Result<(), LedgerError> {
    let r = entry.restrictions();
    if !r.allows(nights) {
        return Err(LedgerError::StayLengthViolation {
            date: entry.date(),
            nights,
            min_stay: r.min_stay,
            max_stay: r.max_stay,
        });
    }
    Ok(())
}
