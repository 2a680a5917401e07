use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use tokio::sync::broadcast;

use crate::limits::*;
use crate::model::*;
use crate::notify::LedgerChange;

use super::{Ledger, LedgerError};

/// Availability of one date as seen by a search or display caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateAvailability {
    pub date: NaiveDate,
    pub status: EntryStatus,
    pub total_capacity: u32,
    pub blocked_units: u32,
    pub occupied_units: u32,
    /// Identical for every channel.
    pub available_units: u32,
    pub occupied_by_channel: BTreeMap<Channel, u32>,
    /// Rate for the requested channel, or the base rate.
    pub rate: Rate,
    pub rates: BTreeMap<Channel, Rate>,
    pub restrictions: StayRestrictions,
    pub closed_channels: BTreeSet<Channel>,
    /// Whether a reservation could be admitted right now (for the requested
    /// channel, when one was given). Not a guarantee.
    pub bookable: bool,
}

impl DateAvailability {
    fn from_entry(entry: &LedgerEntry, channel: Option<Channel>) -> Self {
        let open = entry.status() == EntryStatus::Open && entry.available_units() > 0;
        let (rate, bookable) = match channel {
            Some(ch) => (entry.rate_for(ch), open && !entry.is_channel_closed(ch)),
            None => (entry.base_rate(), open),
        };
        Self {
            date: entry.date(),
            status: entry.status(),
            total_capacity: entry.total_capacity(),
            blocked_units: entry.blocked_units(),
            occupied_units: entry.occupied_units(),
            available_units: entry.available_units(),
            occupied_by_channel: entry.occupancy_by_channel(),
            rate,
            rates: entry.rates().clone(),
            restrictions: entry.restrictions(),
            closed_channels: entry.closed_channels().clone(),
            bookable,
        }
    }
}

impl Ledger {
    /// Per-date snapshot over `[check_in, check_out)` for search and display.
    ///
    /// Best effort: each date is read on its own, never under one lock, so
    /// the result may be stale by the time it is returned. `reserve_stay`
    /// re-validates independently. Unprovisioned dates are omitted.
    pub async fn query_availability(
        &self,
        room: RoomTypeKey,
        check_in: NaiveDate,
        check_out: NaiveDate,
        channel: Option<Channel>,
    ) -> Result<Vec<DateAvailability>, LedgerError> {
        if check_out <= check_in {
            return Err(LedgerError::InvalidStay { check_in, check_out });
        }
        let days = (check_out - check_in).num_days();
        if days > MAX_QUERY_DAYS as i64 {
            return Err(LedgerError::LimitExceeded("query window too wide"));
        }

        let mut out = Vec::new();
        for date in check_in.iter_days().take(days as usize) {
            let Some(cell) = self.get_entry(&room.on(date)) else {
                continue;
            };
            let guard = cell.read().await;
            if guard.is_retired() {
                continue;
            }
            out.push(DateAvailability::from_entry(&guard, channel));
        }
        Ok(out)
    }

    /// Snapshot of a single entry.
    pub async fn entry(&self, key: &EntryKey) -> Option<LedgerEntry> {
        let cell = self.get_entry(key)?;
        let guard = cell.read().await;
        if guard.is_retired() {
            return None;
        }
        Some(guard.clone())
    }

    /// Committed changes of one room type, in commit order per entry.
    pub fn subscribe(&self, room: RoomTypeKey) -> broadcast::Receiver<LedgerChange> {
        self.committer.notify.subscribe(room)
    }

    /// Provisioned dates of one room type, ascending.
    pub fn provisioned_dates(&self, room: RoomTypeKey) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self
            .entries
            .iter()
            .filter(|e| e.key().room() == room)
            .map(|e| e.key().date)
            .collect();
        dates.sort();
        dates
    }
}
