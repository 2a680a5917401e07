use crate::model::*;

use super::admission::validate_restrictions;
use super::{Ledger, LedgerError};

/// Sum of the nightly rates `channel` would pay over `entries`.
/// `None` when the nights are priced in more than one currency.
pub fn stay_quote<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>, channel: Channel) -> Option<Rate> {
    let mut total: Option<Rate> = None;
    for entry in entries {
        let nightly = entry.rate_for(channel);
        total = match total {
            None => Some(nightly),
            Some(acc) if acc.currency == nightly.currency => Some(Rate {
                amount_minor: acc.amount_minor.checked_add(nightly.amount_minor)?,
                currency: acc.currency,
            }),
            Some(_) => return None,
        };
    }
    total
}

impl Ledger {
    /// Set the channel-specific nightly rate on one entry.
    pub async fn set_rate(&self, key: EntryKey, channel: Channel, rate: Rate) -> Result<LedgerEntry, LedgerError> {
        // Rates built outside `Rate::new` are revalidated here.
        let rate = Rate::new(rate.amount_minor, rate.currency)?;
        let guard = self.lock_entry(&key).await?;
        let event = Event::RateSet { key, channel, rate };
        let guard = self.persist_and_apply(guard, event).await?;
        Ok(guard.clone())
    }

    /// Replace the permissible stay length. Enforced on the next admission.
    pub async fn set_restrictions(
        &self,
        key: EntryKey,
        restrictions: StayRestrictions,
    ) -> Result<LedgerEntry, LedgerError> {
        validate_restrictions(&restrictions)?;
        let guard = self.lock_entry(&key).await?;
        let event = Event::RestrictionsSet { key, restrictions };
        let guard = self.persist_and_apply(guard, event).await?;
        Ok(guard.clone())
    }

    /// Bar `channel` from new reservations on this date. Other channels keep
    /// selling the same shared pool.
    pub async fn close_channel(&self, key: EntryKey, channel: Channel) -> Result<LedgerEntry, LedgerError> {
        let guard = self.lock_entry(&key).await?;
        if guard.is_channel_closed(channel) {
            return Ok(guard.clone());
        }
        let event = Event::ChannelClosed { key, channel };
        let guard = self.persist_and_apply(guard, event).await?;
        Ok(guard.clone())
    }

    pub async fn reopen_channel(&self, key: EntryKey, channel: Channel) -> Result<LedgerEntry, LedgerError> {
        let guard = self.lock_entry(&key).await?;
        if !guard.is_channel_closed(channel) {
            return Ok(guard.clone());
        }
        let event = Event::ChannelReopened { key, channel };
        let guard = self.persist_and_apply(guard, event).await?;
        Ok(guard.clone())
    }
}
