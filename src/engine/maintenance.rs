use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::oneshot;
use tracing::info;

use crate::model::*;

use super::{detached, Ledger, LedgerError, WalCommand};

/// The minimal events that recreate `entry` exactly.
fn snapshot_events(entry: &LedgerEntry, events: &mut Vec<Event>) {
    let key = entry.key();
    events.push(Event::EntryOpened {
        key,
        spec: entry.current_spec(),
    });
    if entry.blocked_units() > 0 {
        events.push(Event::BlockedSet {
            key,
            blocked_units: entry.blocked_units(),
        });
    }
    if entry.status() != EntryStatus::Open {
        events.push(Event::StatusSet {
            key,
            status: entry.status(),
        });
    }
    for channel in entry.closed_channels() {
        events.push(Event::ChannelClosed { key, channel: *channel });
    }
    for reservation in entry.occupancy() {
        events.push(Event::Reserved {
            key,
            reservation: reservation.clone(),
        });
    }
}

impl Ledger {
    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds every entry's write lock (ascending key order) until the new log
    /// is in place: any append racing the snapshot would otherwise be lost
    /// with the old file. Returns the number of events written.
    pub async fn compact_wal(&self) -> Result<usize, LedgerError> {
        let _keyset = self.keyset_gate.write().await;
        let mut keys: Vec<EntryKey> = self.entries.iter().map(|e| *e.key()).collect();
        keys.sort();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(cell) = self.get_entry(key) {
                guards.push(cell.write_owned().await);
            }
        }

        let mut events = Vec::with_capacity(guards.len());
        for guard in guards.iter().filter(|g| !g.is_retired()) {
            snapshot_events(guard, &mut events);
        }
        let written = events.len();

        let (tx, rx) = oneshot::channel();
        self.committer
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| LedgerError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        info!("compacted WAL to {written} events over {} entries", guards.len());
        Ok(written)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .committer
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Archive entries dated before `cutoff` that no reservation references.
    /// Entries still holding reservations are kept. Returns how many were pruned.
    pub async fn prune_before(&self, cutoff: NaiveDate) -> Result<usize, LedgerError> {
        let _keyset = self.keyset_gate.read().await;
        let mut keys: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|e| e.key().date < cutoff)
            .map(|e| *e.key())
            .collect();
        keys.sort();

        let mut pruned = 0;
        for key in keys {
            let Ok(mut guard) = self.lock_entry(&key).await else {
                continue;
            };
            if guard.occupied_units() > 0 {
                continue;
            }
            let committer = self.committer.clone();
            let entries = Arc::clone(&self.entries);
            detached(async move {
                committer.append(&Event::EntryPruned { key }).await?;
                guard.retire();
                entries.remove(&key);
                Ok(())
            })
            .await?;
            pruned += 1;
        }

        if pruned > 0 {
            info!("pruned {pruned} past entries before {cutoff}");
            metrics::counter!(crate::observability::PRUNED_ENTRIES_TOTAL).increment(pruned as u64);
            metrics::gauge!(crate::observability::ENTRIES).set(self.entries.len() as f64);
        }
        self.committer.notify.prune_idle();
        Ok(pruned)
    }
}
