mod admission;
mod entries;
mod error;
mod maintenance;
mod queries;
mod rates;
mod stay;

pub use error::{DateFailure, ErrorKind, LedgerError};
pub use queries::DateAvailability;
pub use rates::stay_quote;
pub use stay::{ReleaseReport, StayRequest, StayReservation};

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};

use crate::model::*;
use crate::notify::{LedgerChange, NotifyHub};
use crate::wal::Wal;

pub type SharedEntry = Arc<RwLock<LedgerEntry>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// wait for one append, drain whatever else is already queued, then a single
/// fsync answers the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Flush what we have before compaction or stats.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

/// The whole batch lands or none of it does; a failed write is cut back
/// before the next batch is appended.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(event, _)| event)).map(|_| ())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The shared-inventory ledger: one record per (property, room type, date).
///
/// Each entry sits behind its own `RwLock`, the unit of mutual exclusion.
/// There is no lock spanning the ledger; multi-night operations take entry
/// locks in ascending key order.
pub struct Ledger {
    entries: Arc<DashMap<EntryKey, SharedEntry>>,
    committer: Committer,
    /// Shared by operations that add or remove keys; compaction takes it
    /// exclusively so its snapshot cannot miss a key.
    keyset_gate: RwLock<()>,
}

/// What a commit needs once it has left the caller's future: the WAL
/// channel and the change feed.
#[derive(Clone)]
pub(super) struct Committer {
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
}

impl Committer {
    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn append(&self, event: &Event) -> Result<(), LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| LedgerError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    pub(super) fn publish(&self, entry: &LedgerEntry, event: &Event) {
        self.notify.send(
            entry.key().room(),
            LedgerChange {
                key: entry.key(),
                available_units: entry.available_units(),
                total_capacity: entry.total_capacity(),
                event: event.clone(),
            },
        );
    }
}

/// Run a commit on its own task so dropping the caller cannot split the
/// WAL append from the in-memory apply. Everything the task touches is moved
/// in, including the entry guards.
pub(super) async fn detached<T: Send + 'static>(
    commit: impl Future<Output = Result<T, LedgerError>> + Send + 'static,
) -> Result<T, LedgerError> {
    tokio::spawn(commit)
        .await
        .map_err(|e| LedgerError::Storage(format!("commit task failed: {e}")))?
}

/// Apply one event to one entry. Caller holds the write lock.
fn apply_to_entry(entry: &mut LedgerEntry, event: &Event) {
    match event {
        Event::Reserved { reservation, .. } | Event::StayReserved { reservation, .. } => {
            entry.push_reservation(reservation.clone());
        }
        Event::Released { reservation_id, .. } | Event::StayReleased { reservation_id, .. } => {
            entry.remove_reservation(*reservation_id);
        }
        Event::CapacityAdjusted { total_capacity, .. } => entry.set_total_capacity(*total_capacity),
        Event::BlockedSet { blocked_units, .. } => entry.set_blocked_units(*blocked_units),
        Event::StatusSet { status, .. } => entry.set_status(*status),
        Event::ChannelClosed { channel, .. } => entry.close_channel(*channel),
        Event::ChannelReopened { channel, .. } => entry.reopen_channel(*channel),
        Event::RateSet { channel, rate, .. } => entry.set_rate(*channel, *rate),
        Event::RestrictionsSet { restrictions, .. } => entry.set_restrictions(*restrictions),
        // Opening and pruning change the key set, handled by the caller.
        Event::EntryOpened { .. } | Event::EntryPruned { .. } => {}
    }
}

impl Ledger {
    /// Open the ledger backed by the WAL at `wal_path`, replaying it into memory.
    /// Must be called inside a tokio runtime (spawns the WAL writer).
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;

        // Replay into plain values; nothing else can see them yet.
        let mut state: HashMap<EntryKey, LedgerEntry> = HashMap::new();
        for event in &events {
            match event {
                Event::EntryOpened { key, spec } => {
                    state.insert(*key, LedgerEntry::open(*key, spec.clone()));
                }
                Event::EntryPruned { key } => {
                    state.remove(key);
                }
                other => {
                    for key in other.keys() {
                        if let Some(entry) = state.get_mut(&key) {
                            apply_to_entry(entry, other);
                        }
                    }
                }
            }
        }

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entries = Arc::new(DashMap::with_capacity(state.len()));
        for (key, entry) in state {
            if entry.overcommitted() {
                tracing::warn!("replayed entry {key} is over-committed");
            }
            entries.insert(key, Arc::new(RwLock::new(entry)));
        }
        tracing::info!(
            "ledger loaded from {}: {} events, {} entries",
            wal_path.display(),
            events.len(),
            entries.len()
        );
        metrics::gauge!(crate::observability::ENTRIES).set(entries.len() as f64);

        Ok(Self {
            entries,
            committer: Committer { wal_tx, notify },
            keyset_gate: RwLock::new(()),
        })
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.committer.notify
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn get_entry(&self, key: &EntryKey) -> Option<SharedEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Resolve a key and take its write lock.
    pub(super) async fn lock_entry(
        &self,
        key: &EntryKey,
    ) -> Result<OwnedRwLockWriteGuard<LedgerEntry>, LedgerError> {
        let cell = self.get_entry(key).ok_or(LedgerError::NotProvisioned(*key))?;
        let guard = cell.write_owned().await;
        if guard.is_retired() {
            return Err(LedgerError::NotProvisioned(*key));
        }
        Ok(guard)
    }

    /// WAL-append + apply + notify for a single-entry event. The guard
    /// travels with the commit and comes back once it is applied.
    pub(super) async fn persist_and_apply(
        &self,
        mut guard: OwnedRwLockWriteGuard<LedgerEntry>,
        event: Event,
    ) -> Result<OwnedRwLockWriteGuard<LedgerEntry>, LedgerError> {
        let committer = self.committer.clone();
        detached(async move {
            committer.append(&event).await?;
            apply_to_entry(&mut guard, &event);
            committer.publish(&guard, &event);
            Ok(guard)
        })
        .await
    }
}
