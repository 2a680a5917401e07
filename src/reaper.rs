use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::engine::Ledger;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts the WAL once enough appends piled up.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&ledger, threshold).await;
    }
}

async fn compact_if_due(ledger: &Ledger, threshold: u64) -> bool {
    let appends = ledger.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match ledger.compact_wal().await {
        Ok(events) => {
            info!("compactor: {appends} appends folded into {events} events");
            true
        }
        Err(e) => {
            warn!("compactor: {e}");
            false
        }
    }
}

/// Background task that archives entries for dates already in the past.
pub async fn run_pruner(ledger: Arc<Ledger>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        prune_past(&ledger, Utc::now().date_naive()).await;
    }
}

async fn prune_past(ledger: &Ledger, today: NaiveDate) -> usize {
    match ledger.prune_before(today).await {
        Ok(n) => {
            debug!("pruner: {n} entries before {today}");
            n
        }
        Err(e) => {
            // Retried on the next tick.
            warn!("pruner: {e}");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{date, usd};
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stayledger_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let path = test_wal_path("compact_threshold.wal");
        let ledger = Ledger::new(path, Arc::new(NotifyHub::new())).unwrap();
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        ledger
            .open_horizon(room, date("2025-11-01"), 3, &EntrySpec::new(2, usd(9_000)))
            .await
            .unwrap();

        assert!(!compact_if_due(&ledger, 10).await);
        assert!(compact_if_due(&ledger, 3).await);
        assert_eq!(ledger.wal_appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn pruner_keeps_occupied_past_dates() {
        let path = test_wal_path("prune_past.wal");
        let ledger = Ledger::new(path, Arc::new(NotifyHub::new())).unwrap();
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        ledger
            .open_horizon(room, date("2025-11-01"), 4, &EntrySpec::new(2, usd(9_000)))
            .await
            .unwrap();
        tokio_test::assert_ok!(
            ledger
                .reserve(room.on(date("2025-11-02")), Channel::Direct, Ulid::new(), None)
                .await
        );

        assert_eq!(prune_past(&ledger, date("2025-11-04")).await, 2);
        assert_eq!(
            ledger.provisioned_dates(room),
            vec![date("2025-11-02"), date("2025-11-04")]
        );
    }
}
