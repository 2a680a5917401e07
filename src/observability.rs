use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "stayledger_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "stayledger_query_duration_seconds";

/// Counter: statements abandoned at the request timeout (retryable).
pub const REQUEST_TIMEOUTS_TOTAL: &str = "stayledger_request_timeouts_total";

// ── Ledger metrics ──────────────────────────────────────────────

/// Counter: admission attempts. Labels: channel, outcome.
pub const ADMISSIONS_TOTAL: &str = "stayledger_admissions_total";

/// Counter: stays rolled back after a partial failure.
pub const STAY_ROLLBACKS_TOTAL: &str = "stayledger_stay_rollbacks_total";

/// Counter: capacity or block changes that left an entry over-committed.
pub const OVERCOMMITTED_TOTAL: &str = "stayledger_overcommitted_total";

/// Gauge: provisioned ledger entries.
pub const ENTRIES: &str = "stayledger_entries";

/// Counter: past entries pruned.
pub const PRUNED_ENTRIES_TOTAL: &str = "stayledger_pruned_entries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "stayledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "stayledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stayledger_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stayledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stayledger_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::OpenEntries { .. } => "open_entries",
        Command::ReserveStay(_) => "reserve_stay",
        Command::ReleaseStay { .. } => "release_stay",
        Command::UpdateEntry { .. } => "update_entry",
        Command::SetRate { .. } => "set_rate",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
