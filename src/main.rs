use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stayledger::config::Config;
use stayledger::engine::Ledger;
use stayledger::notify::NotifyHub;
use stayledger::{reaper, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    stayledger::observability::init(config.metrics_port)?;
    let tls_acceptor = config.tls_acceptor()?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let ledger = Arc::new(Ledger::new(config.wal_path(), Arc::new(NotifyHub::new()))?);
    tokio::spawn(reaper::run_compactor(ledger.clone(), config.compact_threshold));
    tokio::spawn(reaper::run_pruner(ledger.clone(), config.prune_interval));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("stayledger listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  entries: {}", ledger.entry_count());
    info!("  max_connections: {max_connections}");
    info!("  request_timeout: {:?}", config.request_timeout);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(stayledger::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(stayledger::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(stayledger::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let ledger = ledger.clone();
                let pw = config.password.clone();
                let tls = tls_acceptor.clone();
                let timeout = config.request_timeout;

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, ledger, pw, tls, timeout).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(stayledger::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("stayledger stopped");
    Ok(())
}
