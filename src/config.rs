use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Server settings, read once from `STAYLEDGER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub request_timeout: Duration,
    pub prune_interval: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "stayledger".into(),
            max_connections: 256,
            compact_threshold: 1000,
            request_timeout: Duration::from_millis(5000),
            prune_interval: Duration::from_secs(3600),
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset variables keep their default;
    /// set but unparsable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let d = Self::default();
        let cfg = Self {
            port: parsed(&lookup, "STAYLEDGER_PORT")?.unwrap_or(d.port),
            bind: lookup("STAYLEDGER_BIND").unwrap_or(d.bind),
            data_dir: lookup("STAYLEDGER_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("STAYLEDGER_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "STAYLEDGER_MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "STAYLEDGER_COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            request_timeout: parsed(&lookup, "STAYLEDGER_REQUEST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.request_timeout),
            prune_interval: parsed(&lookup, "STAYLEDGER_PRUNE_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.prune_interval),
            tls_cert: lookup("STAYLEDGER_TLS_CERT"),
            tls_key: lookup("STAYLEDGER_TLS_KEY"),
            metrics_port: parsed(&lookup, "STAYLEDGER_METRICS_PORT")?,
        };
        if cfg.max_connections == 0 {
            return Err(invalid("STAYLEDGER_MAX_CONNECTIONS must be at least 1"));
        }
        if cfg.prune_interval.is_zero() {
            return Err(invalid("STAYLEDGER_PRUNE_INTERVAL_SECS must be at least 1"));
        }
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg.into())
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> io::Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(format!("{name}: cannot parse {raw:?}"))),
    }
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(invalid(
                "both STAYLEDGER_TLS_CERT and STAYLEDGER_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| invalid("no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
