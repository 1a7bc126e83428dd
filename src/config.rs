//! Server configuration, read from `STAYBOOK_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends before the background compactor rewrites the log.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Prometheus exporter port. `None` disables metrics export.
    pub metrics_port: Option<u16>,
    /// Probability in `[0, 1]` that the simulated gateway approves a charge.
    pub payment_success_rate: f64,
    pub payment_latency: Duration,
    /// Upper bound on one gateway call; a timeout counts as a failed payment.
    pub payment_timeout: Duration,
    /// Age after which an unpaid PENDING booking is cancelled. `None` disables.
    pub pending_ttl: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "staybook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            payment_success_rate: 0.9,
            payment_latency: Duration::from_millis(2000),
            payment_timeout: Duration::from_millis(5000),
            pending_ttl: Some(Duration::from_secs(900)),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing keys take the default; values that
    /// do not parse take the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let pending_ttl_secs: u64 = parsed(&get, "STAYBOOK_PENDING_TTL_SECS", 900);

        Self {
            port: parsed(&get, "STAYBOOK_PORT", d.port),
            bind: get("STAYBOOK_BIND").unwrap_or(d.bind),
            data_dir: get("STAYBOOK_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            password: get("STAYBOOK_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&get, "STAYBOOK_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: parsed(&get, "STAYBOOK_COMPACT_THRESHOLD", d.compact_threshold),
            tls_cert: get("STAYBOOK_TLS_CERT"),
            tls_key: get("STAYBOOK_TLS_KEY"),
            metrics_port: get("STAYBOOK_METRICS_PORT").and_then(|raw| match raw.trim().parse() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!("STAYBOOK_METRICS_PORT={raw:?} is not a port, metrics disabled");
                    None
                }
            }),
            payment_success_rate: parsed(
                &get,
                "STAYBOOK_PAYMENT_SUCCESS_RATE",
                d.payment_success_rate,
            ),
            payment_latency: Duration::from_millis(parsed(&get, "STAYBOOK_PAYMENT_LATENCY_MS", 2000)),
            payment_timeout: Duration::from_millis(parsed(&get, "STAYBOOK_PAYMENT_TIMEOUT_MS", 5000)),
            pending_ttl: (pending_ttl_secs > 0).then(|| Duration::from_secs(pending_ttl_secs)),
        }
    }

    /// Path of the single WAL file under `data_dir`.
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("staybook.wal")
    }
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
{
    match get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{key}={raw:?} does not parse, using default {default:?}");
            default
        }),
    }
}
