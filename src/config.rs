use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::DEFAULT_LOCK_WAIT;

/// Server settings, read from `VACANCY_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub lock_wait: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "vacancy".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_wait: DEFAULT_LOCK_WAIT,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "VACANCY_PORT").unwrap_or(defaults.port),
            bind: lookup("VACANCY_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("VACANCY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("VACANCY_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "VACANCY_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "VACANCY_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            lock_wait: parsed(&lookup, "VACANCY_LOCK_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_wait),
            metrics_port: parsed(&lookup, "VACANCY_METRICS_PORT"),
            tls_cert: lookup("VACANCY_TLS_CERT"),
            tls_key: lookup("VACANCY_TLS_KEY"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("vacancy.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
