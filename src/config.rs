use std::path::PathBuf;
use std::time::Duration;

use crate::engine::DEFAULT_OP_TIMEOUT;

/// Server settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub op_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            op_timeout: DEFAULT_OP_TIMEOUT,
            metrics_port: None,
            tls: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults;
    /// set but unparsable keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(port) = parsed(&lookup, "SLOTBOOK_PORT")? {
            config.port = port;
        }
        if let Some(bind) = lookup("SLOTBOOK_BIND") {
            config.bind = bind;
        }
        if let Some(dir) = lookup("SLOTBOOK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(password) = lookup("SLOTBOOK_PASSWORD") {
            config.password = password;
        }
        if let Some(max) = parsed::<usize>(&lookup, "SLOTBOOK_MAX_CONNECTIONS")? {
            if max == 0 {
                return Err(ConfigError::Invalid {
                    key: "SLOTBOOK_MAX_CONNECTIONS",
                    value: max.to_string(),
                });
            }
            config.max_connections = max;
        }
        if let Some(threshold) = parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        if let Some(ms) = parsed(&lookup, "SLOTBOOK_OP_TIMEOUT_MS")? {
            config.op_timeout = Duration::from_millis(ms);
        }
        config.metrics_port = parsed(&lookup, "SLOTBOOK_METRICS_PORT")?;
        config.tls = match (lookup("SLOTBOOK_TLS_CERT"), lookup("SLOTBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
            }),
            _ => return Err(ConfigError::TlsIncomplete),
        };
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    TlsIncomplete,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::TlsIncomplete => write!(
                f,
                "both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
