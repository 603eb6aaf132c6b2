//! Engine configuration.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};
use crate::ledger::{Ledger, MemoryLedger};

/// Default quiescence debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Default interval between progress log lines while waiting to drain.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Settings shared by every step and stream of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long the pipeline must stay idle before the run ends.
    ///
    /// Default: 50ms.
    pub debounce: Duration,

    /// Pending-message bound for streams without an explicit capacity.
    ///
    /// `None` leaves streams unbounded. Default: unbounded.
    pub stream_capacity: Option<usize>,

    /// Where the ledger lives: `memory`, or a SQLite URL such as
    /// `sqlite://./cascade.db`.
    ///
    /// Default: `memory`.
    pub ledger_url: String,

    /// How often to log progress while waiting for quiescence.
    ///
    /// Default: 5s.
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            stream_capacity: None,
            ledger_url: "memory".to_string(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Reads an optional `.env` file first. Recognised variables:
    /// `CASCADE_DEBOUNCE_MS`, `CASCADE_STREAM_CAPACITY`,
    /// `CASCADE_LEDGER_URL`, `CASCADE_PROGRESS_INTERVAL_MS`.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let millis = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| CascadeError::Config(format!("{key} must be a whole number of milliseconds, got {raw:?}"))),
                None => Ok(default),
            }
        };

        let stream_capacity = match lookup("CASCADE_STREAM_CAPACITY") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(CascadeError::Config(format!(
                        "CASCADE_STREAM_CAPACITY must be a positive number, got {raw:?}"
                    )))
                }
                Ok(capacity) => Some(capacity),
            },
            None => defaults.stream_capacity,
        };

        Ok(Self {
            debounce: millis("CASCADE_DEBOUNCE_MS", defaults.debounce)?,
            stream_capacity,
            ledger_url: lookup("CASCADE_LEDGER_URL").unwrap_or(defaults.ledger_url),
            progress_interval: millis("CASCADE_PROGRESS_INTERVAL_MS", defaults.progress_interval)?,
        })
    }

    /// Set the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Bound every stream that has no explicit capacity.
    pub fn with_stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = Some(capacity.max(1));
        self
    }

    /// Set the ledger location.
    pub fn with_ledger_url(mut self, url: impl Into<String>) -> Self {
        self.ledger_url = url.into();
        self
    }

    /// Set the progress log interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Open the ledger named by [`EngineConfig::ledger_url`].
    pub async fn open_ledger(&self) -> Result<Arc<dyn Ledger>> {
        match self.ledger_url.as_str() {
            "" | "memory" => Ok(Arc::new(MemoryLedger::new())),
            #[cfg(feature = "sqlite")]
            url if url.starts_with("sqlite:") => {
                Ok(Arc::new(crate::ledger::SqliteLedger::open(url).await?))
            }
            other => Err(CascadeError::Config(format!(
                "unsupported ledger url {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.debounce, Duration::from_millis(50));
        assert_eq!(config.stream_capacity, None);
    }

    #[test]
    fn test_reads_variables() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("CASCADE_DEBOUNCE_MS", "120"),
            ("CASCADE_STREAM_CAPACITY", "64"),
            ("CASCADE_LEDGER_URL", "sqlite://./run.db"),
        ]))
        .unwrap();

        assert_eq!(config.debounce, Duration::from_millis(120));
        assert_eq!(config.stream_capacity, Some(64));
        assert_eq!(config.ledger_url, "sqlite://./run.db");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(EngineConfig::from_lookup(lookup(&[("CASCADE_DEBOUNCE_MS", "fast")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("CASCADE_STREAM_CAPACITY", "0")])).is_err());
    }

    #[tokio::test]
    async fn test_open_ledger() {
        let ledger = EngineConfig::default().open_ledger().await.unwrap();
        assert_eq!(ledger.release_stale_claims().await.unwrap(), 0);

        let err = EngineConfig::default()
            .with_ledger_url("postgres://nope")
            .open_ledger()
            .await;
        assert!(matches!(err, Err(CascadeError::Config(_))));
    }
}
