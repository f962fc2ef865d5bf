//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Environment override for the busy timeout, in milliseconds.
pub const ENV_BUSY_TIMEOUT_MS: &str = "VYBE_BUSY_TIMEOUT_MS";

/// Default busy timeout applied when no override is present.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Configuration for opening a [`crate::store::Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the primary store file. WAL siblings and the migration lock
    /// file live next to it.
    pub path: PathBuf,
    /// How long a writer blocks on contention before surfacing a retryable
    /// busy error.
    pub busy_timeout: Duration,
    /// Apply pending migrations on open. When false, open fails with
    /// `SCHEMA_MISMATCH` if the store is not at the latest version.
    pub auto_migrate: bool,
    /// Backoff policy for the retry kernel.
    pub retry: crate::store::RetryPolicy,
}

impl StoreConfig {
    /// Configuration for the store at `path`, honouring the
    /// `VYBE_BUSY_TIMEOUT_MS` environment override.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_millis(busy_timeout_from_env()),
            auto_migrate: true,
            retry: crate::store::RetryPolicy::default(),
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_auto_migrate(mut self, auto_migrate: bool) -> Self {
        self.auto_migrate = auto_migrate;
        self
    }
}

fn busy_timeout_from_env() -> u64 {
    match std::env::var(ENV_BUSY_TIMEOUT_MS) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => ms,
            _ => {
                tracing::warn!(
                    value = %raw,
                    "ignoring invalid {ENV_BUSY_TIMEOUT_MS}; using default"
                );
                DEFAULT_BUSY_TIMEOUT_MS
            }
        },
        Err(_) => DEFAULT_BUSY_TIMEOUT_MS,
    }
}
