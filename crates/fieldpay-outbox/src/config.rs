//! Worker configuration

use serde::{Deserialize, Serialize};

/// Configuration shared by the dispatcher and workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Messages claimed per drain pass
    pub batch_size: usize,
    /// Poll interval between drain passes, in milliseconds
    pub poll_interval_ms: u64,
    /// Attempts before a message is dead-lettered
    pub max_attempts: u32,
    /// Timeout for one delivery push, in milliseconds
    pub delivery_timeout_ms: u64,
    /// Seconds without a heartbeat before an executing job is stalled
    pub heartbeat_timeout_secs: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            poll_interval_ms: 500,
            max_attempts: 5,
            delivery_timeout_ms: 5_000,
            heartbeat_timeout_secs: 90,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            batch_size: env_or("FIELDPAY_WORKER_BATCH_SIZE", default.batch_size),
            poll_interval_ms: env_or("FIELDPAY_WORKER_POLL_INTERVAL_MS", default.poll_interval_ms),
            max_attempts: env_or("FIELDPAY_WORKER_MAX_ATTEMPTS", default.max_attempts),
            delivery_timeout_ms: env_or(
                "FIELDPAY_DELIVERY_TIMEOUT_MS",
                default.delivery_timeout_ms,
            ),
            heartbeat_timeout_secs: env_or(
                "FIELDPAY_HEARTBEAT_TIMEOUT_SECS",
                default.heartbeat_timeout_secs,
            ),
        }
    }
}

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
