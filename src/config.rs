//! Engine and reference-service configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Tuning knobs for the cart engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long the initial load waits for the backend before showing the local cart
    pub initial_load_timeout: Duration,

    /// Interval between periodic sync passes
    pub sync_interval: Duration,

    /// Attempts before an offline action is dropped
    pub max_retries: u32,

    /// First retry delay; doubles on every failure
    pub retry_base_delay: Duration,

    /// Upper bound for the retry delay
    pub retry_max_delay: Duration,

    /// Lifetime of the disaster-recovery backup snapshot
    pub backup_ttl: Duration,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            initial_load_timeout: Duration::from_secs(2),
            sync_interval: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            backup_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Build from `CART_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::new();
        Self {
            initial_load_timeout: env_millis("CART_INITIAL_LOAD_TIMEOUT_MS")
                .unwrap_or(defaults.initial_load_timeout),
            sync_interval: env_millis("CART_SYNC_INTERVAL_MS").unwrap_or(defaults.sync_interval),
            max_retries: std::env::var("CART_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_base_delay: env_millis("CART_RETRY_BASE_MS").unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_millis("CART_RETRY_MAX_MS").unwrap_or(defaults.retry_max_delay),
            backup_ttl: defaults.backup_ttl,
        }
    }

    pub fn with_initial_load_timeout(mut self, timeout: Duration) -> Self {
        self.initial_load_timeout = timeout;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set both ends of the exponential backoff window
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_backup_ttl(mut self, ttl: Duration) -> Self {
        self.backup_ttl = ttl;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference cart service settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
}

impl ServerConfig {
    /// Reads `CART_SERVICE_ADDR`, defaulting to `0.0.0.0:8000`
    pub fn from_env() -> Self {
        let addr = std::env::var("CART_SERVICE_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000)));
        Self { addr }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
