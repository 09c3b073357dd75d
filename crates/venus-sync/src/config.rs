use std::time::Duration;

/// Default bound on a single fence wait performed by a retirement worker.
pub const DEFAULT_FENCE_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default size of the per-device ring table. Slot 0 is reserved ("no ring").
pub const DEFAULT_RING_COUNT: usize = 64;

pub const MAX_RING_COUNT: usize = 1024;

pub const DEFAULT_WORKER_NAME_PREFIX: &str = "venus-queue";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// Upper bound on one blocking fence wait; timeouts are retried, never reported.
    pub fence_wait_timeout: Duration,
    /// Number of ring slots, including the reserved slot 0.
    pub ring_count: usize,
    /// Retirement worker threads are named `{worker_name_prefix}-{ctx_id}`.
    pub worker_name_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fence_wait_timeout: DEFAULT_FENCE_WAIT_TIMEOUT,
            ring_count: DEFAULT_RING_COUNT,
            worker_name_prefix: DEFAULT_WORKER_NAME_PREFIX.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(raw) = lookup("VENUS_SYNC_FENCE_WAIT_TIMEOUT_MS") {
            let ms = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or(ConfigError::InvalidEnv("VENUS_SYNC_FENCE_WAIT_TIMEOUT_MS"))?;
            cfg.fence_wait_timeout = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup("VENUS_SYNC_RING_COUNT") {
            cfg.ring_count = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| (2..=MAX_RING_COUNT).contains(n))
                .ok_or(ConfigError::InvalidEnv("VENUS_SYNC_RING_COUNT"))?;
        }

        if let Some(raw) = lookup("VENUS_SYNC_WORKER_NAME_PREFIX") {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(ConfigError::InvalidEnv("VENUS_SYNC_WORKER_NAME_PREFIX"));
            }
            cfg.worker_name_prefix = raw.to_string();
        }

        Ok(cfg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidEnv(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEnv(var) => write!(f, "invalid value for env var {var}"),
        }
    }
}

impl std::error::Error for ConfigError {}
