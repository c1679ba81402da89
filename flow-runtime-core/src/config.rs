use std::time::Duration;

/// Default outbox publisher tick.
const OUTBOX_POLL_MS: u64 = 10_000;

/// Default outbox batch size per tick.
const OUTBOX_BATCH: usize = 100;

/// Default failed-row retry sweep interval.
const OUTBOX_RETRY_POLL_MS: u64 = 60_000;

/// Default retention for processed outbox rows.
const OUTBOX_RETENTION_DAYS: i64 = 30;

/// Default timer registry poll interval.
const TIMER_POLL_MS: u64 = 10_000;

/// Default work-unit retry budget.
const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Default work-unit retry backoff base.
const RETRY_BACKOFF_MS: u64 = 50;

/// Tunables for the runtime and its background loops.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_retry_interval: Duration,
    pub outbox_max_retries: u32,
    pub outbox_retention_days: i64,
    pub timer_poll_interval: Duration,
    pub timer_batch_size: usize,
    /// Work-unit retry budget before an incident is raised.
    pub retry_max_attempts: u32,
    /// Base backoff between work-unit retries; doubles per attempt.
    pub retry_backoff: Duration,
    /// Connection string for the PostgreSQL driver; `None` means the
    /// deployment runs on the in-memory store.
    pub database_url: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            outbox_poll_interval: Duration::from_millis(OUTBOX_POLL_MS),
            outbox_batch_size: OUTBOX_BATCH,
            outbox_retry_interval: Duration::from_millis(OUTBOX_RETRY_POLL_MS),
            outbox_max_retries: 5,
            outbox_retention_days: OUTBOX_RETENTION_DAYS,
            timer_poll_interval: Duration::from_millis(TIMER_POLL_MS),
            timer_batch_size: 100,
            retry_max_attempts: RETRY_MAX_ATTEMPTS,
            retry_backoff: Duration::from_millis(RETRY_BACKOFF_MS),
            database_url: None,
        }
    }
}

impl RuntimeConfig {
    /// Build a config from the environment, falling back to defaults.
    /// Recognized: FLOW_OUTBOX_POLL_MS, FLOW_OUTBOX_BATCH,
    /// FLOW_OUTBOX_RETRY_POLL_MS, FLOW_OUTBOX_MAX_RETRIES,
    /// FLOW_TIMER_POLL_MS, FLOW_RETRY_MAX_ATTEMPTS, DATABASE_URL.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = env_u64("FLOW_OUTBOX_POLL_MS") {
            cfg.outbox_poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("FLOW_OUTBOX_BATCH") {
            cfg.outbox_batch_size = n as usize;
        }
        if let Some(ms) = env_u64("FLOW_OUTBOX_RETRY_POLL_MS") {
            cfg.outbox_retry_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("FLOW_OUTBOX_MAX_RETRIES") {
            cfg.outbox_max_retries = n as u32;
        }
        if let Some(ms) = env_u64("FLOW_TIMER_POLL_MS") {
            cfg.timer_poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("FLOW_RETRY_MAX_ATTEMPTS") {
            cfg.retry_max_attempts = n as u32;
        }
        cfg.database_url = env_str("DATABASE_URL");
        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_database_url() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.outbox_batch_size, OUTBOX_BATCH);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("FLOW_OUTBOX_BATCH", "7");
        std::env::set_var("FLOW_TIMER_POLL_MS", "1234");
        std::env::set_var("DATABASE_URL", " postgres://flow@localhost/flow ");
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.outbox_batch_size, 7);
        assert_eq!(cfg.timer_poll_interval, Duration::from_millis(1234));
        assert_eq!(
            cfg.database_url.as_deref(),
            Some("postgres://flow@localhost/flow")
        );
        std::env::remove_var("FLOW_OUTBOX_BATCH");
        std::env::remove_var("FLOW_TIMER_POLL_MS");
        std::env::remove_var("DATABASE_URL");
    }
}
