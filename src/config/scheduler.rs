//! Scheduler configuration: JSON, environment variables, or builder methods.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::WorkerPoolConfig;
use crate::core::environment::DEFAULT_STORAGE_LOW_THRESHOLD;
use crate::core::AppResult;

/// Prefix of every environment variable read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "DEFERRED_WORK_";

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool sizing.
    pub pool: WorkerPoolConfig,
    /// Interval between timer-driven ticks of the dispatch loop.
    pub tick_interval_ms: u64,
    /// Default execution timeout for one-shot tasks.
    pub one_shot_timeout_ms: u64,
    /// Default execution timeout for periodic tasks.
    pub periodic_timeout_ms: u64,
    /// How long a timed-out executor may take to honour its cancellation token.
    pub cancel_grace_ms: u64,
    /// Upper bound on any retry delay.
    pub backoff_ceiling_ms: u64,
    /// How long a record may wait without ever running before it expires.
    /// `None` disables expiry.
    pub max_pending_lifetime_secs: Option<u64>,
    /// Free storage (bytes) below which storage counts as low.
    pub storage_low_threshold_bytes: u64,
    /// Events kept by the in-memory audit trail, when one is enabled.
    pub audit_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool: WorkerPoolConfig::default(),
            tick_interval_ms: 1_000,
            one_shot_timeout_ms: 10 * 60 * 1_000,
            periodic_timeout_ms: 30 * 1_000,
            cancel_grace_ms: 2_000,
            backoff_ceiling_ms: 60 * 60 * 1_000,
            max_pending_lifetime_secs: Some(24 * 60 * 60),
            storage_low_threshold_bytes: DEFAULT_STORAGE_LOW_THRESHOLD,
            audit_capacity: 1_024,
        }
    }
}

impl SchedulerConfig {
    /// Set the worker pool configuration.
    #[must_use]
    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.pool.worker_count = worker_count;
        self.pool.max_queue_depth = worker_count;
        self
    }

    /// Set the dispatch loop tick interval.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = crate::util::duration_ms(interval);
        self
    }

    /// Set the default timeout for one-shot tasks.
    #[must_use]
    pub fn with_one_shot_timeout(mut self, timeout: Duration) -> Self {
        self.one_shot_timeout_ms = crate::util::duration_ms(timeout);
        self
    }

    /// Set the default timeout for periodic tasks.
    #[must_use]
    pub fn with_periodic_timeout(mut self, timeout: Duration) -> Self {
        self.periodic_timeout_ms = crate::util::duration_ms(timeout);
        self
    }

    /// Set the cancellation grace period.
    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_ms = crate::util::duration_ms(grace);
        self
    }

    /// Set the retry delay ceiling.
    #[must_use]
    pub fn with_backoff_ceiling(mut self, ceiling: Duration) -> Self {
        self.backoff_ceiling_ms = crate::util::duration_ms(ceiling);
        self
    }

    /// Set (or disable, with `None`) the maximum pending lifetime. Partial
    /// seconds round up.
    #[must_use]
    pub fn with_max_pending_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_pending_lifetime_secs =
            lifetime.map(|lifetime| crate::util::duration_ms(lifetime).div_ceil(1_000));
        self
    }

    /// Set the low-storage threshold in bytes.
    #[must_use]
    pub const fn with_storage_low_threshold(mut self, bytes: u64) -> Self {
        self.storage_low_threshold_bytes = bytes;
        self
    }

    /// Set the in-memory audit trail capacity.
    #[must_use]
    pub const fn with_audit_capacity(mut self, capacity: usize) -> Self {
        self.audit_capacity = capacity;
        self
    }

    /// Tick interval as a duration.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// One-shot default timeout.
    #[must_use]
    pub const fn one_shot_timeout(&self) -> Duration {
        Duration::from_millis(self.one_shot_timeout_ms)
    }

    /// Periodic default timeout.
    #[must_use]
    pub const fn periodic_timeout(&self) -> Duration {
        Duration::from_millis(self.periodic_timeout_ms)
    }

    /// Cancellation grace period.
    #[must_use]
    pub const fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Retry delay ceiling.
    #[must_use]
    pub const fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms)
    }

    /// Maximum pending lifetime, if expiry is enabled.
    #[must_use]
    pub const fn max_pending_lifetime(&self) -> Option<Duration> {
        match self.max_pending_lifetime_secs {
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        }
    }

    /// Validate all values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        self.pool
            .validate()
            .map_err(|e| format!("pool invalid: {e}"))?;
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than 0".into());
        }
        if self.one_shot_timeout_ms == 0 {
            return Err("one_shot_timeout_ms must be greater than 0".into());
        }
        if self.periodic_timeout_ms == 0 {
            return Err("periodic_timeout_ms must be greater than 0".into());
        }
        if self.backoff_ceiling_ms == 0 {
            return Err("backoff_ceiling_ms must be greater than 0".into());
        }
        if self.audit_capacity == 0 {
            return Err("audit_capacity must be greater than 0".into());
        }
        if self.max_pending_lifetime_secs == Some(0) {
            return Err("max_pending_lifetime_secs must be greater than 0 when set".into());
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `DEFERRED_WORK_*` environment variables,
    /// loading a `.env` file first if one exists. Unset variables keep their
    /// defaults; `DEFERRED_WORK_MAX_PENDING_LIFETIME_SECS=0` disables expiry.
    ///
    /// # Errors
    ///
    /// Fails when a variable does not parse or the result does not validate.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();

        if let Some(workers) = env_var::<usize>("WORKERS")? {
            cfg = cfg.with_worker_count(workers);
        }
        if let Some(depth) = env_var("QUEUE_DEPTH")? {
            cfg.pool.max_queue_depth = depth;
        }
        if let Some(stack) = env_var("THREAD_STACK_SIZE")? {
            cfg.pool.thread_stack_size = stack;
        }
        if let Some(ms) = env_var("TICK_INTERVAL_MS")? {
            cfg.tick_interval_ms = ms;
        }
        if let Some(ms) = env_var("ONE_SHOT_TIMEOUT_MS")? {
            cfg.one_shot_timeout_ms = ms;
        }
        if let Some(ms) = env_var("PERIODIC_TIMEOUT_MS")? {
            cfg.periodic_timeout_ms = ms;
        }
        if let Some(ms) = env_var("CANCEL_GRACE_MS")? {
            cfg.cancel_grace_ms = ms;
        }
        if let Some(ms) = env_var("BACKOFF_CEILING_MS")? {
            cfg.backoff_ceiling_ms = ms;
        }
        if let Some(secs) = env_var::<u64>("MAX_PENDING_LIFETIME_SECS")? {
            cfg.max_pending_lifetime_secs = (secs > 0).then_some(secs);
        }
        if let Some(bytes) = env_var("STORAGE_LOW_THRESHOLD_BYTES")? {
            cfg.storage_low_threshold_bytes = bytes;
        }
        if let Some(capacity) = env_var("AUDIT_CAPACITY")? {
            cfg.audit_capacity = capacity;
        }

        cfg.validate()
            .map_err(anyhow::Error::msg)
            .context("scheduler configuration from environment is invalid")?;
        Ok(cfg)
    }
}

fn env_var<T>(suffix: &str) -> AppResult<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    match std::env::var(&key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key}={raw:?} is not valid")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("{key} is not readable")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.backoff_ceiling(), Duration::from_secs(3600));
        assert_eq!(cfg.max_pending_lifetime(), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn builder_methods_apply() {
        let cfg = SchedulerConfig::default()
            .with_worker_count(3)
            .with_tick_interval(Duration::from_millis(50))
            .with_cancel_grace(Duration::from_millis(10))
            .with_max_pending_lifetime(None);
        assert_eq!(cfg.pool.worker_count, 3);
        assert_eq!(cfg.pool.max_queue_depth, 3);
        assert_eq!(cfg.tick_interval(), Duration::from_millis(50));
        assert_eq!(cfg.cancel_grace(), Duration::from_millis(10));
        assert_eq!(cfg.max_pending_lifetime(), None);
    }

    #[test]
    fn sub_second_durations_survive_builders() {
        let cfg = SchedulerConfig::default()
            .with_one_shot_timeout(Duration::from_millis(500))
            .with_periodic_timeout(Duration::from_millis(250))
            .with_backoff_ceiling(Duration::from_millis(1_500))
            .with_max_pending_lifetime(Some(Duration::from_millis(1_200)));
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.one_shot_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.periodic_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.backoff_ceiling(), Duration::from_millis(1_500));
        assert_eq!(cfg.max_pending_lifetime(), Some(Duration::from_secs(2)));
    }

    // Environment variables are process-wide, so every env case lives in one test.
    #[test]
    fn env_overrides_and_errors() {
        std::env::set_var("DEFERRED_WORK_WORKERS", "6");
        std::env::set_var("DEFERRED_WORK_MAX_PENDING_LIFETIME_SECS", "0");
        let cfg = SchedulerConfig::from_env();
        std::env::remove_var("DEFERRED_WORK_WORKERS");
        std::env::remove_var("DEFERRED_WORK_MAX_PENDING_LIFETIME_SECS");

        let cfg = cfg.unwrap();
        assert_eq!(cfg.pool.worker_count, 6);
        assert_eq!(cfg.max_pending_lifetime_secs, None);

        std::env::set_var("DEFERRED_WORK_CANCEL_GRACE_MS", "soon");
        let err = SchedulerConfig::from_env().unwrap_err();
        std::env::remove_var("DEFERRED_WORK_CANCEL_GRACE_MS");
        assert!(format!("{err:#}").contains("DEFERRED_WORK_CANCEL_GRACE_MS"));
    }
}
