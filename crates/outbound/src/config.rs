//! Pipeline configuration.
//!
//! A `PipelineConfig` is built once, validated, and handed to
//! [`Pipeline::start`](crate::Pipeline::start). A running pipeline never
//! mutates it; a reconfigure request swaps in a whole new value.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::DestinationType;

use crate::error::PipelineError;
use crate::job::RetryBudget;

/// Send budget for one destination type: at most `budget` sends per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeLimit {
    pub budget: u32,
    pub window: Duration,
}

impl TypeLimit {
    pub const fn new(budget: u32, window: Duration) -> Self {
        Self { budget, window }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub enabled: bool,
    /// Indexed by [`DestinationType::index`].
    pub limits: [TypeLimit; DestinationType::COUNT],
}

impl Default for LimiterConfig {
    fn default() -> Self {
        let mut limits = [TypeLimit::new(1, Duration::from_secs(1)); DestinationType::COUNT];
        limits[DestinationType::GROUP.index()] = TypeLimit::new(20, Duration::from_secs(60));
        limits[DestinationType::CHANNEL.index()] = TypeLimit::new(20, Duration::from_secs(60));
        Self {
            enabled: true,
            limits,
        }
    }
}

impl LimiterConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn limit(&self, kind: DestinationType) -> TypeLimit {
        self.limits[kind.index()]
    }

    pub fn with_limit(mut self, kind: DestinationType, budget: u32, window: Duration) -> Self {
        self.limits[kind.index()] = TypeLimit::new(budget, window);
        self
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name used for thread names and log fields.
    pub name: String,
    /// Fixed period between dispatch attempts. `ZERO` disables pacing.
    pub pacing_interval: Duration,
    /// Sleep after an idle tick when pacing is disabled.
    pub idle_wait: Duration,
    pub limiter: LimiterConfig,
    /// How long an empty destination queue may sit idle (plus its type's decay
    /// window) before it is released.
    pub queue_lifetime: Duration,
    /// Maximum number of released queues kept for reuse.
    pub reuse_pool_size: usize,
    /// Retry budget for jobs that do not set their own.
    pub default_retries: RetryBudget,
    /// Attempts after which an unlimited-retry job is reported as overflowing.
    pub unlimited_retry_warn_threshold: u32,
    pub completion_workers: usize,
    /// Jobs a completion worker takes per lock acquisition.
    pub completion_batch_size: usize,
    /// Default panic guard for callbacks of newly built jobs.
    pub guard_callbacks: bool,
    pub intake_capacity: usize,
    pub completion_capacity: usize,
    pub destination_queue_capacity: usize,
    pub cleanup_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            pacing_interval: Duration::from_millis(35),
            idle_wait: Duration::from_millis(1),
            limiter: LimiterConfig::default(),
            queue_lifetime: Duration::from_secs(300),
            reuse_pool_size: 64,
            default_retries: RetryBudget::Limited(3),
            unlimited_retry_warn_threshold: 100,
            completion_workers: 2,
            completion_batch_size: 32,
            guard_callbacks: true,
            intake_capacity: 256,
            completion_capacity: 256,
            destination_queue_capacity: 8,
            cleanup_capacity: 256,
        }
    }
}

impl PipelineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_pacing_interval(mut self, interval: Duration) -> Self {
        self.pacing_interval = interval;
        self
    }

    pub fn with_limiter(mut self, limiter: LimiterConfig) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_queue_lifetime(mut self, lifetime: Duration) -> Self {
        self.queue_lifetime = lifetime;
        self
    }

    pub fn with_reuse_pool_size(mut self, size: usize) -> Self {
        self.reuse_pool_size = size;
        self
    }

    pub fn with_default_retries(mut self, retries: RetryBudget) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_completion_workers(mut self, workers: usize) -> Self {
        self.completion_workers = workers;
        self
    }

    pub fn with_completion_batch_size(mut self, size: usize) -> Self {
        self.completion_batch_size = size;
        self
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.completion_workers == 0 {
            return Err(PipelineError::invalid_config(
                "completion_workers must be at least 1",
            ));
        }
        if self.completion_batch_size == 0 {
            return Err(PipelineError::invalid_config(
                "completion_batch_size must be at least 1",
            ));
        }
        for (tag, limit) in self.limiter.limits.iter().enumerate() {
            if limit.budget == 0 {
                return Err(PipelineError::invalid_config(format!(
                    "send budget for destination type {tag} must be at least 1"
                )));
            }
            if limit.window.is_zero() {
                return Err(PipelineError::invalid_config(format!(
                    "decay window for destination type {tag} must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Defaults overlaid with `COURIER_*` environment variables.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Recognized keys: `COURIER_PACING_MS`, `COURIER_WORKERS`,
    /// `COURIER_LIMITER_ENABLED`, `COURIER_DEFAULT_RETRIES` (negative means
    /// unlimited) and `COURIER_QUEUE_LIFETIME_SECS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "COURIER_PACING_MS")? {
            config.pacing_interval = Duration::from_millis(ms);
        }
        if let Some(workers) = parse_var::<usize, _>(&lookup, "COURIER_WORKERS")? {
            config.completion_workers = workers;
        }
        if let Some(enabled) = parse_var::<bool, _>(&lookup, "COURIER_LIMITER_ENABLED")? {
            config.limiter.enabled = enabled;
        }
        if let Some(retries) = parse_var::<i64, _>(&lookup, "COURIER_DEFAULT_RETRIES")? {
            config.default_retries = RetryBudget::from(retries);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "COURIER_QUEUE_LIFETIME_SECS")? {
            config.queue_lifetime = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, PipelineError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipelineError::invalid_config(format!("{name}={raw:?}: {e}"))),
    }
}
