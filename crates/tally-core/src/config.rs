use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorKind};
use crate::provider::{
    Backoff, Capabilities, ErrorPolicy, ProviderDescriptor, RetryLimit, RetryPolicy,
};
use crate::rate_limiter::RateLimiter;
use crate::stoppable::DEFAULT_SLEEP_INCREMENT;
use crate::worker::DEFAULT_REQUEUE_DELAY;

/// Worker pool sizing and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub alias_workers: usize,
    pub poll_interval: Duration,
    pub sleep_increment: Duration,
    /// Wait before an item whose alias cycle failed is due again.
    pub alias_requeue_delay: Duration,
    /// Metrics workers per provider; providers not listed get one.
    pub metrics_workers: BTreeMap<String, usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            alias_workers: 1,
            poll_interval: Duration::from_millis(500),
            sleep_increment: DEFAULT_SLEEP_INCREMENT,
            alias_requeue_delay: DEFAULT_REQUEUE_DELAY,
            metrics_workers: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Read configuration from environment variables.
    ///
    /// - `TALLY_ALIAS_WORKERS` (optional, defaults to 1)
    /// - `TALLY_POLL_INTERVAL_MS` (optional, defaults to 500)
    /// - `TALLY_SLEEP_INCREMENT_MS` (optional, defaults to 500)
    /// - `TALLY_ALIAS_REQUEUE_DELAY_MS` (optional, defaults to 60000)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();

        let alias_workers = parse_var(&lookup, "TALLY_ALIAS_WORKERS", defaults.alias_workers)?;
        if alias_workers == 0 {
            return Err(AppError::ConfigError(
                "TALLY_ALIAS_WORKERS must be at least 1".into(),
            ));
        }

        let poll_ms = parse_var(
            &lookup,
            "TALLY_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?;
        let increment_ms = parse_var(
            &lookup,
            "TALLY_SLEEP_INCREMENT_MS",
            defaults.sleep_increment.as_millis() as u64,
        )?;
        if increment_ms == 0 {
            return Err(AppError::ConfigError(
                "TALLY_SLEEP_INCREMENT_MS must be at least 1".into(),
            ));
        }

        let requeue_ms = parse_var(
            &lookup,
            "TALLY_ALIAS_REQUEUE_DELAY_MS",
            defaults.alias_requeue_delay.as_millis() as u64,
        )?;

        Ok(Self {
            alias_workers,
            poll_interval: Duration::from_millis(poll_ms),
            sleep_increment: Duration::from_millis(increment_ms),
            alias_requeue_delay: Duration::from_millis(requeue_ms),
            metrics_workers: BTreeMap::new(),
        })
    }

    pub fn with_alias_workers(mut self, n: usize) -> Self {
        self.alias_workers = n;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_sleep_increment(mut self, increment: Duration) -> Self {
        self.sleep_increment = increment;
        self
    }

    pub fn with_alias_requeue_delay(mut self, delay: Duration) -> Self {
        self.alias_requeue_delay = delay;
        self
    }

    pub fn with_metrics_workers(mut self, provider: impl Into<String>, n: usize) -> Self {
        self.metrics_workers.insert(provider.into(), n);
        self
    }

    /// Take per-provider worker counts from a settings file.
    pub fn with_provider_settings(mut self, settings: &[ProviderSettings]) -> Self {
        for provider in settings {
            self.metrics_workers
                .insert(provider.name.clone(), provider.workers);
        }
        self
    }

    pub fn metrics_workers_for(&self, provider: &str) -> usize {
        self.metrics_workers.get(provider).copied().unwrap_or(1)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!(
                "Invalid {key} '{raw}': must be a non-negative integer"
            ))
        }),
    }
}

/// How the delay between retries of one error kind grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryType {
    Linear,
    IncrementalBackOff,
    RateLimited,
}

/// Retry settings for one error kind, as written in the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSettings {
    /// `-1` retries forever.
    #[serde(default)]
    pub retries: i64,
    /// Seconds.
    #[serde(default)]
    pub retry_delay: f64,
    #[serde(default = "default_retry_type")]
    pub retry_type: RetryType,
    /// Seconds; negative means uncapped.
    #[serde(default = "default_delay_cap")]
    pub delay_cap: f64,
}

fn default_retry_type() -> RetryType {
    RetryType::Linear
}

fn default_delay_cap() -> f64 {
    -1.0
}

impl ErrorSettings {
    pub fn to_policy(&self, provider: &str, kind: ErrorKind) -> Result<ErrorPolicy, AppError> {
        let delay = seconds(self.retry_delay).ok_or_else(|| {
            AppError::ConfigError(format!(
                "Provider '{provider}': invalid retry_delay {} for {kind}",
                self.retry_delay
            ))
        })?;

        let backoff = match self.retry_type {
            RetryType::Linear => Backoff::Linear { delay },
            RetryType::IncrementalBackOff => Backoff::Incremental {
                initial: delay,
                cap: if self.delay_cap < 0.0 {
                    None
                } else {
                    seconds(self.delay_cap)
                },
            },
            RetryType::RateLimited => Backoff::RateLimited,
        };

        Ok(ErrorPolicy::new(RetryLimit::from_config(self.retries), backoff))
    }
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub limit: u32,
    pub period_secs: f64,
}

/// One entry of the provider settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub name: String,
    /// Metrics workers for this provider.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
    #[serde(default)]
    pub errors: BTreeMap<ErrorKind, ErrorSettings>,
}

fn default_workers() -> usize {
    1
}

impl ProviderSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: default_workers(),
            rate_limit: None,
            errors: BTreeMap::new(),
        }
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, AppError> {
        self.errors
            .iter()
            .try_fold(RetryPolicy::new(), |policy, (kind, settings)| {
                Ok(policy.with(*kind, settings.to_policy(&self.name, *kind)?))
            })
    }

    pub fn rate_limiter(&self) -> Result<Option<RateLimiter>, AppError> {
        let Some(rate) = &self.rate_limit else {
            return Ok(None);
        };
        let period = seconds(rate.period_secs)
            .filter(|period| !period.is_zero())
            .ok_or_else(|| {
                AppError::ConfigError(format!(
                    "Provider '{}': rate_limit.period_secs must be positive",
                    self.name
                ))
            })?;
        Ok(Some(RateLimiter::new(rate.limit, period)))
    }

    /// Build a descriptor carrying this entry's retry policy and rate limiter.
    pub fn descriptor(&self, capabilities: Capabilities) -> Result<ProviderDescriptor, AppError> {
        let mut descriptor = ProviderDescriptor::new(self.name.clone(), capabilities)
            .with_retry_policy(self.retry_policy()?);
        if let Some(limiter) = self.rate_limiter()? {
            descriptor = descriptor.with_rate_limiter(limiter);
        }
        Ok(descriptor)
    }
}

/// Parse a provider settings document. Order is preserved.
pub fn parse_provider_settings(json: &str) -> Result<Vec<ProviderSettings>, AppError> {
    let settings: Vec<ProviderSettings> = serde_json::from_str(json)?;

    let mut seen = HashSet::new();
    for provider in &settings {
        if provider.name.trim().is_empty() {
            return Err(AppError::ConfigError("Provider name must not be empty".into()));
        }
        if !seen.insert(provider.name.as_str()) {
            return Err(AppError::ConfigError(format!(
                "Provider '{}' is configured twice",
                provider.name
            )));
        }
        // Surface bad delays at load time rather than when a worker starts.
        provider.retry_policy()?;
        provider.rate_limiter()?;
    }

    Ok(settings)
}

/// Read and parse a provider settings file.
pub fn load_provider_settings(path: &Path) -> Result<Vec<ProviderSettings>, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to read provider settings {}: {e}",
            path.display()
        ))
    })?;
    parse_provider_settings(&raw)
}
