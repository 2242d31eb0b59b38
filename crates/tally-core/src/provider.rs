//! The provider capability interface and the per-provider retry policy.
//!
//! A provider is one external data source. It may discover aliases, supply
//! bibliographic fields, report metrics, or expand a query into member items.
//! Anything it does not offer answers [`ProviderError::NotImplemented`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ProviderError};
use crate::item::{Alias, Biblio, Item, MetricsUpdate};
use crate::rate_limiter::RateLimiter;

/// The item-level capabilities the retry engine knows how to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Aliases,
    Biblio,
    Metrics,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Aliases => "aliases",
            Capability::Biblio => "biblio",
            Capability::Metrics => "metrics",
        }
    }

    /// Call the matching provider method.
    pub async fn invoke(
        self,
        provider: &dyn Provider,
        item: &Item,
    ) -> Result<CapabilityOutput, ProviderError> {
        match self {
            Capability::Aliases => provider.aliases(item).await.map(CapabilityOutput::Aliases),
            Capability::Biblio => provider.biblio(item).await.map(CapabilityOutput::Biblio),
            Capability::Metrics => provider.metrics(item).await.map(CapabilityOutput::Metrics),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a successful capability call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityOutput {
    Aliases(Vec<Alias>),
    Biblio(Biblio),
    Metrics(MetricsUpdate),
}

impl CapabilityOutput {
    /// Merge into the in-memory item. Returns the number of new entries.
    pub fn apply(self, item: &mut Item, provider: &str, now: DateTime<Utc>) -> usize {
        let changed = match self {
            CapabilityOutput::Aliases(aliases) => item.add_aliases(aliases),
            CapabilityOutput::Biblio(biblio) => item.add_biblio(biblio),
            CapabilityOutput::Metrics(metrics) => item.add_metrics(provider, metrics, now),
        };
        if changed > 0 {
            item.touch(now);
        }
        changed
    }
}

/// Capability flags advertised by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub aliases: bool,
    pub biblio: bool,
    pub metrics: bool,
    pub members: bool,
}

/// How many retries one error kind is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Limited(u32),
    Unlimited,
}

impl RetryLimit {
    /// Negative config values mean "retry forever".
    pub fn from_config(retries: i64) -> Self {
        if retries < 0 {
            RetryLimit::Unlimited
        } else {
            RetryLimit::Limited(u32::try_from(retries).unwrap_or(u32::MAX))
        }
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        match self {
            RetryLimit::Limited(max) => failures <= *max,
            RetryLimit::Unlimited => true,
        }
    }
}

/// Delay schedule for one error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Linear { delay: Duration },
    /// `initial * 2^(attempt - 1)`, optionally capped.
    Incremental {
        initial: Duration,
        cap: Option<Duration>,
    },
    /// Wait for the provider's rate limiter without spending budget; no delay
    /// if it has none.
    RateLimited,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay(&self, attempt: u32, limiter: Option<&RateLimiter>) -> Duration {
        match self {
            Backoff::Linear { delay } => *delay,
            Backoff::Incremental { initial, cap } => {
                let exponent = attempt.saturating_sub(1).min(31);
                let delay = initial.saturating_mul(1u32 << exponent);
                match cap {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
            Backoff::RateLimited => limiter.map(RateLimiter::wait_time).unwrap_or_default(),
        }
    }
}

/// Retry budget and delay schedule for one error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub max_retries: RetryLimit,
    pub backoff: Backoff,
}

impl ErrorPolicy {
    pub fn new(max_retries: RetryLimit, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn no_retries() -> Self {
        Self::new(RetryLimit::Limited(0), Backoff::Linear { delay: Duration::ZERO })
    }

    /// Defaults applied to any kind a provider does not configure.
    ///
    /// Timeouts and transport errors get three quick retries, rate limiting
    /// is retried forever with a doubling delay capped at 256s, and
    /// everything else fails immediately.
    pub fn default_for(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::HttpTimeout | ErrorKind::HttpError => Self::new(
                RetryLimit::Limited(3),
                Backoff::Linear {
                    delay: Duration::from_millis(100),
                },
            ),
            ErrorKind::RateLimitReached => Self::new(
                RetryLimit::Unlimited,
                Backoff::Incremental {
                    initial: Duration::from_secs(1),
                    cap: Some(Duration::from_secs(256)),
                },
            ),
            ErrorKind::ClientServerError
            | ErrorKind::ContentMalformed
            | ErrorKind::ValidationFailed => Self::no_retries(),
        }
    }
}

/// Per-kind retry policy for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    overrides: BTreeMap<ErrorKind, ErrorPolicy>,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ErrorKind, policy: ErrorPolicy) -> Self {
        self.overrides.insert(kind, policy);
        self
    }

    pub fn policy(&self, kind: ErrorKind) -> ErrorPolicy {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| ErrorPolicy::default_for(kind))
    }
}

/// Static description of a provider: identity, capabilities, retry policy and
/// optional rate limiter.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub capabilities: Capabilities,
    pub retry_policy: RetryPolicy,
    pub rate_limiter: Option<RateLimiter>,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
            retry_policy: RetryPolicy::default(),
            rate_limiter: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn provides_aliases(&self) -> bool {
        self.capabilities.aliases
    }

    pub fn provides_biblio(&self) -> bool {
        self.capabilities.biblio
    }

    pub fn provides_metrics(&self) -> bool {
        self.capabilities.metrics
    }

    pub fn provides_members(&self) -> bool {
        self.capabilities.members
    }

    pub fn max_retries(&self, kind: ErrorKind) -> RetryLimit {
        self.retry_policy.policy(kind).max_retries
    }

    pub fn backoff(&self, kind: ErrorKind, attempt: u32) -> Duration {
        self.retry_policy
            .policy(kind)
            .backoff
            .delay(attempt, self.rate_limiter.as_ref())
    }
}

/// One external data source.
///
/// Every capability defaults to [`ProviderError::NotImplemented`]; providers
/// override the ones they support and map their internal failures into
/// [`ProviderError`] at this boundary.
#[async_trait]
pub trait Provider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Expand a query (account name, DOI, ...) into the aliases of its members.
    async fn member_items(&self, _query: &str) -> Result<Vec<Alias>, ProviderError> {
        Err(ProviderError::NotImplemented)
    }

    /// New aliases for `item`.
    async fn aliases(&self, _item: &Item) -> Result<Vec<Alias>, ProviderError> {
        Err(ProviderError::NotImplemented)
    }

    async fn biblio(&self, _item: &Item) -> Result<Biblio, ProviderError> {
        Err(ProviderError::NotImplemented)
    }

    /// Current metric values keyed by provider-local metric name.
    async fn metrics(&self, _item: &Item) -> Result<MetricsUpdate, ProviderError> {
        Err(ProviderError::NotImplemented)
    }

    fn max_retries(&self, kind: ErrorKind) -> RetryLimit {
        self.descriptor().max_retries(kind)
    }

    fn backoff(&self, kind: ErrorKind, attempt: u32) -> Duration {
        self.descriptor().backoff(kind, attempt)
    }
}
