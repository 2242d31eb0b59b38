//! Test utilities: scripted providers, recording reporters and store wrappers.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{AppError, ErrorKind, ProviderError};
use crate::item::{Alias, Biblio, Item, MetricsUpdate};
use crate::provider::{Capabilities, Capability, Provider, ProviderDescriptor, RetryPolicy};
use crate::provider_worker::ErrorRecord;
use crate::rate_limiter::RateLimiter;
use crate::traits::{ItemStore, SaveOutcome};
use crate::work_queue::QueueSelector;
use crate::worker::{WorkerEvent, WorkerReporter};

/// A fresh item waiting for alias discovery.
pub fn pending_item() -> Item {
    Item::new(Utc::now())
}

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

/// One scripted answer to a capability call.
#[derive(Debug, Clone)]
pub enum Step {
    Aliases(Vec<Alias>),
    Biblio(Biblio),
    Metrics(MetricsUpdate),
    Fail(ErrorKind),
    Fatal(String),
    Panic(String),
}

/// Provider that answers from per-capability scripts.
///
/// Each call pops the next scripted step. Once a script runs dry the
/// capability falls back to its `repeat` step, or to `NotImplemented`.
/// Clones share scripts and call counters. With a latency set, every call
/// sleeps first, which keeps an item in flight long enough for a second
/// worker to look at it.
#[derive(Clone)]
pub struct ScriptedProvider {
    descriptor: ProviderDescriptor,
    scripts: Arc<Mutex<HashMap<Capability, VecDeque<Step>>>>,
    repeats: HashMap<Capability, Step>,
    calls: Arc<Mutex<HashMap<Capability, usize>>>,
    latency: Duration,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(
                name,
                Capabilities {
                    aliases: true,
                    biblio: true,
                    ..Default::default()
                },
            ),
            scripts: Arc::new(Mutex::new(HashMap::new())),
            repeats: HashMap::new(),
            calls: Arc::new(Mutex::new(HashMap::new())),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.descriptor.capabilities = capabilities;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.descriptor.retry_policy = policy;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.descriptor.rate_limiter = Some(limiter);
        self
    }

    pub fn script(self, capability: Capability, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(capability)
            .or_default()
            .extend(steps);
        self
    }

    pub fn repeat(mut self, capability: Capability, step: Step) -> Self {
        self.repeats.insert(capability, step);
        self
    }

    pub fn repeat_failure(self, capability: Capability, kind: ErrorKind) -> Self {
        self.repeat(capability, Step::Fail(kind))
    }

    pub fn calls(&self, capability: Capability) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&capability)
            .copied()
            .unwrap_or(0)
    }

    fn next_step(&self, capability: Capability) -> Option<Step> {
        *self.calls.lock().unwrap().entry(capability).or_insert(0) += 1;
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&capability)
            .and_then(VecDeque::pop_front);
        scripted.or_else(|| self.repeats.get(&capability).cloned())
    }

    async fn answer<T>(
        &self,
        capability: Capability,
        extract: impl FnOnce(Step) -> Option<T>,
    ) -> Result<T, ProviderError> {
        let step = self.next_step(capability);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match step {
            None => Err(ProviderError::NotImplemented),
            Some(Step::Fail(kind)) => Err(ProviderError::new(kind, "scripted failure")),
            Some(Step::Fatal(message)) => Err(ProviderError::Fatal(message)),
            Some(Step::Panic(message)) => panic!("{message}"),
            Some(step) => extract(step).ok_or_else(|| {
                ProviderError::Fatal(format!("scripted step does not answer {capability}"))
            }),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn aliases(&self, _item: &Item) -> Result<Vec<Alias>, ProviderError> {
        self.answer(Capability::Aliases, |step| match step {
            Step::Aliases(aliases) => Some(aliases),
            _ => None,
        })
        .await
    }

    async fn biblio(&self, _item: &Item) -> Result<Biblio, ProviderError> {
        self.answer(Capability::Biblio, |step| match step {
            Step::Biblio(biblio) => Some(biblio),
            _ => None,
        })
        .await
    }

    async fn metrics(&self, _item: &Item) -> Result<MetricsUpdate, ProviderError> {
        self.answer(Capability::Metrics, |step| match step {
            Step::Metrics(metrics) => Some(metrics),
            _ => None,
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Recorded {
    lifecycle: Vec<String>,
    processed: Vec<(String, bool)>,
    error_records: Vec<ErrorRecord>,
    store_errors: usize,
}

/// Reporter that keeps the events tests assert on.
#[derive(Default, Clone)]
pub struct RecordingReporter {
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `started:<id>` / `stopped:<id>` in arrival order.
    pub fn lifecycle(&self) -> Vec<String> {
        self.recorded.lock().unwrap().lifecycle.clone()
    }

    /// `(tiid, succeeded)` per processed item.
    pub fn processed(&self) -> Vec<(String, bool)> {
        self.recorded.lock().unwrap().processed.clone()
    }

    pub fn error_records(&self) -> Vec<ErrorRecord> {
        self.recorded.lock().unwrap().error_records.clone()
    }

    pub fn store_errors(&self) -> usize {
        self.recorded.lock().unwrap().store_errors
    }
}

impl WorkerReporter for RecordingReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let mut recorded = self.recorded.lock().unwrap();
        match event {
            WorkerEvent::Started { worker_id } => {
                recorded.lifecycle.push(format!("started:{worker_id}"));
            }
            WorkerEvent::Stopped { worker_id } => {
                recorded.lifecycle.push(format!("stopped:{worker_id}"));
            }
            WorkerEvent::ItemProcessed {
                tiid, succeeded, ..
            } => recorded.processed.push((tiid.to_string(), succeeded)),
            WorkerEvent::ProviderFailed { record } => recorded.error_records.push(record.clone()),
            WorkerEvent::StoreError { .. } => recorded.store_errors += 1,
            WorkerEvent::Polling { .. } | WorkerEvent::ItemDequeued { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Store wrappers
// ---------------------------------------------------------------------------

/// Store whose `view` keeps returning a fixed list, like a lagging index.
#[derive(Clone)]
pub struct StaleViewStore<S> {
    inner: S,
    listed: Vec<String>,
}

impl<S: ItemStore> StaleViewStore<S> {
    pub fn new(inner: S, listed: Vec<String>) -> Self {
        Self { inner, listed }
    }
}

impl<S: ItemStore> ItemStore for StaleViewStore<S> {
    async fn get(&self, tiid: &str) -> Result<Option<Item>, AppError> {
        self.inner.get(tiid).await
    }

    async fn insert(&self, item: &Item) -> Result<Item, AppError> {
        self.inner.insert(item).await
    }

    async fn try_save(&self, item: &Item) -> Result<SaveOutcome, AppError> {
        self.inner.try_save(item).await
    }

    async fn view(&self, _selector: &QueueSelector, limit: usize) -> Result<Vec<String>, AppError> {
        Ok(self.listed.iter().take(limit).cloned().collect())
    }

    async fn count(&self, _selector: &QueueSelector) -> Result<u64, AppError> {
        Ok(self.listed.len() as u64)
    }

    async fn find_by_alias(&self, alias: &Alias) -> Result<Option<String>, AppError> {
        self.inner.find_by_alias(alias).await
    }
}

/// Store that fails every operation.
#[derive(Clone, Copy)]
pub struct FailingStore;

impl FailingStore {
    fn error() -> AppError {
        AppError::DatabaseError("connection refused".into())
    }
}

impl ItemStore for FailingStore {
    async fn get(&self, _tiid: &str) -> Result<Option<Item>, AppError> {
        Err(Self::error())
    }

    async fn insert(&self, _item: &Item) -> Result<Item, AppError> {
        Err(Self::error())
    }

    async fn try_save(&self, _item: &Item) -> Result<SaveOutcome, AppError> {
        Err(Self::error())
    }

    async fn view(&self, _selector: &QueueSelector, _limit: usize) -> Result<Vec<String>, AppError> {
        Err(Self::error())
    }

    async fn count(&self, _selector: &QueueSelector) -> Result<u64, AppError> {
        Err(Self::error())
    }

    async fn find_by_alias(&self, _alias: &Alias) -> Result<Option<String>, AppError> {
        Err(Self::error())
    }
}
