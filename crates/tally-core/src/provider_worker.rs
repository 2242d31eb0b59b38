//! The retry engine shared by alias and metrics workers.
//!
//! [`ProviderWorker`] calls one capability of one provider for one item until
//! it succeeds, the provider reports the capability missing, the per-kind
//! retry budget runs out, an unclassified error occurs, or a stop is
//! requested. Retry counters live only for the duration of a single run.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;

use crate::error::{ErrorKind, ProviderError};
use crate::item::Item;
use crate::provider::{Capability, CapabilityOutput, Provider};
use crate::stoppable::{DEFAULT_SLEEP_INCREMENT, StoppableTask};
use crate::worker::{WorkerEvent, WorkerReporter};

/// One failed provider call, as reported to the worker's reporter.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub provider: String,
    pub capability: Capability,
    pub tiid: String,
    /// `None` for unclassified failures and panics.
    pub kind: Option<ErrorKind>,
    pub message: String,
    /// Consecutive failures of this kind so far, including this one.
    pub attempt: u32,
    pub backtrace: Option<String>,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn is_fatal(&self) -> bool {
        self.kind.is_none()
    }

    pub fn kind_label(&self) -> &'static str {
        self.kind.map_or("fatal", |kind| kind.as_str())
    }
}

/// How a single capability run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The call succeeded and its output was merged into the item.
    Applied { changed: usize },
    /// The provider does not offer this capability.
    NotImplemented,
    /// `kind` failed more often than its retry budget allows.
    Exhausted { kind: ErrorKind, attempts: u32 },
    /// Unclassified error or panic. Never retried.
    Fatal { message: String },
    /// A stop was requested before the run could finish.
    Stopped,
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            InvocationOutcome::Applied { .. } | InvocationOutcome::NotImplemented
        )
    }
}

/// Runs one capability of one provider against one item.
pub struct ProviderWorker<'a> {
    provider: &'a dyn Provider,
    capability: Capability,
    task: &'a StoppableTask,
    sleep_increment: Duration,
}

impl<'a> ProviderWorker<'a> {
    pub fn new(provider: &'a dyn Provider, capability: Capability, task: &'a StoppableTask) -> Self {
        Self {
            provider,
            capability,
            task,
            sleep_increment: DEFAULT_SLEEP_INCREMENT,
        }
    }

    pub fn with_sleep_increment(mut self, increment: Duration) -> Self {
        self.sleep_increment = increment;
        self
    }

    /// Retry until a terminal outcome. On success the provider's output has
    /// already been applied to `item` in memory; nothing is persisted here.
    pub async fn run<R>(&self, item: &mut Item, reporter: &R) -> InvocationOutcome
    where
        R: WorkerReporter + ?Sized,
    {
        let mut failures: HashMap<ErrorKind, u32> = HashMap::new();

        loop {
            if self.task.stopped() {
                return InvocationOutcome::Stopped;
            }

            let result = self.invoke(item).await;

            if let Some(limiter) = &self.provider.descriptor().rate_limiter {
                let pause = limiter.sleep_time();
                if !pause.is_zero() {
                    tracing::trace!(
                        provider = self.provider.name(),
                        window_requests = limiter.request_count(),
                        pause_ms = pause.as_millis() as u64,
                        "Rate limiter pause"
                    );
                }
                // An interrupted pause is picked up by the stop checks below.
                self.task.interruptible_sleep(pause, self.sleep_increment).await;
            }

            match result {
                Ok(output) => {
                    let changed = output.apply(item, self.provider.name(), Utc::now());
                    tracing::debug!(
                        tiid = %item.tiid,
                        provider = self.provider.name(),
                        capability = %self.capability,
                        changed,
                        "Capability applied"
                    );
                    return InvocationOutcome::Applied { changed };
                }
                Err(ProviderError::NotImplemented) => {
                    tracing::trace!(
                        tiid = %item.tiid,
                        provider = self.provider.name(),
                        capability = %self.capability,
                        "Capability not implemented"
                    );
                    return InvocationOutcome::NotImplemented;
                }
                Err(ProviderError::Recoverable { kind, message }) => {
                    let count = failures.entry(kind).or_insert(0);
                    *count += 1;
                    let attempt = *count;

                    let record = self.record(item, Some(kind), message, attempt, None);
                    reporter.report(WorkerEvent::ProviderFailed { record: &record });

                    if !self.provider.max_retries(kind).allows_retry(attempt) {
                        return InvocationOutcome::Exhausted {
                            kind,
                            attempts: attempt,
                        };
                    }

                    let delay = self.provider.backoff(kind, attempt);
                    tracing::debug!(
                        tiid = %item.tiid,
                        provider = self.provider.name(),
                        capability = %self.capability,
                        %kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after backoff"
                    );
                    if !self
                        .task
                        .interruptible_sleep(delay, self.sleep_increment)
                        .await
                    {
                        return InvocationOutcome::Stopped;
                    }
                }
                Err(ProviderError::Fatal(message)) => {
                    let backtrace = capture_backtrace();
                    let record = self.record(item, None, message.clone(), 1, backtrace);
                    reporter.report(WorkerEvent::ProviderFailed { record: &record });
                    return InvocationOutcome::Fatal { message };
                }
            }
        }
    }

    async fn invoke(&self, item: &Item) -> Result<CapabilityOutput, ProviderError> {
        let call = self.capability.invoke(self.provider, item);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(ProviderError::Fatal(format!(
                "provider panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    fn record(
        &self,
        item: &Item,
        kind: Option<ErrorKind>,
        message: String,
        attempt: u32,
        backtrace: Option<String>,
    ) -> ErrorRecord {
        ErrorRecord {
            provider: self.provider.name().to_string(),
            capability: self.capability,
            tiid: item.tiid.clone(),
            kind,
            message,
            attempt,
            backtrace,
            at: Utc::now(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn capture_backtrace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}
