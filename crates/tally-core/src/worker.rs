use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;

use crate::error::AppError;
use crate::item::Item;
use crate::provider::{Capability, Provider};
use crate::provider_worker::{ErrorRecord, InvocationOutcome, ProviderWorker};
use crate::stoppable::{DEFAULT_SLEEP_INCREMENT, StoppableTask};
use crate::work_queue::WorkQueue;

/// Events emitted by workers for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling {
        worker_id: &'a str,
    },
    ItemDequeued {
        worker_id: &'a str,
        tiid: &'a str,
    },
    ProviderFailed {
        record: &'a ErrorRecord,
    },
    ItemProcessed {
        worker_id: &'a str,
        tiid: &'a str,
        succeeded: bool,
    },
    StoreError {
        worker_id: &'a str,
        error: &'a AppError,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling { worker_id } => {
                tracing::trace!(%worker_id, "Polling queue");
            }
            WorkerEvent::ItemDequeued { worker_id, tiid } => {
                tracing::debug!(%worker_id, %tiid, "Item dequeued");
            }
            WorkerEvent::ProviderFailed { record } => match &record.backtrace {
                Some(backtrace) => tracing::error!(
                    tiid = %record.tiid,
                    provider = %record.provider,
                    capability = %record.capability,
                    kind = record.kind_label(),
                    attempt = record.attempt,
                    error = %record.message,
                    %backtrace,
                    "Provider failed"
                ),
                None if record.is_fatal() => tracing::error!(
                    tiid = %record.tiid,
                    provider = %record.provider,
                    capability = %record.capability,
                    kind = record.kind_label(),
                    error = %record.message,
                    "Provider failed"
                ),
                None => tracing::warn!(
                    tiid = %record.tiid,
                    provider = %record.provider,
                    capability = %record.capability,
                    kind = record.kind_label(),
                    attempt = record.attempt,
                    error = %record.message,
                    "Provider failed"
                ),
            },
            WorkerEvent::ItemProcessed {
                worker_id,
                tiid,
                succeeded,
            } => {
                if succeeded {
                    tracing::info!(%worker_id, %tiid, "Item processed");
                } else {
                    tracing::warn!(%worker_id, %tiid, "Item processed with failures");
                }
            }
            WorkerEvent::StoreError { worker_id, error } => {
                tracing::error!(
                    %worker_id,
                    %error,
                    retryable = error.is_retryable(),
                    "Item store error"
                );
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Timing knobs shared by every worker kind.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Sleep after finding the queue empty. Doubled after a store error.
    pub poll_interval: Duration,
    /// Slice length for every interruptible sleep.
    pub sleep_increment: Duration,
    /// How long an item whose alias cycle failed waits before it is due again.
    pub requeue_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            poll_interval: Duration::from_millis(500),
            sleep_increment: DEFAULT_SLEEP_INCREMENT,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
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

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }
}

/// A worker that drains one [`WorkQueue`], one item at a time.
pub trait QueueWorker: Send + Sync + 'static {
    type Queue: WorkQueue;

    fn config(&self) -> &WorkerConfig;

    fn queue(&self) -> &Self::Queue;

    /// Run the providers against a dequeued item and persist the result.
    fn process(
        &self,
        item: Item,
        task: &StoppableTask,
        reporter: &dyn WorkerReporter,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn worker_id(&self) -> &str {
        &self.config().worker_id
    }
}

/// Drain the worker's queue until `task` is stopped.
///
/// Store errors are reported and followed by a doubled poll sleep; provider
/// failures are handled inside `process`. Neither ends the loop.
pub async fn run_worker<W: QueueWorker>(
    worker: &W,
    task: &StoppableTask,
    reporter: &dyn WorkerReporter,
) {
    let config = worker.config();
    let worker_id = config.worker_id.as_str();
    reporter.report(WorkerEvent::Started { worker_id });

    while !task.stopped() {
        reporter.report(WorkerEvent::Polling { worker_id });

        let pause = match worker.queue().peek().await {
            Ok(Some(item)) => {
                reporter.report(WorkerEvent::ItemDequeued {
                    worker_id,
                    tiid: &item.tiid,
                });
                match worker.process(item, task, reporter).await {
                    Ok(()) => None,
                    Err(error) => {
                        reporter.report(WorkerEvent::StoreError {
                            worker_id,
                            error: &error,
                        });
                        Some(config.poll_interval * 2)
                    }
                }
            }
            Ok(None) => Some(config.poll_interval),
            Err(error) => {
                reporter.report(WorkerEvent::StoreError {
                    worker_id,
                    error: &error,
                });
                Some(config.poll_interval * 2)
            }
        };

        if let Some(pause) = pause {
            task.interruptible_sleep(pause, config.sleep_increment).await;
        }
    }

    reporter.report(WorkerEvent::Stopped { worker_id });
}

/// Handle to a spawned worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: String,
    task: StoppableTask,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Request a stop. The worker exits after its current sleep slice or
    /// provider call.
    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker to exit.
    pub async fn join(self) -> Result<(), AppError> {
        self.join
            .await
            .map_err(|e| AppError::Generic(format!("Worker {} panicked: {}", self.worker_id, e)))
    }
}

/// Spawn `worker` onto the runtime. It runs until `task` (or a parent of it)
/// is stopped.
pub fn spawn_worker<W: QueueWorker>(
    worker: W,
    task: StoppableTask,
    reporter: Arc<dyn WorkerReporter>,
) -> WorkerHandle {
    let worker_id = worker.worker_id().to_string();
    let loop_task = task.clone();
    let join = tokio::spawn(async move {
        run_worker(&worker, &loop_task, reporter.as_ref()).await;
    });
    WorkerHandle {
        worker_id,
        task,
        join,
    }
}

/// Resolves aliases and bibliographic data for items on the alias queue.
///
/// Providers run in their configured order. The first failing provider ends
/// the cycle for that item; the item keeps what earlier providers added and
/// is requeued behind a `requeue_delay` not-before stamp, so a wedged provider
/// is retried on a later poll instead of in a tight loop.
pub struct AliasWorker<Q: WorkQueue> {
    queue: Q,
    providers: Arc<[Arc<dyn Provider>]>,
    config: WorkerConfig,
}

impl<Q: WorkQueue + 'static> AliasWorker<Q> {
    pub fn new(queue: Q, providers: Arc<[Arc<dyn Provider>]>, config: WorkerConfig) -> Self {
        Self {
            queue,
            providers,
            config,
        }
    }

    async fn run_providers(
        &self,
        item: &mut Item,
        task: &StoppableTask,
        reporter: &dyn WorkerReporter,
    ) -> Option<InvocationOutcome> {
        for provider in self.providers.iter() {
            for capability in [Capability::Aliases, Capability::Biblio] {
                let outcome = ProviderWorker::new(provider.as_ref(), capability, task)
                    .with_sleep_increment(self.config.sleep_increment)
                    .run(item, reporter)
                    .await;

                if !outcome.is_success() {
                    tracing::debug!(
                        worker_id = %self.config.worker_id,
                        tiid = %item.tiid,
                        provider = provider.name(),
                        %capability,
                        ?outcome,
                        "Stopping alias cycle for item"
                    );
                    return Some(outcome);
                }
            }
        }
        None
    }

    /// When a failed item becomes due again. An interrupted cycle is due at
    /// once so the next run resumes it.
    fn requeue_at(&self, failure: &InvocationOutcome, now: DateTime<Utc>) -> DateTime<Utc> {
        if *failure == InvocationOutcome::Stopped {
            return now;
        }
        TimeDelta::from_std(self.config.requeue_delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now)
    }
}

impl<Q: WorkQueue + 'static> QueueWorker for AliasWorker<Q> {
    type Queue = Q;

    fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn queue(&self) -> &Q {
        &self.queue
    }

    async fn process(
        &self,
        mut item: Item,
        task: &StoppableTask,
        reporter: &dyn WorkerReporter,
    ) -> Result<(), AppError> {
        let failure = self.run_providers(&mut item, task, reporter).await;

        match &failure {
            None => item.mark_aliases_resolved(),
            Some(outcome) => item.requeue_aliases(self.requeue_at(outcome, Utc::now())),
        }
        self.queue.unqueue(&item).await?;

        reporter.report(WorkerEvent::ItemProcessed {
            worker_id: &self.config.worker_id,
            tiid: &item.tiid,
            succeeded: failure.is_none(),
        });
        Ok(())
    }
}

/// Collects metrics from one provider for items on its metrics queue.
pub struct MetricsWorker<Q: WorkQueue> {
    queue: Q,
    provider: Arc<dyn Provider>,
    config: WorkerConfig,
}

impl<Q: WorkQueue + 'static> MetricsWorker<Q> {
    pub fn new(queue: Q, provider: Arc<dyn Provider>, config: WorkerConfig) -> Self {
        Self {
            queue,
            provider,
            config,
        }
    }
}

impl<Q: WorkQueue + 'static> QueueWorker for MetricsWorker<Q> {
    type Queue = Q;

    fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn queue(&self) -> &Q {
        &self.queue
    }

    async fn process(
        &self,
        mut item: Item,
        task: &StoppableTask,
        reporter: &dyn WorkerReporter,
    ) -> Result<(), AppError> {
        let outcome = ProviderWorker::new(self.provider.as_ref(), Capability::Metrics, task)
            .with_sleep_increment(self.config.sleep_increment)
            .run(&mut item, reporter)
            .await;

        // Leave the item queued so the next run picks it up.
        if outcome == InvocationOutcome::Stopped {
            self.queue.release(&item.tiid);
            return Ok(());
        }

        item.mark_metrics_run(self.provider.name(), Utc::now());
        self.queue.unqueue(&item).await?;

        reporter.report(WorkerEvent::ItemProcessed {
            worker_id: &self.config.worker_id,
            tiid: &item.tiid,
            succeeded: outcome.is_success(),
        });
        Ok(())
    }
}
