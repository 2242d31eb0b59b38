//! Starts and stops the whole worker set.

use std::future::Future;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::provider::Provider;
use crate::rate_limiter::RateLimiter;
use crate::stoppable::StoppableTask;
use crate::traits::ItemStore;
use crate::work_queue::ViewQueue;
use crate::worker::{
    AliasWorker, MetricsWorker, TracingWorkerReporter, WorkerConfig, WorkerHandle,
    WorkerReporter, spawn_worker,
};

/// Owns the alias worker pool plus one metrics pool per metrics-capable
/// provider.
pub struct Supervisor<S: ItemStore + 'static> {
    store: S,
    providers: Arc<[Arc<dyn Provider>]>,
    config: PipelineConfig,
    reporter: Arc<dyn WorkerReporter>,
    task: StoppableTask,
}

impl<S: ItemStore + 'static> Supervisor<S> {
    /// `providers` are run by alias workers in the given order.
    pub fn new(store: S, providers: Vec<Arc<dyn Provider>>, config: PipelineConfig) -> Self {
        Self {
            store,
            providers: providers.into(),
            config,
            reporter: Arc::new(TracingWorkerReporter),
            task: StoppableTask::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn WorkerReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Stop every worker spawned by this supervisor.
    pub fn stop(&self) {
        self.task.stop();
    }

    fn worker_config(&self, worker_id: String) -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id(worker_id)
            .with_poll_interval(self.config.poll_interval)
            .with_sleep_increment(self.config.sleep_increment)
            .with_requeue_delay(self.config.alias_requeue_delay)
    }

    /// Spawn the full worker set and return its handles.
    ///
    /// Workers of one pool share a queue, and with it the set of items
    /// currently claimed by the pool.
    pub fn spawn(&self) -> Vec<WorkerHandle> {
        let mut handles = Vec::new();

        let alias_queue = ViewQueue::aliases(self.store.clone());
        for n in 0..self.config.alias_workers {
            let worker = AliasWorker::new(
                alias_queue.clone(),
                Arc::clone(&self.providers),
                self.worker_config(format!("alias-{n}")),
            );
            handles.push(spawn_worker(
                worker,
                self.task.child(),
                Arc::clone(&self.reporter),
            ));
        }

        for provider in self.providers.iter() {
            if !provider.descriptor().provides_metrics() {
                continue;
            }
            let name = provider.name();
            let workers = self.config.metrics_workers_for(name);
            let limiter = provider.descriptor().rate_limiter.as_ref();
            tracing::debug!(
                provider = name,
                workers,
                rate_limit = limiter.map(RateLimiter::rate_limit),
                "Starting metrics pool"
            );
            let queue = ViewQueue::metrics(self.store.clone(), name);
            for n in 0..workers {
                let worker = MetricsWorker::new(
                    queue.clone(),
                    Arc::clone(provider),
                    self.worker_config(format!("metrics-{name}-{n}")),
                );
                handles.push(spawn_worker(
                    worker,
                    self.task.child(),
                    Arc::clone(&self.reporter),
                ));
            }
        }

        tracing::info!(
            workers = handles.len(),
            alias_workers = self.config.alias_workers,
            providers = self.providers.len(),
            "Workers spawned"
        );
        handles
    }

    /// Run until `shutdown` completes, then stop and join every worker.
    pub async fn run<F>(self, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        let handles = self.spawn();

        tokio::select! {
            () = shutdown => tracing::info!("Shutdown requested"),
            () = self.task.wait_stopped() => {}
        }

        Self::shutdown(handles).await
    }

    /// Stop every handle, then join them one after another.
    pub async fn shutdown(handles: Vec<WorkerHandle>) -> Result<(), AppError> {
        for handle in &handles {
            handle.stop();
        }

        let mut failures = 0usize;
        for handle in handles {
            let worker_id = handle.worker_id().to_string();
            match handle.join().await {
                Ok(()) => tracing::debug!(%worker_id, "Worker joined"),
                Err(e) => {
                    failures += 1;
                    tracing::error!(%worker_id, error = %e, "Worker did not exit cleanly");
                }
            }
        }

        if failures > 0 {
            return Err(AppError::Generic(format!(
                "{failures} worker(s) did not exit cleanly"
            )));
        }
        tracing::info!("All workers stopped");
        Ok(())
    }
}
