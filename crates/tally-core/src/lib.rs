pub mod config;
pub mod error;
pub mod item;
pub mod memory_store;
pub mod os_signals;
pub mod provider;
pub mod provider_worker;
pub mod rate_limiter;
pub mod stoppable;
pub mod supervisor;
pub mod traits;
pub mod work_queue;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{PipelineConfig, ProviderSettings, load_provider_settings};
pub use error::{AppError, ErrorKind, ProviderError};
pub use item::{Alias, Aliases, Biblio, Item, MetricValue, MetricsUpdate, Snapshot};
pub use memory_store::MemoryStore;
pub use provider::{Capabilities, Capability, Provider, ProviderDescriptor, RetryPolicy};
pub use provider_worker::{ErrorRecord, InvocationOutcome, ProviderWorker};
pub use rate_limiter::RateLimiter;
pub use stoppable::StoppableTask;
pub use supervisor::Supervisor;
pub use traits::{ItemStore, SaveOutcome};
pub use work_queue::{QueueSelector, ViewQueue, WorkQueue};
pub use worker::{TracingWorkerReporter, WorkerEvent, WorkerHandle, WorkerReporter};
