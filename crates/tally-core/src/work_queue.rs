//! Work queues as live views over item state.
//!
//! Nothing is ever pushed onto or popped off a queue. A queue is a
//! [`QueueSelector`] evaluated against the store on every [`WorkQueue::peek`];
//! persisting an item whose state no longer matches the selector is what
//! removes it.
//!
//! Workers of one pool share a [`ViewQueue`] through clones. The clones share
//! a set of in-flight tiids, so a peeked item is claimed by one worker until
//! it is unqueued or released.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::item::Item;
use crate::traits::ItemStore;

/// How many unclaimed candidates a single `peek` inspects before giving up.
const SCAN_LIMIT: usize = 25;

/// The predicate that defines a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueSelector {
    /// Items still waiting for alias and biblio discovery.
    NeedsAliases,
    /// Items whose aliases are resolved but which have no finished metrics
    /// cycle for `provider`.
    NeedsMetrics { provider: String },
}

impl QueueSelector {
    pub fn metrics(provider: impl Into<String>) -> Self {
        QueueSelector::NeedsMetrics {
            provider: provider.into(),
        }
    }

    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Whether the item is on this queue at all, due or not.
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            QueueSelector::NeedsAliases => item.needs_aliases(),
            QueueSelector::NeedsMetrics { provider } => item.needs_metrics_from(provider),
        }
    }

    /// Whether the item may be handed to a worker at `now`. Requeued alias
    /// items wait for their not-before stamp.
    pub fn is_due(&self, item: &Item, now: DateTime<Utc>) -> bool {
        match self {
            QueueSelector::NeedsAliases => item.aliases_due(now),
            QueueSelector::NeedsMetrics { provider } => item.needs_metrics_from(provider),
        }
    }
}

impl fmt::Display for QueueSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueSelector::NeedsAliases => write!(f, "needs_aliases"),
            QueueSelector::NeedsMetrics { provider } => write!(f, "needs_metrics:{provider}"),
        }
    }
}

/// Items that still need work, plus the write that retires them.
pub trait WorkQueue: Send + Sync + Clone {
    fn selector(&self) -> &QueueSelector;

    /// Claim and return one due item without removing it from the store.
    /// Never blocks.
    fn peek(&self) -> impl Future<Output = Result<Option<Item>, AppError>> + Send;

    /// Persist an already-mutated item and drop its claim. It leaves the
    /// queue as a side effect once its state no longer matches the selector.
    fn unqueue(&self, item: &Item) -> impl Future<Output = Result<Item, AppError>> + Send;

    /// Drop the claim on an item that is left untouched.
    fn release(&self, tiid: &str);
}

/// [`WorkQueue`] backed by an [`ItemStore`] view.
#[derive(Debug, Clone)]
pub struct ViewQueue<S> {
    store: S,
    selector: QueueSelector,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl<S: ItemStore> ViewQueue<S> {
    /// A queue with its own claim set. Clone it to hand the same queue to
    /// every worker of a pool.
    pub fn new(store: S, selector: QueueSelector) -> Self {
        Self {
            store,
            selector,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn aliases(store: S) -> Self {
        Self::new(store, QueueSelector::NeedsAliases)
    }

    pub fn metrics(store: S, provider: impl Into<String>) -> Self {
        Self::new(store, QueueSelector::metrics(provider))
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(queue = %self.selector, "Recovered from poisoned claim set mutex");
            poisoned.into_inner()
        })
    }

    fn is_claimed(&self, tiid: &str) -> bool {
        self.in_flight().contains(tiid)
    }
}

impl<S: ItemStore> WorkQueue for ViewQueue<S> {
    fn selector(&self) -> &QueueSelector {
        &self.selector
    }

    async fn peek(&self) -> Result<Option<Item>, AppError> {
        // Look past the claimed entries so a busy pool still finds work.
        let limit = SCAN_LIMIT + self.in_flight().len();
        let candidates = self.store.view(&self.selector, limit).await?;
        let now = Utc::now();

        for tiid in candidates {
            if self.is_claimed(&tiid) {
                continue;
            }
            match self.store.get(&tiid).await? {
                Some(item) if self.selector.is_due(&item, now) => {
                    // Another worker may have claimed it while we were fetching.
                    if self.in_flight().insert(item.tiid.clone()) {
                        return Ok(Some(item));
                    }
                }
                Some(_) => {
                    tracing::debug!(%tiid, queue = %self.selector, "Skipping item no longer queued");
                }
                None => {
                    tracing::debug!(%tiid, queue = %self.selector, "Skipping vanished item");
                }
            }
        }

        Ok(None)
    }

    async fn unqueue(&self, item: &Item) -> Result<Item, AppError> {
        let saved = self.store.save(item).await;
        self.release(&item.tiid);
        saved
    }

    fn release(&self, tiid: &str) {
        self.in_flight().remove(tiid);
    }
}
