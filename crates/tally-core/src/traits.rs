use std::future::Future;

use crate::error::AppError;
use crate::item::{Alias, Item};
use crate::work_queue::QueueSelector;

/// How many times [`ItemStore::save`] re-merges after losing a race.
pub const MAX_SAVE_ATTEMPTS: u32 = 5;

/// Result of a single compare-and-swap write.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    /// Written; carries the item with its new revision.
    Saved(Item),
    /// Someone else wrote first; carries the currently persisted item.
    Conflict(Item),
}

/// Persists items and answers queue views over them.
///
/// Implementations must make `try_save` an atomic compare-and-swap on
/// [`Item::version`] so concurrent writers never silently overwrite each other.
pub trait ItemStore: Send + Sync + Clone {
    fn get(&self, tiid: &str) -> impl Future<Output = Result<Option<Item>, AppError>> + Send;

    /// Store a brand-new item. Returns it with its first revision.
    fn insert(&self, item: &Item) -> impl Future<Output = Result<Item, AppError>> + Send;

    /// Write `item` only if the stored revision still equals `item.version`.
    fn try_save(&self, item: &Item)
    -> impl Future<Output = Result<SaveOutcome, AppError>> + Send;

    /// Ordered tiids currently due on `selector`, at most `limit` of them.
    ///
    /// Alias items requeued with a future stamp are left out until it passes.
    fn view(
        &self,
        selector: &QueueSelector,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;

    /// Items on the queue, due or not.
    fn count(&self, selector: &QueueSelector)
    -> impl Future<Output = Result<u64, AppError>> + Send;

    /// The item carrying `alias`, if any. `alias` is expected normalised.
    fn find_by_alias(
        &self,
        alias: &Alias,
    ) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    /// Persist `item`, re-fetching and merging on every lost race.
    ///
    /// Fails with [`AppError::Conflict`] after [`MAX_SAVE_ATTEMPTS`] lost races.
    fn save(&self, item: &Item) -> impl Future<Output = Result<Item, AppError>> + Send {
        async move {
            let mut pending = item.clone();
            for attempt in 1..=MAX_SAVE_ATTEMPTS {
                match self.try_save(&pending).await? {
                    SaveOutcome::Saved(saved) => return Ok(saved),
                    SaveOutcome::Conflict(current) => {
                        tracing::debug!(
                            tiid = %pending.tiid,
                            attempt,
                            stale_version = pending.version,
                            current_version = current.version,
                            "Save conflict, merging"
                        );
                        pending.merge_from(&current);
                    }
                }
            }
            Err(AppError::Conflict {
                tiid: pending.tiid,
            })
        }
    }
}
