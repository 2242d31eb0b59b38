//! In-process [`ItemStore`] for tests, demos and single-node runs without a
//! database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::error::AppError;
use crate::item::{Alias, Item};
use crate::traits::{ItemStore, SaveOutcome};
use crate::work_queue::QueueSelector;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    items: Arc<Mutex<HashMap<String, Item>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Item>> {
        self.items.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned item store mutex");
            poisoned.into_inner()
        })
    }

    /// Remove an item outright.
    pub fn delete(&self, tiid: &str) -> Option<Item> {
        self.lock().remove(tiid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ItemStore for MemoryStore {
    async fn get(&self, tiid: &str) -> Result<Option<Item>, AppError> {
        Ok(self.lock().get(tiid).cloned())
    }

    async fn insert(&self, item: &Item) -> Result<Item, AppError> {
        let mut items = self.lock();
        if items.contains_key(&item.tiid) {
            return Err(AppError::Generic(format!(
                "Item {} already exists",
                item.tiid
            )));
        }
        let mut stored = item.clone();
        stored.version = 1;
        items.insert(stored.tiid.clone(), stored.clone());
        Ok(stored)
    }

    async fn try_save(&self, item: &Item) -> Result<SaveOutcome, AppError> {
        let mut items = self.lock();
        let current = items
            .get(&item.tiid)
            .ok_or_else(|| AppError::NotFound(item.tiid.clone()))?;

        if current.version != item.version {
            return Ok(SaveOutcome::Conflict(current.clone()));
        }

        let mut saved = item.clone();
        saved.version += 1;
        items.insert(saved.tiid.clone(), saved.clone());
        Ok(SaveOutcome::Saved(saved))
    }

    async fn view(&self, selector: &QueueSelector, limit: usize) -> Result<Vec<String>, AppError> {
        let now = Utc::now();
        let items = self.lock();
        let mut matching: Vec<&Item> = items
            .values()
            .filter(|i| selector.is_due(i, now))
            .collect();

        match selector {
            QueueSelector::NeedsAliases => {
                matching.sort_by(|a, b| {
                    (a.needs_aliases, a.created, &a.tiid).cmp(&(b.needs_aliases, b.created, &b.tiid))
                });
            }
            QueueSelector::NeedsMetrics { .. } => {
                matching.sort_by(|a, b| {
                    (a.last_requested, a.created, &a.tiid).cmp(&(
                        b.last_requested,
                        b.created,
                        &b.tiid,
                    ))
                });
            }
        }

        Ok(matching
            .into_iter()
            .take(limit)
            .map(|item| item.tiid.clone())
            .collect())
    }

    async fn count(&self, selector: &QueueSelector) -> Result<u64, AppError> {
        Ok(self.lock().values().filter(|i| selector.matches(i)).count() as u64)
    }

    async fn find_by_alias(&self, alias: &Alias) -> Result<Option<String>, AppError> {
        Ok(self
            .lock()
            .values()
            .filter(|item| item.aliases.contains(&alias.namespace, &alias.id))
            .min_by_key(|item| (item.created, item.tiid.clone()))
            .map(|item| item.tiid.clone()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[tokio::test]
    async fn insert_assigns_first_revision() {
        let store = MemoryStore::new();
        let item = store.insert(&Item::new(Utc::now())).await.unwrap();
        assert_eq!(item.version, 1);
        assert!(store.insert(&item).await.is_err());
    }

    #[tokio::test]
    async fn try_save_detects_stale_revision() {
        let store = MemoryStore::new();
        let item = store.insert(&Item::new(Utc::now())).await.unwrap();

        let first = store.try_save(&item).await.unwrap();
        assert!(matches!(first, SaveOutcome::Saved(ref saved) if saved.version == 2));

        let second = store.try_save(&item).await.unwrap();
        assert!(matches!(second, SaveOutcome::Conflict(ref current) if current.version == 2));
    }

    #[tokio::test]
    async fn save_merges_concurrent_writes() {
        let store = MemoryStore::new();
        let item = store.insert(&Item::new(Utc::now())).await.unwrap();

        let mut writer_a = item.clone();
        let mut writer_b = item.clone();
        writer_a.add_aliases([Alias::new("url", "http://a.org")]);
        writer_b.add_aliases([Alias::new("github", "octo,repo")]);

        store.save(&writer_a).await.unwrap();
        let merged = store.save(&writer_b).await.unwrap();

        assert!(merged.aliases.contains("url", "http://a.org"));
        assert!(merged.aliases.contains("github", "octo,repo"));
        assert_eq!(merged.version, 3);
    }

    #[tokio::test]
    async fn save_of_missing_item_is_not_found() {
        let store = MemoryStore::new();
        let err = store.save(&Item::new(Utc::now())).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn find_by_alias_returns_owner() {
        let store = MemoryStore::new();
        let item = store
            .insert(&Item::new(Utc::now()).with_aliases([Alias::new("doi", "10.1/X")]))
            .await
            .unwrap();

        let found = store.find_by_alias(&Alias::new("doi", "10.1/x")).await.unwrap();
        assert_eq!(found, Some(item.tiid));
        assert!(
            store
                .find_by_alias(&Alias::new("doi", "10.1/y"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn count_matches_view() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.insert(&Item::new(Utc::now())).await.unwrap();
        }
        let selector = QueueSelector::NeedsAliases;
        assert_eq!(store.count(&selector).await.unwrap(), 3);
        assert_eq!(store.view(&selector, 2).await.unwrap().len(), 2);
        assert_eq!(store.count(&QueueSelector::metrics("dryad")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn view_lists_only_due_items_but_count_sees_all() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut deferred = Item::new(now - TimeDelta::seconds(30));
        deferred.requeue_aliases(now + TimeDelta::minutes(5));
        store.insert(&deferred).await.unwrap();
        let due = store.insert(&Item::new(now)).await.unwrap();

        let selector = QueueSelector::NeedsAliases;
        assert_eq!(store.view(&selector, 10).await.unwrap(), vec![due.tiid]);
        assert_eq!(store.count(&selector).await.unwrap(), 2);
    }
}
