use chrono::{TimeDelta, Utc};
use tally_core::{Alias, AppError, Item, ItemStore, MetricValue, MetricsUpdate, QueueSelector, SaveOutcome};
use tally_core::work_queue::{ViewQueue, WorkQueue};

use crate::common::setup_test_store;

#[tokio::test]
async fn test_insert_and_get_roundtrip() {
    let (store, _pool, _container) = setup_test_store().await;

    let mut item = Item::new(Utc::now()).with_aliases([Alias::new("doi", "10.1/ABC")]);
    item.add_metrics(
        "dryad",
        MetricsUpdate::from([("views".to_string(), MetricValue::new(7, None))]),
        Utc::now(),
    );
    let inserted = store.insert(&item).await.unwrap();
    assert_eq!(inserted.version, 1);

    let fetched = store.get(&item.tiid).await.unwrap().unwrap();
    assert_eq!(fetched.version, 1);
    assert!(fetched.aliases.contains("doi", "10.1/abc"));
    assert_eq!(fetched.latest_metric("dryad:views").unwrap().value, 7);

    assert!(store.get("nope").await.unwrap().is_none());
    assert!(matches!(store.insert(&item).await, Err(AppError::Generic(_))));
}

#[tokio::test]
async fn test_try_save_is_compare_and_swap() {
    let (store, _pool, _container) = setup_test_store().await;
    let item = store.insert(&Item::new(Utc::now())).await.unwrap();

    match store.try_save(&item).await.unwrap() {
        SaveOutcome::Saved(saved) => assert_eq!(saved.version, 2),
        SaveOutcome::Conflict(_) => panic!("first write must win"),
    }
    match store.try_save(&item).await.unwrap() {
        SaveOutcome::Conflict(current) => assert_eq!(current.version, 2),
        SaveOutcome::Saved(_) => panic!("stale write must conflict"),
    }

    let missing = Item::new(Utc::now());
    assert!(matches!(
        store.try_save(&missing).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_concurrent_saves_merge() {
    let (store, _pool, _container) = setup_test_store().await;
    let item = store.insert(&Item::new(Utc::now())).await.unwrap();

    let mut a = item.clone();
    a.add_aliases([Alias::new("url", "http://a.org")]);
    let mut b = item.clone();
    b.add_aliases([Alias::new("github", "octo,repo")]);

    let (ra, rb) = tokio::join!(store.save(&a), store.save(&b));
    ra.unwrap();
    rb.unwrap();

    let stored = store.get(&item.tiid).await.unwrap().unwrap();
    assert!(stored.aliases.contains("url", "http://a.org"));
    assert!(stored.aliases.contains("github", "octo,repo"));
    assert_eq!(stored.version, 3);
}

#[tokio::test]
async fn test_alias_queue_view_order() {
    let (store, _pool, _container) = setup_test_store().await;
    let now = Utc::now();

    let newer = store.insert(&Item::new(now)).await.unwrap();
    let older = store
        .insert(&Item::new(now - TimeDelta::seconds(30)))
        .await
        .unwrap();
    let mut resolved = Item::new(now - TimeDelta::seconds(60));
    resolved.mark_aliases_resolved();
    store.insert(&resolved).await.unwrap();

    let view = store.view(&QueueSelector::NeedsAliases, 10).await.unwrap();
    assert_eq!(view, vec![older.tiid.clone(), newer.tiid.clone()]);
    assert_eq!(store.count(&QueueSelector::NeedsAliases).await.unwrap(), 2);
    assert_eq!(
        store.view(&QueueSelector::NeedsAliases, 1).await.unwrap(),
        vec![older.tiid]
    );
}

#[tokio::test]
async fn test_requeued_alias_item_hidden_until_due() {
    let (store, _pool, _container) = setup_test_store().await;
    let due = store
        .insert(&Item::new(Utc::now() - TimeDelta::seconds(5)))
        .await
        .unwrap();
    let mut deferred = store.insert(&Item::new(Utc::now())).await.unwrap();
    deferred.requeue_aliases(Utc::now() + TimeDelta::minutes(10));
    store.save(&deferred).await.unwrap();

    let view = store.view(&QueueSelector::NeedsAliases, 10).await.unwrap();
    assert_eq!(view, vec![due.tiid]);
    assert_eq!(store.count(&QueueSelector::NeedsAliases).await.unwrap(), 2);
}

#[tokio::test]
async fn test_metrics_queue_drains_per_provider() {
    let (store, _pool, _container) = setup_test_store().await;
    let mut ready = Item::new(Utc::now());
    ready.mark_aliases_resolved();
    let ready = store.insert(&ready).await.unwrap();

    let dryad = ViewQueue::metrics(store.clone(), "dryad");
    let github = ViewQueue::metrics(store.clone(), "github");

    let mut item = dryad.peek().await.unwrap().unwrap();
    assert_eq!(item.tiid, ready.tiid);
    item.mark_metrics_run("dryad", Utc::now());
    dryad.unqueue(&item).await.unwrap();

    assert!(dryad.peek().await.unwrap().is_none());
    assert_eq!(github.peek().await.unwrap().unwrap().tiid, ready.tiid);
    assert_eq!(store.count(&QueueSelector::metrics("dryad")).await.unwrap(), 0);
    assert_eq!(store.count(&QueueSelector::metrics("github")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_request_refresh_rearms_queues() {
    let (store, _pool, _container) = setup_test_store().await;
    let mut item = Item::new(Utc::now());
    item.mark_aliases_resolved();
    item.mark_metrics_run("dryad", Utc::now());
    let item = store.insert(&item).await.unwrap();
    assert_eq!(store.count(&QueueSelector::NeedsAliases).await.unwrap(), 0);

    let mut refreshed = item.clone();
    refreshed.request_refresh(Utc::now());
    store.save(&refreshed).await.unwrap();

    assert_eq!(store.count(&QueueSelector::NeedsAliases).await.unwrap(), 1);
    let stored = store.get(&item.tiid).await.unwrap().unwrap();
    assert!(stored.metrics_runs.is_empty());
}

#[tokio::test]
async fn test_find_by_alias() {
    let (store, _pool, _container) = setup_test_store().await;
    let item = store
        .insert(&Item::new(Utc::now()).with_aliases([Alias::new("doi", "10.5061/dryad.8515")]))
        .await
        .unwrap();

    let found = store
        .find_by_alias(&Alias::new("doi", "10.5061/dryad.8515"))
        .await
        .unwrap();
    assert_eq!(found, Some(item.tiid));
    assert!(
        store
            .find_by_alias(&Alias::new("url", "http://elsewhere.org"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_migrate_twice_keeps_items() {
    let (store, pool, _container) = setup_test_store().await;
    let item = store.insert(&Item::new(Utc::now())).await.unwrap();

    let database = tally_db::Database::from_pool(pool);
    database.migrate().await.unwrap();

    let reopened = database.item_store();
    assert!(reopened.get(&item.tiid).await.unwrap().is_some());
    assert_eq!(reopened.count(&QueueSelector::NeedsAliases).await.unwrap(), 1);
}
