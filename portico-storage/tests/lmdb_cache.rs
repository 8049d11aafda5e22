//! OfflineCache over a real LMDB environment.

use std::sync::Arc;
use std::time::Duration;

use portico_storage::{KeyValueStore, LmdbStore, OfflineCache};
use serde_json::{json, Value};

fn open(dir: &tempfile::TempDir) -> (OfflineCache, Arc<LmdbStore>) {
    let store = Arc::new(LmdbStore::open(dir.path(), 16).expect("open lmdb"));
    let cache = OfflineCache::new(store.clone(), "app_cache", Duration::from_secs(1800));
    (cache, store)
}

#[tokio::test]
async fn entries_expire_and_are_deleted_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (cache, store) = open(&dir);

    cache
        .set("query:todos:{}", &json!([{"id": "1"}]), Some(Duration::from_millis(20)))
        .await;
    assert_eq!(cache.get::<Value>("query:todos:{}").await, Some(json!([{"id": "1"}])));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(cache.get::<Value>("query:todos:{}").await, None);
    assert!(store.get("app_cache:query:todos:{}").await.unwrap().is_none());
    assert_eq!(cache.stats().expired, 1);
}

#[tokio::test]
async fn clear_spares_other_records() {
    let dir = tempfile::tempdir().unwrap();
    let (cache, store) = open(&dir);

    store.set("feature-flags", br#"{"beta":true}"#).await.unwrap();
    cache.set("a", &1, None).await;
    cache.set("b", &2, None).await;
    cache.clear().await;

    assert_eq!(cache.get::<i32>("a").await, None);
    assert_eq!(cache.get::<i32>("b").await, None);
    assert!(store.get("feature-flags").await.unwrap().is_some());
}

#[tokio::test]
async fn overwrite_replaces_wholesale() {
    let dir = tempfile::tempdir().unwrap();
    let (cache, _) = open(&dir);

    cache.set("k", &json!({"a": 1, "b": 2}), None).await;
    cache.set("k", &json!({"a": 3}), None).await;
    assert_eq!(cache.get::<Value>("k").await, Some(json!({"a": 3})));
}
