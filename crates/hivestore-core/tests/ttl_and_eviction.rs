//! TTL expiration and size-bounded eviction.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hivestore_core::{
    parse_duration, BucketDef, EventKind, FieldDef, FieldMap, GeneratedValue, QueryContext, Store,
    StoreConfig, Value, EXPIRES_AT_FIELD,
};

fn doc(pairs: &[(&str, Value)]) -> FieldMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[tokio::test]
async fn full_bucket_evicts_the_oldest_record() {
    let store = Store::start(StoreConfig::new("evict-test")).await.unwrap();
    store
        .define_bucket(
            BucketDef::new("ring", "id")
                .field("id", FieldDef::number().generated(GeneratedValue::Autoincrement))
                .field("label", FieldDef::string().required())
                .max_size(2),
        )
        .await
        .unwrap();
    store
        .define_query("labels", |ctx: QueryContext, _params: Value| async move {
            let all = ctx.bucket("ring")?.all().await?;
            Ok(Value::Array(
                all.iter()
                    .filter_map(|(_, r)| r.get("label").cloned())
                    .collect(),
            ))
        })
        .unwrap();

    let events: Arc<Mutex<Vec<(EventKind, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let events_sub = Arc::clone(&events);
    let _token = store.on_event("bucket.ring.*", move |event| {
        let label = event
            .record
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        events_sub.lock().unwrap().push((event.kind, label));
    });

    let results: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let results_sub = Arc::clone(&results);
    let _sub = store
        .subscribe("labels", Value::Null, move |value: &Value| {
            results_sub.lock().unwrap().push(value.clone());
        })
        .await
        .unwrap();

    let ring = store.bucket("ring").unwrap();
    for label in ["r1", "r2", "r3"] {
        ring.insert(doc(&[("label", label.into())])).await.unwrap();
    }

    // exactly {r2, r3} remain, capacity is exactly reached
    assert_eq!(ring.count(None).await.unwrap(), 2);
    let labels: Vec<_> = ring
        .all()
        .await
        .unwrap()
        .into_iter()
        .filter_map(|(_, r)| r.get("label").cloned())
        .collect();
    assert_eq!(labels, vec![Value::from("r2"), Value::from("r3")]);

    // one deleted event for r1, emitted before r3's insert
    let seen = events.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (EventKind::Inserted, "r1".to_string()),
            (EventKind::Inserted, "r2".to_string()),
            (EventKind::Deleted, "r1".to_string()),
            (EventKind::Inserted, "r3".to_string()),
        ]
    );

    // a live subscription converges on the final pair
    store.settle().await;
    let results = results.lock().unwrap();
    assert_eq!(
        results.last(),
        Some(&Value::Array(vec![Value::from("r2"), Value::from("r3")]))
    );
}

#[tokio::test]
async fn bucket_ttl_stamps_expiry_on_insert() {
    let store = Store::start(StoreConfig::new("ttl-test")).await.unwrap();
    store
        .define_bucket(
            BucketDef::new("sessions", "id")
                .field("id", FieldDef::string().generated(GeneratedValue::Uuid))
                .ttl(parse_duration("1.5h").unwrap()),
        )
        .await
        .unwrap();

    let sessions = store.bucket("sessions").unwrap();
    let record = sessions.insert(doc(&[])).await.unwrap();
    assert_eq!(record.expires_at, Some(record.created_at + 5_400_000));
}

#[tokio::test]
async fn caller_supplied_expiry_is_authoritative() {
    let store = Store::start(StoreConfig::new("ttl-test")).await.unwrap();
    store
        .define_bucket(
            BucketDef::new("sessions", "id")
                .field("id", FieldDef::string().generated(GeneratedValue::Uuid))
                .ttl(parse_duration("1h").unwrap()),
        )
        .await
        .unwrap();

    let sessions = store.bucket("sessions").unwrap();
    let record = sessions
        .insert(doc(&[(EXPIRES_AT_FIELD, 1_234.into())]))
        .await
        .unwrap();
    assert_eq!(record.expires_at, Some(1_234));
}

#[tokio::test]
async fn purge_ttl_removes_expired_records_and_emits_deleted() {
    let store = Store::start(StoreConfig::new("ttl-test")).await.unwrap();
    store
        .define_bucket(
            BucketDef::new("sessions", "id")
                .field("id", FieldDef::string().required())
                .ttl(parse_duration("1h").unwrap()),
        )
        .await
        .unwrap();

    let events: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
    let events_sub = Arc::clone(&events);
    let _token = store.on_event("bucket.sessions.deleted", move |event| {
        events_sub.lock().unwrap().push(event.kind);
    });

    let sessions = store.bucket("sessions").unwrap();
    sessions
        .insert(doc(&[("id", "stale".into()), (EXPIRES_AT_FIELD, 1.into())]))
        .await
        .unwrap();
    sessions.insert(doc(&[("id", "fresh".into())])).await.unwrap();

    let purged = store.purge_ttl().await;
    assert_eq!(purged, 1);
    assert!(sessions.get("stale").await.unwrap().is_none());
    assert!(sessions.get("fresh").await.unwrap().is_some());
    assert_eq!(*events.lock().unwrap(), vec![EventKind::Deleted]);

    // purge again: nothing left to do
    assert_eq!(store.purge_ttl().await, 0);
}

#[tokio::test]
async fn scheduler_purges_automatically() {
    let store = Store::start(
        StoreConfig::new("ttl-test").ttl_check_interval(Duration::from_millis(20)),
    )
    .await
    .unwrap();
    store
        .define_bucket(
            BucketDef::new("sessions", "id")
                .field("id", FieldDef::string().required())
                .ttl(parse_duration("1h").unwrap()),
        )
        .await
        .unwrap();

    let sessions = store.bucket("sessions").unwrap();
    sessions
        .insert(doc(&[("id", "stale".into()), (EXPIRES_AT_FIELD, 1.into())]))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(sessions.count(None).await.unwrap(), 0);
    store.stop().await.unwrap();
}

#[tokio::test]
async fn eviction_respects_max_size_under_load() {
    let store = Store::start(StoreConfig::new("evict-test")).await.unwrap();
    store
        .define_bucket(
            BucketDef::new("ring", "id")
                .field("id", FieldDef::number().generated(GeneratedValue::Autoincrement))
                .max_size(5),
        )
        .await
        .unwrap();

    let ring = store.bucket("ring").unwrap();
    for _ in 0..25 {
        ring.insert(doc(&[])).await.unwrap();
        assert!(ring.count(None).await.unwrap() <= 5);
    }
    assert_eq!(ring.count(None).await.unwrap(), 5);

    // the survivors are the five newest
    let keys: Vec<String> = ring
        .all()
        .await
        .unwrap()
        .iter()
        .map(|(k, _)| k.to_string())
        .collect();
    assert_eq!(keys, vec!["21", "22", "23", "24", "25"]);
}
