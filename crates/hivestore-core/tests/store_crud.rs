//! CRUD behavior of a single bucket through the store facade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hivestore_core::{
    BucketDef, FieldDef, FieldMap, GeneratedValue, Store, StoreConfig, StoreError, Value,
};

fn doc(pairs: &[(&str, Value)]) -> FieldMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

async fn store_with_users() -> Store {
    let store = Store::start(StoreConfig::new("crud-test")).await.unwrap();
    store
        .define_bucket(
            BucketDef::new("users", "id")
                .field("id", FieldDef::number().generated(GeneratedValue::Autoincrement))
                .field("name", FieldDef::string().required())
                .field("email", FieldDef::string().unique())
                .field(
                    "role",
                    FieldDef::string()
                        .one_of(vec!["admin".into(), "user".into(), "guest".into()])
                        .default_value("user"),
                )
                .field("status", FieldDef::string())
                .index("status"),
        )
        .await
        .unwrap();
    store
}

// ===========================================================================
// Basic round trips
// ===========================================================================

#[tokio::test]
async fn insert_then_get_returns_equal_record() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    let inserted = users.insert(doc(&[("name", "ada".into())])).await.unwrap();
    assert_eq!(inserted.version, 1);
    assert_eq!(inserted.created_at, inserted.updated_at);

    let fetched = users.get(1).await.unwrap().unwrap();
    assert_eq!(fetched, inserted);
}

#[tokio::test]
async fn insert_then_delete_leaves_key_empty() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    users.insert(doc(&[("name", "ada".into())])).await.unwrap();
    assert!(users.delete(1).await.unwrap());
    assert!(users.get(1).await.unwrap().is_none());
    assert_eq!(users.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    assert!(!users.delete(42).await.unwrap());
    users.insert(doc(&[("name", "ada".into())])).await.unwrap();
    assert!(users.delete(1).await.unwrap());
    assert!(!users.delete(1).await.unwrap());
}

#[tokio::test]
async fn update_bumps_version_and_keeps_created_at() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    let inserted = users.insert(doc(&[("name", "ada".into())])).await.unwrap();
    let updated = users
        .update(1, doc(&[("name", "grace".into())]))
        .await
        .unwrap();

    assert_eq!(updated.version, 2);
    assert_eq!(updated.created_at, inserted.created_at);
    assert_eq!(updated.get("name"), Some(&Value::from("grace")));
}

#[tokio::test]
async fn update_with_same_changes_is_idempotent_modulo_metadata() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    users.insert(doc(&[("name", "ada".into())])).await.unwrap();
    let first = users
        .update(1, doc(&[("status", "active".into())]))
        .await
        .unwrap();
    let second = users
        .update(1, doc(&[("status", "active".into())]))
        .await
        .unwrap();

    assert_eq!(first.fields, second.fields);
    assert_eq!(second.version, first.version + 1);
}

// ===========================================================================
// Validation and constraints
// ===========================================================================

#[tokio::test]
async fn bad_enum_is_rejected_with_no_side_effects() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();
    let events = Arc::new(AtomicUsize::new(0));
    let events_sub = Arc::clone(&events);
    let _token = store.on_event("bucket.users.*", move |_| {
        events_sub.fetch_add(1, Ordering::SeqCst);
    });

    let err = users
        .insert(doc(&[("name", "eve".into()), ("role", "superadmin".into())]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation { field, .. } if field == "role"));
    assert_eq!(users.count(None).await.unwrap(), 0);
    assert_eq!(events.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unique_constraint_rejects_second_record() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    users
        .insert(doc(&[("name", "ada".into()), ("email", "a@b.io".into())]))
        .await
        .unwrap();
    let err = users
        .insert(doc(&[("name", "eve".into()), ("email", "a@b.io".into())]))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::UniqueConstraint { field, .. } if field == "email"));
    assert_eq!(users.count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn duplicate_primary_key_is_rejected() {
    let store = Store::start(StoreConfig::new("dup-test")).await.unwrap();
    store
        .define_bucket(
            BucketDef::new("items", "sku")
                .field("sku", FieldDef::string().required())
                .field("label", FieldDef::string()),
        )
        .await
        .unwrap();
    let items = store.bucket("items").unwrap();

    items.insert(doc(&[("sku", "x-1".into())])).await.unwrap();
    let err = items.insert(doc(&[("sku", "x-1".into())])).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey { .. }));
}

#[tokio::test]
async fn update_of_missing_record_is_not_found() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    let err = users
        .update(9, doc(&[("name", "nobody".into())]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

// ===========================================================================
// Reads
// ===========================================================================

#[tokio::test]
async fn find_where_uses_filter_and_index() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    for (name, status) in [("ada", "active"), ("eve", "idle"), ("kim", "active")] {
        users
            .insert(doc(&[("name", name.into()), ("status", status.into())]))
            .await
            .unwrap();
    }

    // "status" is indexed; "name" forces a scan. Both paths agree.
    let active = users.find_where(doc(&[("status", "active".into())])).await.unwrap();
    assert_eq!(active.len(), 2);
    let ada = users.find_where(doc(&[("name", "ada".into())])).await.unwrap();
    assert_eq!(ada.len(), 1);

    let count = users
        .count(Some(doc(&[("status", "active".into())])))
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn find_one_returns_first_in_insertion_order() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    users
        .insert(doc(&[("name", "ada".into()), ("status", "active".into())]))
        .await
        .unwrap();
    users
        .insert(doc(&[("name", "eve".into()), ("status", "active".into())]))
        .await
        .unwrap();

    let (_, first) = users
        .find_one(doc(&[("status", "active".into())]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.get("name"), Some(&Value::from("ada")));
}

#[tokio::test]
async fn all_preserves_insertion_order() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    for name in ["ada", "eve", "kim"] {
        users.insert(doc(&[("name", name.into())])).await.unwrap();
    }
    let names: Vec<_> = users
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|(_, r)| r.get("name").cloned().unwrap())
        .collect();
    assert_eq!(names, vec![Value::from("ada"), Value::from("eve"), Value::from("kim")]);
}

// ===========================================================================
// Store lifecycle
// ===========================================================================

#[tokio::test]
async fn stats_reflect_bucket_state() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();
    users.insert(doc(&[("name", "ada".into())])).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].name, "users");
    assert_eq!(stats[0].size, 1);
    assert_eq!(stats[0].autoincrement, 1);
    assert_eq!(stats[0].indexes, vec!["status".to_string()]);
    assert_eq!(stats[0].unique_indexes, vec!["email".to_string()]);
}

#[tokio::test]
async fn unknown_bucket_and_double_definition_fail() {
    let store = store_with_users().await;
    assert!(matches!(
        store.bucket("ghosts").unwrap_err(),
        StoreError::BucketNotDefined(_)
    ));

    let err = store
        .define_bucket(BucketDef::new("users", "id").field("id", FieldDef::number()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::BucketAlreadyDefined(_)));
}

#[tokio::test]
async fn stopped_store_rejects_work() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();
    store.stop().await.unwrap();

    assert!(matches!(
        store.bucket("users").unwrap_err(),
        StoreError::StoreStopped
    ));
    let err = users.insert(doc(&[("name", "late".into())])).await.unwrap_err();
    assert!(matches!(err, StoreError::StoreStopped));

    // stop is idempotent
    store.stop().await.unwrap();
}

#[tokio::test]
async fn events_carry_old_and_new_records() {
    let store = store_with_users().await;
    let users = store.bucket("users").unwrap();

    let seen: Arc<std::sync::Mutex<Vec<(String, Option<String>)>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_sub = Arc::clone(&seen);
    let _token = store.on_event("bucket.users.*", move |event| {
        let old_name = event
            .old_record
            .as_ref()
            .and_then(|r| r.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        seen_sub
            .lock()
            .unwrap()
            .push((event.kind.to_string(), old_name));
    });

    users.insert(doc(&[("name", "ada".into())])).await.unwrap();
    users.update(1, doc(&[("name", "grace".into())])).await.unwrap();
    users.delete(1).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            ("inserted".to_string(), None),
            ("updated".to_string(), Some("ada".to_string())),
            ("deleted".to_string(), None),
        ]
    );
}
