//! Reactive query engine behavior: suppression, dependencies, errors.

use std::sync::{Arc, Mutex};

use hivestore_core::{
    BucketDef, FieldDef, FieldMap, GeneratedValue, QueryContext, Store, StoreConfig, StoreError,
    Value,
};

fn doc(pairs: &[(&str, Value)]) -> FieldMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn collect() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |value: &Value| sink.lock().unwrap().push(value.clone()))
}

async fn store_with_orders() -> Store {
    let store = Store::start(StoreConfig::new("reactive-test")).await.unwrap();
    store
        .define_bucket(
            BucketDef::new("orders", "id")
                .field("id", FieldDef::number().generated(GeneratedValue::Autoincrement))
                .field("status", FieldDef::string().required())
                .index("status"),
        )
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn equal_results_are_suppressed() {
    let store = store_with_orders().await;
    store
        .define_query("paid_count", |ctx: QueryContext, _params: Value| async move {
            let orders = ctx.bucket("orders")?;
            let n = orders
                .count(Some(doc(&[("status", "paid".into())])))
                .await?;
            Ok(Value::from(n as i64))
        })
        .unwrap();

    let (seen, callback) = collect();
    let _sub = store.subscribe("paid_count", Value::Null, callback).await.unwrap();
    assert!(seen.lock().unwrap().is_empty(), "initial result is not delivered");

    let orders = store.bucket("orders").unwrap();
    orders
        .insert(doc(&[("status", "pending".into())]))
        .await
        .unwrap();
    store.settle().await;
    // bucket-level re-evaluation ran, but the count is still 0
    assert!(seen.lock().unwrap().is_empty());

    orders
        .update(1, doc(&[("status", "paid".into())]))
        .await
        .unwrap();
    store.settle().await;
    assert_eq!(*seen.lock().unwrap(), vec![Value::from(1)]);
}

#[tokio::test]
async fn record_level_dependency_ignores_other_keys() {
    let store = store_with_orders().await;
    store
        .define_query("order_status", |ctx: QueryContext, params: Value| async move {
            let orders = ctx.bucket("orders")?;
            Ok(orders
                .get(params)
                .await?
                .and_then(|record| record.get("status").cloned())
                .unwrap_or(Value::Null))
        })
        .unwrap();

    let orders = store.bucket("orders").unwrap();
    orders.insert(doc(&[("status", "new".into())])).await.unwrap();
    orders.insert(doc(&[("status", "new".into())])).await.unwrap();

    let (seen, callback) = collect();
    let _sub = store
        .subscribe("order_status", Value::from(1), callback)
        .await
        .unwrap();

    // a different key does not touch the subscription
    orders
        .update(2, doc(&[("status", "shipped".into())]))
        .await
        .unwrap();
    store.settle().await;
    assert!(seen.lock().unwrap().is_empty());

    orders
        .update(1, doc(&[("status", "shipped".into())]))
        .await
        .unwrap();
    store.settle().await;
    assert_eq!(*seen.lock().unwrap(), vec![Value::from("shipped")]);
}

#[tokio::test]
async fn dependencies_swap_when_the_query_reads_elsewhere() {
    let store = Store::start(StoreConfig::new("dep-swap")).await.unwrap();
    for bucket in ["flags", "alpha", "beta"] {
        store
            .define_bucket(
                BucketDef::new(bucket, "id")
                    .field("id", FieldDef::string().required())
                    .field("value", FieldDef::string()),
            )
            .await
            .unwrap();
    }
    store
        .define_query("routed_count", |ctx: QueryContext, _params: Value| async move {
            let flags = ctx.bucket("flags")?;
            let which = flags
                .get("which")
                .await?
                .and_then(|record| record.get("value").cloned())
                .unwrap_or_else(|| Value::from("alpha"));
            let target = which.as_str().unwrap_or("alpha").to_string();
            let n = ctx.bucket(&target)?.count(None).await?;
            Ok(Value::from(n as i64))
        })
        .unwrap();

    let flags = store.bucket("flags").unwrap();
    let alpha = store.bucket("alpha").unwrap();
    let beta = store.bucket("beta").unwrap();
    flags
        .insert(doc(&[("id", "which".into()), ("value", "alpha".into())]))
        .await
        .unwrap();
    beta.insert(doc(&[("id", "b1".into())])).await.unwrap();

    let (seen, callback) = collect();
    let _sub = store
        .subscribe("routed_count", Value::Null, callback)
        .await
        .unwrap();

    // reroute to beta: result changes 0 -> 1
    flags
        .update("which", doc(&[("value", "beta".into())]))
        .await
        .unwrap();
    store.settle().await;
    assert_eq!(*seen.lock().unwrap(), vec![Value::from(1)]);

    // alpha is no longer a dependency
    alpha.insert(doc(&[("id", "a1".into())])).await.unwrap();
    store.settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    beta.insert(doc(&[("id", "b2".into())])).await.unwrap();
    store.settle().await;
    assert_eq!(*seen.lock().unwrap(), vec![Value::from(1), Value::from(2)]);
}

#[tokio::test]
async fn failing_evaluation_keeps_the_subscription_alive() {
    let store = store_with_orders().await;
    store
        .define_query("fragile_count", |ctx: QueryContext, _params: Value| async move {
            let orders = ctx.bucket("orders")?;
            if orders
                .find_one(doc(&[("status", "poison".into())]))
                .await?
                .is_some()
            {
                return Err(StoreError::Validation {
                    field: "status".to_string(),
                    reason: "poisoned".to_string(),
                });
            }
            let n = orders.count(None).await?;
            Ok(Value::from(n as i64))
        })
        .unwrap();

    let (seen, callback) = collect();
    let _sub = store
        .subscribe("fragile_count", Value::Null, callback)
        .await
        .unwrap();

    let orders = store.bucket("orders").unwrap();
    orders.insert(doc(&[("status", "poison".into())])).await.unwrap();
    store.settle().await;
    assert!(seen.lock().unwrap().is_empty(), "no callback for a failed evaluation");

    orders.delete(1).await.unwrap();
    store.settle().await;
    // back to a clean count of 0, equal to the last delivered state
    assert!(seen.lock().unwrap().is_empty());

    orders.insert(doc(&[("status", "ok".into())])).await.unwrap();
    store.settle().await;
    assert_eq!(*seen.lock().unwrap(), vec![Value::from(1)]);
}

#[tokio::test]
async fn unsubscribe_stops_notifications() {
    let store = store_with_orders().await;
    store
        .define_query("order_count", |ctx: QueryContext, _params: Value| async move {
            let n = ctx.bucket("orders")?.count(None).await?;
            Ok(Value::from(n as i64))
        })
        .unwrap();

    let (seen, callback) = collect();
    let sub = store
        .subscribe("order_count", Value::Null, callback)
        .await
        .unwrap();
    sub.unsubscribe();
    sub.unsubscribe();

    let orders = store.bucket("orders").unwrap();
    orders.insert(doc(&[("status", "new".into())])).await.unwrap();
    store.settle().await;
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn bursts_converge_on_the_latest_result() {
    let store = store_with_orders().await;
    store
        .define_query("order_count", |ctx: QueryContext, _params: Value| async move {
            let n = ctx.bucket("orders")?.count(None).await?;
            Ok(Value::from(n as i64))
        })
        .unwrap();

    let (seen, callback) = collect();
    let _sub = store
        .subscribe("order_count", Value::Null, callback)
        .await
        .unwrap();

    let orders = store.bucket("orders").unwrap();
    for _ in 0..5 {
        orders.insert(doc(&[("status", "new".into())])).await.unwrap();
    }
    store.settle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.last(), Some(&Value::from(5)));
    assert!(seen.len() <= 5, "coalescing never delivers more than one result per change");
}

#[tokio::test]
async fn run_query_executes_without_subscribing() {
    let store = store_with_orders().await;
    store
        .define_query("order_count", |ctx: QueryContext, _params: Value| async move {
            let n = ctx.bucket("orders")?.count(None).await?;
            Ok(Value::from(n as i64))
        })
        .unwrap();

    assert_eq!(
        store.run_query("order_count", Value::Null).await.unwrap(),
        Value::from(0)
    );
    let orders = store.bucket("orders").unwrap();
    orders.insert(doc(&[("status", "new".into())])).await.unwrap();
    assert_eq!(
        store.run_query("order_count", Value::Null).await.unwrap(),
        Value::from(1)
    );
}

#[tokio::test]
async fn query_registry_rejects_duplicates_and_unknowns() {
    let store = store_with_orders().await;
    store
        .define_query("q", |_ctx: QueryContext, _params: Value| async move {
            Ok(Value::Null)
        })
        .unwrap();

    let err = store
        .define_query("q", |_ctx: QueryContext, _params: Value| async move {
            Ok(Value::Null)
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::QueryAlreadyDefined(_)));

    let err = store.run_query("missing", Value::Null).await.unwrap_err();
    assert!(matches!(err, StoreError::QueryNotDefined(_)));
    let err = store
        .subscribe("missing", Value::Null, |_value: &Value| {})
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::QueryNotDefined(_)));
}
