//! Reactive query engine
//!
//! Named query functions run against a read-only [`QueryContext`]; every
//! read records a dependency. Subscriptions re-evaluate when a mutation
//! touches their dependency set and notify their callback only when the
//! result actually changed (by deep equality).
//!
//! Dependencies come in two granularities: `get` records a
//! `(bucket, key)` pair, every other read records the whole bucket. A
//! bucket-level dependency subsumes record-level pairs for that bucket.
//!
//! Re-evaluations for one subscription never overlap: a change arriving
//! mid-evaluation schedules exactly one follow-up run.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::bucket::{BucketHandle, Filter};
use crate::error::{Result, StoreError};
use crate::schema::Record;
use crate::value::{deep_equal, IndexKey, Value};

/// Resolves a bucket name to its live handle; installed by the store.
pub(crate) type BucketResolver = Arc<dyn Fn(&str) -> Result<BucketHandle> + Send + Sync>;

type QueryFn = Arc<dyn Fn(QueryContext, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type QueryCallback = Arc<dyn Fn(&Value) + Send + Sync>;

// ---------------------------------------------------------------------------
// Dependency capture
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct DepSet {
    buckets: HashSet<String>,
    records: HashSet<(String, IndexKey)>,
}

impl DepSet {
    fn note_bucket(&mut self, bucket: &str) {
        // bucket-level subsumes any record-level pairs already captured
        self.records.retain(|(b, _)| b != bucket);
        self.buckets.insert(bucket.to_string());
    }

    fn note_record(&mut self, bucket: &str, key: &IndexKey) {
        if !self.buckets.contains(bucket) {
            self.records.insert((bucket.to_string(), key.clone()));
        }
    }
}

/// Read-only view handed to query functions. Each read both delegates to
/// the owning bucket actor and records the dependency it implies.
pub struct QueryContext {
    resolver: BucketResolver,
    deps: Arc<Mutex<DepSet>>,
}

impl QueryContext {
    fn new(resolver: BucketResolver) -> (Self, Arc<Mutex<DepSet>>) {
        let deps = Arc::new(Mutex::new(DepSet::default()));
        (
            QueryContext {
                resolver,
                deps: Arc::clone(&deps),
            },
            deps,
        )
    }

    pub fn bucket(&self, name: &str) -> Result<QueryBucket> {
        let handle = (self.resolver)(name)?;
        Ok(QueryBucket {
            handle,
            bucket: name.to_string(),
            deps: Arc::clone(&self.deps),
        })
    }
}

/// Instrumented per-bucket read handle.
pub struct QueryBucket {
    handle: BucketHandle,
    bucket: String,
    deps: Arc<Mutex<DepSet>>,
}

impl QueryBucket {
    /// Point read; records a record-level dependency.
    pub async fn get(&self, key: impl Into<Value>) -> Result<Option<Record>> {
        let value = key.into();
        let Some(key) = IndexKey::from_value(&value) else {
            return Ok(None);
        };
        self.deps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .note_record(&self.bucket, &key);
        self.handle.get(key.to_value()).await
    }

    pub async fn all(&self) -> Result<Vec<(IndexKey, Record)>> {
        self.note_bucket();
        self.handle.all().await
    }

    pub async fn find_where(&self, filter: Filter) -> Result<Vec<(IndexKey, Record)>> {
        self.note_bucket();
        self.handle.find_where(filter).await
    }

    pub async fn find_one(&self, filter: Filter) -> Result<Option<(IndexKey, Record)>> {
        self.note_bucket();
        self.handle.find_one(filter).await
    }

    pub async fn count(&self, filter: Option<Filter>) -> Result<usize> {
        self.note_bucket();
        self.handle.count(filter).await
    }

    fn note_bucket(&self) {
        self.deps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .note_bucket(&self.bucket);
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

struct SubState {
    name: String,
    params: Value,
    callback: QueryCallback,
    last_result: Value,
    deps: DepSet,
    evaluating: bool,
    pending: bool,
}

#[derive(Default)]
struct SubTable {
    next_id: u64,
    subs: HashMap<u64, SubState>,
    bucket_level: HashMap<String, HashSet<u64>>,
    record_level: HashMap<String, HashMap<IndexKey, HashSet<u64>>>,
}

impl SubTable {
    fn index_deps(&mut self, id: u64, deps: &DepSet) {
        for bucket in &deps.buckets {
            self.bucket_level.entry(bucket.clone()).or_default().insert(id);
        }
        for (bucket, key) in &deps.records {
            self.record_level
                .entry(bucket.clone())
                .or_default()
                .entry(key.clone())
                .or_default()
                .insert(id);
        }
    }

    fn unindex_deps(&mut self, id: u64, deps: &DepSet) {
        for bucket in &deps.buckets {
            if let Some(ids) = self.bucket_level.get_mut(bucket) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.bucket_level.remove(bucket);
                }
            }
        }
        for (bucket, key) in &deps.records {
            if let Some(by_key) = self.record_level.get_mut(bucket) {
                if let Some(ids) = by_key.get_mut(key) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        by_key.remove(key);
                    }
                }
                if by_key.is_empty() {
                    self.record_level.remove(bucket);
                }
            }
        }
    }

    fn affected(&self, bucket: &str, key: &IndexKey) -> Vec<u64> {
        let mut ids: HashSet<u64> = self
            .bucket_level
            .get(bucket)
            .cloned()
            .unwrap_or_default();
        if let Some(record_ids) = self.record_level.get(bucket).and_then(|m| m.get(key)) {
            ids.extend(record_ids.iter().copied());
        }
        ids.into_iter().collect()
    }
}

/// Live registration returned by `subscribe`. Dropping it does nothing;
/// call [`QuerySubscription::unsubscribe`] to stop receiving results.
#[derive(Debug)]
pub struct QuerySubscription {
    id: u64,
    engine: Weak<EngineInner>,
}

impl QuerySubscription {
    /// Remove the subscription and its dependency index entries. Safe to
    /// call more than once.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.engine.upgrade() {
            let mut table = inner.subs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(sub) = table.subs.remove(&self.id) {
                let deps = sub.deps;
                table.unindex_deps(self.id, &deps);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner {
    resolver: BucketResolver,
    queries: RwLock<HashMap<String, QueryFn>>,
    subs: Mutex<SubTable>,
    inflight: AtomicUsize,
    idle: Notify,
}

/// Registry of named queries plus the live subscription set.
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<EngineInner>,
}

impl QueryEngine {
    pub(crate) fn new(resolver: BucketResolver) -> Self {
        QueryEngine {
            inner: Arc::new(EngineInner {
                resolver,
                queries: RwLock::new(HashMap::new()),
                subs: Mutex::new(SubTable::default()),
                inflight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Register a named query function. Names are single-assignment.
    pub fn define_query<F, Fut>(&self, name: &str, query: F) -> Result<()>
    where
        F: Fn(QueryContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut queries = self.inner.queries.write().unwrap_or_else(|e| e.into_inner());
        if queries.contains_key(name) {
            return Err(StoreError::QueryAlreadyDefined(name.to_string()));
        }
        queries.insert(
            name.to_string(),
            Arc::new(move |ctx, params| Box::pin(query(ctx, params))),
        );
        Ok(())
    }

    fn query_fn(&self, name: &str) -> Result<QueryFn> {
        self.inner
            .queries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::QueryNotDefined(name.to_string()))
    }

    /// Execute a query once. No dependencies are retained.
    pub async fn run_query(&self, name: &str, params: Value) -> Result<Value> {
        let query = self.query_fn(name)?;
        let (ctx, _deps) = QueryContext::new(Arc::clone(&self.inner.resolver));
        query(ctx, params).await
    }

    /// Evaluate the query, retain its result and dependencies, and invoke
    /// `callback` with every *changed* result from now on. The initial
    /// result is not delivered.
    pub async fn subscribe<F>(
        &self,
        name: &str,
        params: Value,
        callback: F,
    ) -> Result<QuerySubscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let query = self.query_fn(name)?;
        let (ctx, deps) = QueryContext::new(Arc::clone(&self.inner.resolver));
        let result = query(ctx, params.clone()).await?;
        let captured = {
            let mut captured = deps.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *captured)
        };

        let mut table = self.inner.subs.lock().unwrap_or_else(|e| e.into_inner());
        let id = table.next_id;
        table.next_id += 1;
        table.index_deps(id, &captured);
        table.subs.insert(
            id,
            SubState {
                name: name.to_string(),
                params,
                callback: Arc::new(callback),
                last_result: result,
                deps: captured,
                evaluating: false,
                pending: false,
            },
        );
        debug!(query = name, sub = id, "subscription registered");

        Ok(QuerySubscription {
            id,
            engine: Arc::downgrade(&self.inner),
        })
    }

    /// React to a mutation: schedule re-evaluation for every subscription
    /// whose dependency set covers `(bucket, key)`. Called synchronously
    /// from the event bus.
    pub(crate) fn notify_change(&self, bucket: &str, key: &IndexKey) {
        let mut table = self.inner.subs.lock().unwrap_or_else(|e| e.into_inner());
        for id in table.affected(bucket, key) {
            let Some(sub) = table.subs.get_mut(&id) else {
                continue;
            };
            if sub.evaluating {
                sub.pending = true;
            } else {
                sub.evaluating = true;
                self.inner.inflight.fetch_add(1, Ordering::SeqCst);
                let inner = Arc::clone(&self.inner);
                tokio::spawn(evaluate_loop(inner, id));
            }
        }
    }

    /// Wait until every re-evaluation scheduled so far (including
    /// coalesced follow-ups) has finished. For deterministic tests.
    pub async fn settle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// One subscription's evaluation task. Loops while coalesced follow-ups
/// are pending, then releases its in-flight slot.
async fn evaluate_loop(inner: Arc<EngineInner>, id: u64) {
    loop {
        let lookup = {
            let table = inner.subs.lock().unwrap_or_else(|e| e.into_inner());
            table
                .subs
                .get(&id)
                .map(|sub| (sub.name.clone(), sub.params.clone()))
        };
        // unsubscribed before we got to run
        let Some((name, params)) = lookup else {
            break;
        };
        let query = {
            let queries = inner.queries.read().unwrap_or_else(|e| e.into_inner());
            queries.get(&name).cloned()
        };
        let Some(query) = query else {
            break;
        };

        let (ctx, deps) = QueryContext::new(Arc::clone(&inner.resolver));
        let outcome = query(ctx, params).await;

        let mut notify: Option<(QueryCallback, Value)> = None;
        let mut repeat = false;
        {
            let mut table = inner.subs.lock().unwrap_or_else(|e| e.into_inner());
            if !table.subs.contains_key(&id) {
                // removed during the async evaluation; discard the result
                break;
            }
            match outcome {
                Ok(result) => {
                    let new_deps = {
                        let mut captured = deps.lock().unwrap_or_else(|e| e.into_inner());
                        std::mem::take(&mut *captured)
                    };
                    let mut deps_swap = None;
                    if let Some(sub) = table.subs.get_mut(&id) {
                        if !deep_equal(&sub.last_result, &result) {
                            sub.last_result = result.clone();
                            notify = Some((Arc::clone(&sub.callback), result));
                        }
                        if new_deps != sub.deps {
                            let old_deps = std::mem::replace(&mut sub.deps, new_deps.clone());
                            deps_swap = Some((old_deps, new_deps));
                        }
                    }
                    if let Some((old_deps, new_deps)) = deps_swap {
                        table.unindex_deps(id, &old_deps);
                        table.index_deps(id, &new_deps);
                    }
                }
                Err(err) => {
                    // keep the subscription alive with its previous
                    // result and dependencies
                    warn!(query = %name, sub = id, error = %err, "query evaluation failed");
                }
            }
            if let Some(sub) = table.subs.get_mut(&id) {
                if sub.pending {
                    sub.pending = false;
                    repeat = true;
                } else {
                    sub.evaluating = false;
                }
            }
        }

        if let Some((callback, result)) = notify {
            callback(&result);
        }
        if !repeat {
            break;
        }
    }

    inner.inflight.fetch_sub(1, Ordering::SeqCst);
    inner.idle.notify_waiters();
}
