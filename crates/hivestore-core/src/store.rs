//! Store facade
//!
//! Wires the pieces together: one actor per bucket, a shared event bus,
//! the query engine, the transaction coordinator, the TTL scheduler and
//! (optionally) the persistence coordinator. Defining a bucket loads its
//! prior snapshot before the actor accepts any message; stopping the
//! store flushes snapshots while the actors are still alive, then drains
//! and joins them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::bucket::{BucketActor, BucketHandle, BucketStats};
use crate::error::{Result, StoreError};
use crate::events::{EventBus, StoreEvent, SubscriptionToken};
use crate::persistence::{PersistenceConfig, PersistenceCoordinator};
use crate::query::{QueryContext, QueryEngine, QuerySubscription};
use crate::schema::{BucketDef, SchemaValidator};
use crate::transaction::{BucketAccess, Transaction, TxResolver};
use crate::ttl::TtlScheduler;
use crate::value::Value;

/// Store-wide configuration.
#[derive(Clone)]
pub struct StoreConfig {
    pub name: String,
    /// Period of the automatic TTL purge; `None` disables it
    pub ttl_check_interval: Option<Duration>,
    pub persistence: Option<PersistenceConfig>,
}

impl StoreConfig {
    pub fn new(name: &str) -> Self {
        StoreConfig {
            name: name.to_string(),
            ttl_check_interval: None,
            persistence: None,
        }
    }

    pub fn ttl_check_interval(mut self, interval: Duration) -> Self {
        self.ttl_check_interval = Some(interval);
        self
    }

    pub fn persistence(mut self, config: PersistenceConfig) -> Self {
        self.persistence = Some(config);
        self
    }
}

struct BucketEntry {
    handle: BucketHandle,
    validator: Arc<SchemaValidator>,
    task: JoinHandle<()>,
}

struct StoreInner {
    name: String,
    bus: Arc<EventBus>,
    buckets: RwLock<HashMap<String, BucketEntry>>,
    queries: QueryEngine,
    persistence: Option<PersistenceCoordinator>,
    ttl: TtlScheduler,
    stopped: AtomicBool,
}

impl StoreInner {
    fn bucket_handle(&self, name: &str) -> Result<BucketHandle> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(StoreError::StoreStopped);
        }
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets
            .get(name)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| StoreError::BucketNotDefined(name.to_string()))
    }

    fn bucket_access(&self, name: &str) -> Result<BucketAccess> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(StoreError::StoreStopped);
        }
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets
            .get(name)
            .map(|entry| BucketAccess {
                handle: entry.handle.clone(),
                validator: Arc::clone(&entry.validator),
            })
            .ok_or_else(|| StoreError::BucketNotDefined(name.to_string()))
    }
}

/// The reactive bucket store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Bring a store up: event bus, query engine, TTL scheduler, and (if
    /// configured) the persistence coordinator subscribed to all change
    /// events.
    #[instrument(skip_all, fields(store = %config.name))]
    pub async fn start(config: StoreConfig) -> Result<Store> {
        let bus = Arc::new(EventBus::new());
        let ttl = TtlScheduler::new(config.ttl_check_interval);
        let persistence = config
            .persistence
            .map(|p| PersistenceCoordinator::new(&config.name, p));

        let inner = Arc::new_cyclic(|weak: &Weak<StoreInner>| {
            let resolver = {
                let weak = weak.clone();
                Arc::new(move |name: &str| {
                    weak.upgrade()
                        .ok_or(StoreError::StoreStopped)?
                        .bucket_handle(name)
                })
            };
            StoreInner {
                name: config.name.clone(),
                bus: Arc::clone(&bus),
                buckets: RwLock::new(HashMap::new()),
                queries: QueryEngine::new(resolver),
                persistence,
                ttl,
                stopped: AtomicBool::new(false),
            }
        });

        // reactive invalidation and dirty-marking both ride the event bus
        let engine = inner.queries.clone();
        bus.subscribe("bucket.*.*", move |event| {
            engine.notify_change(&event.bucket, &event.key);
        });
        if let Some(coordinator) = &inner.persistence {
            let coordinator = coordinator.clone();
            bus.subscribe("bucket.*.*", move |event| {
                coordinator.mark_dirty(&event.bucket);
            });
        }
        inner.ttl.start();

        info!("store started");
        Ok(Store { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Define a bucket and start its actor. If persistence is configured
    /// and the bucket is not opted out, the prior snapshot is loaded and
    /// indexes rebuilt before any message is accepted.
    #[instrument(skip_all, fields(bucket = %def.name))]
    pub async fn define_bucket(&self, def: BucketDef) -> Result<BucketHandle> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(StoreError::StoreStopped);
        }
        let name = def.name.clone();
        let persist = def.persist;
        {
            let buckets = self.inner.buckets.read().unwrap_or_else(|e| e.into_inner());
            if buckets.contains_key(&name) {
                return Err(StoreError::BucketAlreadyDefined(name));
            }
        }

        let validator = Arc::new(SchemaValidator::new(def)?);
        let has_ttl = validator.def().ttl.is_some();

        let snapshot = match (&self.inner.persistence, persist) {
            (Some(coordinator), true) => coordinator.load(&name).await,
            _ => None,
        };

        let (handle, task) =
            BucketActor::spawn(Arc::clone(&validator), snapshot, Arc::clone(&self.inner.bus))?;

        {
            let mut buckets = self.inner.buckets.write().unwrap_or_else(|e| e.into_inner());
            if buckets.contains_key(&name) {
                handle.close().await;
                return Err(StoreError::BucketAlreadyDefined(name));
            }
            buckets.insert(
                name.clone(),
                BucketEntry {
                    handle: handle.clone(),
                    validator,
                    task,
                },
            );
        }

        if let (Some(coordinator), true) = (&self.inner.persistence, persist) {
            coordinator.register(&name, handle.clone());
        }
        if has_ttl {
            self.inner.ttl.register(handle.clone());
        }

        info!("bucket defined");
        Ok(handle)
    }

    /// Handle to a previously defined bucket.
    pub fn bucket(&self, name: &str) -> Result<BucketHandle> {
        self.inner.bucket_handle(name)
    }

    /// Register a named query function.
    pub fn define_query<F, Fut>(&self, name: &str, query: F) -> Result<()>
    where
        F: Fn(QueryContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.inner.queries.define_query(name, query)
    }

    /// Execute a named query once, without subscribing.
    pub async fn run_query(&self, name: &str, params: Value) -> Result<Value> {
        self.inner.queries.run_query(name, params).await
    }

    /// Subscribe to a named query. The callback fires on every changed
    /// result; the initial result is not delivered.
    pub async fn subscribe<F>(
        &self,
        name: &str,
        params: Value,
        callback: F,
    ) -> Result<QuerySubscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.queries.subscribe(name, params, callback).await
    }

    /// Wait for every pending query re-evaluation. For deterministic
    /// tests.
    pub async fn settle(&self) {
        self.inner.queries.settle().await;
    }

    /// Subscribe to change events. Patterns follow the
    /// `bucket.<name>.<kind>` topic shape with `*` matching one segment.
    pub fn on_event<F>(&self, pattern: &str, handler: F) -> SubscriptionToken
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(pattern, handler)
    }

    /// Begin a buffered multi-bucket transaction.
    pub fn transaction(&self) -> Transaction {
        let resolver: TxResolver = {
            let weak = Arc::downgrade(&self.inner);
            Arc::new(move |name: &str| {
                weak.upgrade()
                    .ok_or(StoreError::StoreStopped)?
                    .bucket_access(name)
            })
        };
        Transaction::new(resolver, Arc::clone(&self.inner.bus))
    }

    /// Run one TTL purge tick now; returns the total purged.
    pub async fn purge_ttl(&self) -> usize {
        self.inner.ttl.purge_all().await
    }

    /// Stats for every defined bucket.
    pub async fn stats(&self) -> Result<Vec<BucketStats>> {
        let handles: Vec<BucketHandle> = {
            let buckets = self.inner.buckets.read().unwrap_or_else(|e| e.into_inner());
            buckets.values().map(|entry| entry.handle.clone()).collect()
        };
        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            stats.push(handle.stats().await?);
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }

    /// Stop the store: reject new work, cancel timers, flush snapshots
    /// while the actors are still alive, then drain and join every actor.
    #[instrument(skip_all, fields(store = %self.inner.name))]
    pub async fn stop(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.ttl.stop();

        if let Some(coordinator) = &self.inner.persistence {
            coordinator.stop().await;
        }

        let entries: Vec<BucketEntry> = {
            let mut buckets = self.inner.buckets.write().unwrap_or_else(|e| e.into_inner());
            buckets.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.handle.close().await;
            let _ = entry.task.await;
        }

        info!("store stopped");
        Ok(())
    }
}
