//! Debounced snapshot persistence
//!
//! The coordinator listens to `bucket.*.*` change events rather than
//! hooking the write path: transactional commits publish events only
//! after every bucket succeeds, so failed transactions produce no
//! snapshot churn. Each event marks its bucket dirty and arms a single
//! debounce timer; when it fires, the dirty set is taken atomically and
//! every bucket in it is snapshotted and written through the adapter (in
//! parallel). A failed write reports to the error hook and leaves the
//! bucket dirty so the next event retries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bucket::BucketHandle;
use crate::error::StoreError;
use crate::storage::{
    BucketSnapshot, SnapshotEnvelope, SnapshotMetadata, StorageAdapter, SCHEMA_VERSION,
};

/// Called with every storage failure; the store keeps serving in memory.
pub type ErrorHook = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// How snapshots are written: through which adapter, how long after the
/// first dirtying event, and who hears about failures.
#[derive(Clone)]
pub struct PersistenceConfig {
    pub adapter: Arc<dyn StorageAdapter>,
    pub debounce: Duration,
    pub on_error: Option<ErrorHook>,
}

impl PersistenceConfig {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        PersistenceConfig {
            adapter,
            debounce: Duration::from_millis(100),
            on_error: None,
        }
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StoreError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

struct PersistInner {
    store_name: String,
    adapter: Arc<dyn StorageAdapter>,
    debounce: Duration,
    on_error: ErrorHook,
    /// Persistent buckets only; opted-out buckets never register
    buckets: RwLock<HashMap<String, BucketHandle>>,
    dirty: Mutex<HashSet<String>>,
    timer_armed: AtomicBool,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub(crate) struct PersistenceCoordinator {
    inner: Arc<PersistInner>,
}

impl PersistenceCoordinator {
    pub fn new(store_name: &str, config: PersistenceConfig) -> Self {
        let on_error = config.on_error.unwrap_or_else(|| {
            Arc::new(|err: &StoreError| error!(error = %err, "storage adapter failure"))
        });
        PersistenceCoordinator {
            inner: Arc::new(PersistInner {
                store_name: store_name.to_string(),
                adapter: config.adapter,
                debounce: config.debounce,
                on_error,
                buckets: RwLock::new(HashMap::new()),
                dirty: Mutex::new(HashSet::new()),
                timer_armed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn storage_key(&self, bucket: &str) -> String {
        format!("{}:bucket:{}", self.inner.store_name, bucket)
    }

    /// Track a bucket for dirty-marking and flushes.
    pub fn register(&self, bucket: &str, handle: BucketHandle) {
        self.inner
            .buckets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bucket.to_string(), handle);
    }

    /// Load the prior snapshot for a bucket. Absence is normal; a load
    /// failure reports to the error hook and the bucket starts empty.
    pub async fn load(&self, bucket: &str) -> Option<BucketSnapshot> {
        match self.inner.adapter.load(&self.storage_key(bucket)).await {
            Ok(Some(envelope)) => {
                debug!(
                    bucket,
                    records = envelope.state.records.len(),
                    "loaded persisted snapshot"
                );
                Some(envelope.state)
            }
            Ok(None) => None,
            Err(err) => {
                (self.inner.on_error)(&err);
                None
            }
        }
    }

    /// Mark a bucket dirty and arm the debounce timer if idle. Called
    /// synchronously from the event bus.
    pub fn mark_dirty(&self, bucket: &str) {
        {
            let buckets = self.inner.buckets.read().unwrap_or_else(|e| e.into_inner());
            if !buckets.contains_key(bucket) {
                return;
            }
        }
        self.inner
            .dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bucket.to_string());

        if !self.inner.timer_armed.swap(true, Ordering::SeqCst) {
            let coordinator = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = coordinator.inner.cancel.cancelled() => {
                        // final flush at stop covers whatever is dirty
                    }
                    _ = tokio::time::sleep(coordinator.inner.debounce) => {
                        let taken = coordinator.take_dirty();
                        coordinator.flush(taken).await;
                    }
                }
            });
        }
    }

    fn take_dirty(&self) -> HashSet<String> {
        let taken = {
            let mut dirty = self.inner.dirty.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *dirty)
        };
        // disarm before flushing so events arriving mid-flush re-arm
        self.inner.timer_armed.store(false, Ordering::SeqCst);
        taken
    }

    /// Snapshot and write every named bucket, in parallel. Failed buckets
    /// go back into the dirty set.
    async fn flush(&self, buckets: HashSet<String>) {
        let handles: Vec<(String, BucketHandle)> = {
            let registry = self.inner.buckets.read().unwrap_or_else(|e| e.into_inner());
            buckets
                .into_iter()
                .filter_map(|name| registry.get(&name).cloned().map(|h| (name, h)))
                .collect()
        };

        let writes = handles.into_iter().map(|(name, handle)| {
            let coordinator = self.clone();
            async move {
                if let Err(err) = coordinator.save_bucket(&name, &handle).await {
                    (coordinator.inner.on_error)(&err);
                    coordinator
                        .inner
                        .dirty
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(name);
                }
            }
        });
        join_all(writes).await;
    }

    async fn save_bucket(&self, name: &str, handle: &BucketHandle) -> crate::Result<()> {
        let state = handle.snapshot().await?;
        let envelope = SnapshotEnvelope {
            state,
            metadata: SnapshotMetadata {
                persisted_at: Utc::now().timestamp_millis(),
                store_name: self.inner.store_name.clone(),
                schema_version: SCHEMA_VERSION,
            },
        };
        self.inner.adapter.save(&self.storage_key(name), &envelope).await
    }

    /// Stop sequence: cancel the debounce timer, flush every registered
    /// bucket synchronously (actors must still be alive to answer
    /// snapshot requests), then close the adapter.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let all: HashSet<String> = {
            let buckets = self.inner.buckets.read().unwrap_or_else(|e| e.into_inner());
            buckets.keys().cloned().collect()
        };
        {
            let mut dirty = self.inner.dirty.lock().unwrap_or_else(|e| e.into_inner());
            dirty.clear();
        }
        let count = all.len();
        self.flush(all).await;
        if let Err(err) = self.inner.adapter.close().await {
            (self.inner.on_error)(&err);
        }
        info!(buckets = count, "final persistence flush complete");
    }
}
