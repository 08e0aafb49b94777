//! Atomic multi-bucket transactions
//!
//! A transaction buffers writes per bucket and reads its own writes
//! through an overlay. Nothing touches the bucket actors until `commit`,
//! which sends each bucket one `commit_batch` message carrying the
//! buffered operations plus the expected versions observed at buffer
//! time. Buckets commit one by one; a failure rolls the already-committed
//! buckets back (best effort) and the transaction as a whole fails with
//! no events published. Only after every bucket commits are the collected
//! events published, so subscribers and the persistence coordinator never
//! observe a failed transaction.

use std::sync::Arc;

use chrono::Utc;
use indexmap::map::Entry;
use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::bucket::{matches_filter, BatchOp, BucketHandle, Filter, UndoOp};
use crate::error::{Result, StoreError};
use crate::events::{EventBus, StoreEvent};
use crate::schema::{GeneratedValue, Record, SchemaValidator};
use crate::value::{FieldMap, IndexKey, Value};

/// Everything a transaction needs to touch one bucket.
pub(crate) struct BucketAccess {
    pub handle: BucketHandle,
    pub validator: Arc<SchemaValidator>,
}

/// Resolves a bucket name for transactional use; installed by the store.
pub(crate) type TxResolver = Arc<dyn Fn(&str) -> Result<BucketAccess> + Send + Sync>;

/// One buffered write, keyed by primary key (later writes to the same key
/// merge into the earlier operation).
enum TxOp {
    Insert { record: Record },
    Update { base_version: u64, record: Record },
    Delete { base_version: u64 },
}

struct TxBuffer {
    access: BucketAccess,
    /// Actor counter at first autoincrement use; reservations build on it
    base_counter: Option<u64>,
    reserved: u64,
    ops: IndexMap<IndexKey, TxOp>,
}

impl TxBuffer {
    fn new(access: BucketAccess) -> Self {
        TxBuffer {
            access,
            base_counter: None,
            reserved: 0,
            ops: IndexMap::new(),
        }
    }
}

struct TxState {
    committed: bool,
    /// Buckets in first-touch order; commit walks them in this order
    buffers: IndexMap<String, TxBuffer>,
}

struct TxInner {
    resolver: TxResolver,
    bus: Arc<EventBus>,
    state: Mutex<TxState>,
}

/// A single-use transactional context bound to the store.
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    pub(crate) fn new(resolver: TxResolver, bus: Arc<EventBus>) -> Self {
        Transaction {
            inner: Arc::new(TxInner {
                resolver,
                bus,
                state: Mutex::new(TxState {
                    committed: false,
                    buffers: IndexMap::new(),
                }),
            }),
        }
    }

    /// Transactional handle for one bucket. The bucket is resolved (and
    /// its autoincrement counter read) lazily, on first use.
    pub fn bucket(&self, name: &str) -> TxBucket {
        TxBucket {
            tx: Arc::clone(&self.inner),
            name: name.to_string(),
        }
    }

    /// Apply every buffered write atomically.
    ///
    /// Buckets commit in first-touch order. If any bucket rejects its
    /// batch, the buckets that already committed are rolled back in
    /// reverse order (undo failures are swallowed) and the error is
    /// returned with no events published.
    pub async fn commit(&self) -> Result<()> {
        let mut guard = self.inner.state.lock().await;
        if guard.committed {
            return Err(StoreError::AlreadyCommitted);
        }
        guard.committed = true;

        let mut committed: Vec<(BucketHandle, Vec<UndoOp>)> = Vec::new();
        let mut events: Vec<StoreEvent> = Vec::new();

        for (name, buffer) in guard.buffers.iter() {
            if buffer.ops.is_empty() {
                continue;
            }
            let ops: Vec<BatchOp> = buffer
                .ops
                .iter()
                .map(|(key, op)| match op {
                    TxOp::Insert { record } => BatchOp::Insert {
                        key: key.clone(),
                        record: record.clone(),
                    },
                    TxOp::Update {
                        base_version,
                        record,
                    } => BatchOp::Update {
                        key: key.clone(),
                        record: record.clone(),
                        expected_version: Some(*base_version),
                    },
                    TxOp::Delete { base_version } => BatchOp::Delete {
                        key: key.clone(),
                        expected_version: Some(*base_version),
                    },
                })
                .collect();
            let autoincrement = match (buffer.base_counter, buffer.reserved) {
                (Some(base), reserved) if reserved > 0 => Some(base + reserved),
                _ => None,
            };

            match buffer.access.handle.commit_batch(ops, autoincrement).await {
                Ok(outcome) => {
                    committed.push((buffer.access.handle.clone(), outcome.undo_ops));
                    events.extend(outcome.events);
                }
                Err(err) => {
                    debug!(bucket = %name, error = %err, "transaction commit failed; rolling back");
                    for (handle, undo_ops) in committed.into_iter().rev() {
                        if let Err(rollback_err) = handle.rollback_batch(undo_ops).await {
                            error!(
                                bucket = handle.name(),
                                error = %rollback_err,
                                "transaction rollback failed"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        drop(guard);

        // every bucket committed; only now do observers see the transaction
        for event in &events {
            self.inner.bus.publish(event);
        }
        Ok(())
    }
}

/// Transactional view of one bucket: buffered writes, overlay reads.
pub struct TxBucket {
    tx: Arc<TxInner>,
    name: String,
}

impl TxBucket {
    /// Read a record, seeing this transaction's own writes first.
    pub async fn get(&self, key: impl Into<Value>) -> Result<Option<Record>> {
        let Some(key) = IndexKey::from_value(&key.into()) else {
            return Ok(None);
        };
        let mut guard = self.tx.state.lock().await;
        let buffer = ensure_buffer(&self.tx, &mut guard, &self.name)?;
        match buffer.ops.get(&key) {
            Some(TxOp::Delete { .. }) => Ok(None),
            Some(TxOp::Insert { record }) | Some(TxOp::Update { record, .. }) => {
                Ok(Some(record.clone()))
            }
            None => buffer.access.handle.get(key.to_value()).await,
        }
    }

    /// All records with the overlay applied: updates replace, deletes
    /// drop, inserts append after the pre-existing records.
    pub async fn all(&self) -> Result<Vec<(IndexKey, Record)>> {
        let mut guard = self.tx.state.lock().await;
        let buffer = ensure_buffer(&self.tx, &mut guard, &self.name)?;
        let base = buffer.access.handle.all().await?;

        let mut merged: Vec<(IndexKey, Record)> = Vec::with_capacity(base.len());
        for (key, record) in base {
            match buffer.ops.get(&key) {
                Some(TxOp::Delete { .. }) => {}
                Some(TxOp::Update { record: updated, .. }) => {
                    merged.push((key, updated.clone()));
                }
                Some(TxOp::Insert { record: inserted }) => {
                    // key raced into the actor after we buffered; our write wins the view
                    merged.push((key, inserted.clone()));
                }
                None => merged.push((key, record)),
            }
        }
        for (key, op) in &buffer.ops {
            if let TxOp::Insert { record } = op {
                if !merged.iter().any(|(k, _)| k == key) {
                    merged.push((key.clone(), record.clone()));
                }
            }
        }
        Ok(merged)
    }

    pub async fn find_where(&self, filter: Filter) -> Result<Vec<(IndexKey, Record)>> {
        let merged = self.all().await?;
        Ok(merged
            .into_iter()
            .filter(|(_, record)| matches_filter(record, &filter))
            .collect())
    }

    pub async fn find_one(&self, filter: Filter) -> Result<Option<(IndexKey, Record)>> {
        let merged = self.all().await?;
        Ok(merged
            .into_iter()
            .find(|(_, record)| matches_filter(record, &filter)))
    }

    pub async fn count(&self, filter: Option<Filter>) -> Result<usize> {
        let merged = self.all().await?;
        Ok(match filter {
            Some(filter) => merged
                .iter()
                .filter(|(_, record)| matches_filter(record, &filter))
                .count(),
            None => merged.len(),
        })
    }

    /// Buffer an insert. Validation runs now; unique constraints and the
    /// duplicate-key check are re-verified by the actor at commit.
    pub async fn insert(&self, data: FieldMap) -> Result<Record> {
        let mut guard = self.tx.state.lock().await;
        let buffer = ensure_buffer(&self.tx, &mut guard, &self.name)?;
        let validator = Arc::clone(&buffer.access.validator);

        let needs_counter = validator
            .def()
            .fields
            .values()
            .any(|f| f.generated == Some(GeneratedValue::Autoincrement));
        if needs_counter && buffer.base_counter.is_none() {
            let counter = buffer.access.handle.autoincrement_counter().await?;
            buffer.base_counter = Some(counter);
        }

        let next = buffer.base_counter.unwrap_or(0) + buffer.reserved + 1;
        let prepared = validator.prepare_insert(data, next, now_ms())?;
        let key = prepared.key;
        let record = prepared.record;

        match buffer.ops.get(&key) {
            Some(TxOp::Delete { base_version }) => {
                // delete-then-insert collapses into a replace
                let base_version = *base_version;
                let mut replacement = record.clone();
                replacement.version = base_version + 1;
                buffer.ops.insert(
                    key,
                    TxOp::Update {
                        base_version,
                        record: replacement.clone(),
                    },
                );
                return Ok(replacement);
            }
            Some(_) => {
                return Err(StoreError::DuplicateKey { key: key.to_string() });
            }
            None => {}
        }
        if buffer.access.handle.get(key.to_value()).await?.is_some() {
            return Err(StoreError::DuplicateKey { key: key.to_string() });
        }

        if prepared.used_autoincrement {
            buffer.reserved += 1;
        }
        buffer.ops.insert(key, TxOp::Insert { record: record.clone() });
        Ok(record)
    }

    /// Buffer an update against the overlay view of the record. The
    /// expected version is pinned by the first read of each key.
    pub async fn update(&self, key: impl Into<Value>, changes: FieldMap) -> Result<Record> {
        let key_value = key.into();
        let key = IndexKey::from_value(&key_value).ok_or_else(|| StoreError::NotFound {
            bucket: self.name.clone(),
            key: key_value.to_string(),
        })?;

        let mut guard = self.tx.state.lock().await;
        let buffer = ensure_buffer(&self.tx, &mut guard, &self.name)?;
        let validator = Arc::clone(&buffer.access.validator);

        match buffer.ops.get(&key) {
            Some(TxOp::Delete { .. }) => Err(StoreError::NotFound {
                bucket: self.name.clone(),
                key: key.to_string(),
            }),
            Some(TxOp::Insert { record }) => {
                let updated = validator.prepare_update(record, changes, now_ms())?;
                buffer.ops.insert(key, TxOp::Insert { record: updated.clone() });
                Ok(updated)
            }
            Some(TxOp::Update {
                base_version,
                record,
            }) => {
                let base_version = *base_version;
                let updated = validator.prepare_update(record, changes, now_ms())?;
                buffer.ops.insert(
                    key,
                    TxOp::Update {
                        base_version,
                        record: updated.clone(),
                    },
                );
                Ok(updated)
            }
            None => {
                let existing = buffer
                    .access
                    .handle
                    .get(key.to_value())
                    .await?
                    .ok_or_else(|| StoreError::NotFound {
                        bucket: self.name.clone(),
                        key: key.to_string(),
                    })?;
                let updated = validator.prepare_update(&existing, changes, now_ms())?;
                buffer.ops.insert(
                    key,
                    TxOp::Update {
                        base_version: existing.version,
                        record: updated.clone(),
                    },
                );
                Ok(updated)
            }
        }
    }

    /// Buffer a delete. Deleting a key this transaction inserted simply
    /// drops the buffered insert.
    pub async fn delete(&self, key: impl Into<Value>) -> Result<bool> {
        let Some(key) = IndexKey::from_value(&key.into()) else {
            return Ok(false);
        };
        let mut guard = self.tx.state.lock().await;
        let buffer = ensure_buffer(&self.tx, &mut guard, &self.name)?;

        match buffer.ops.get(&key) {
            Some(TxOp::Insert { .. }) => {
                buffer.ops.shift_remove(&key);
                Ok(true)
            }
            Some(TxOp::Update { base_version, .. }) => {
                let base_version = *base_version;
                buffer.ops.insert(key, TxOp::Delete { base_version });
                Ok(true)
            }
            Some(TxOp::Delete { .. }) => Ok(false),
            None => match buffer.access.handle.get(key.to_value()).await? {
                Some(existing) => {
                    buffer.ops.insert(
                        key,
                        TxOp::Delete {
                            base_version: existing.version,
                        },
                    );
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }
}

/// Find or create the per-bucket buffer, resolving the bucket on first
/// touch. Rejects any use after commit.
fn ensure_buffer<'a>(
    tx: &TxInner,
    state: &'a mut TxState,
    name: &str,
) -> Result<&'a mut TxBuffer> {
    if state.committed {
        return Err(StoreError::AlreadyCommitted);
    }
    match state.buffers.entry(name.to_string()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let access = (tx.resolver)(name)?;
            Ok(entry.insert(TxBuffer::new(access)))
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
