//! Bucket actor
//!
//! One actor owns one bucket: its primary table (insertion-ordered), its
//! autoincrement counter and its indexes. All access goes through a
//! mailbox processed strictly in arrival order with one message in flight
//! at a time, which is the store's core serialization guarantee.
//!
//! Every mutation path keeps the invariant web intact: schema validation,
//! index transitions, unique constraints, TTL stamping, size-bounded
//! eviction and event publication all happen inside the message turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::events::{EventBus, StoreEvent};
use crate::index::IndexManager;
use crate::schema::{PreparedInsert, Record, SchemaValidator};
use crate::storage::BucketSnapshot;
use crate::value::{deep_equal, FieldMap, IndexKey, Value};

const MAILBOX_CAPACITY: usize = 64;

/// Equality filter: every named field must deep-equal the given value.
pub type Filter = BTreeMap<String, Value>;

/// Point-in-time counters for one bucket.
#[derive(Debug, Clone)]
pub struct BucketStats {
    pub name: String,
    pub size: usize,
    pub autoincrement: u64,
    pub indexes: Vec<String>,
    pub unique_indexes: Vec<String>,
    pub ttl_ms: Option<u64>,
    pub max_size: Option<usize>,
}

// ---------------------------------------------------------------------------
// Batch operations (transaction support)
// ---------------------------------------------------------------------------

/// One prepared operation inside a `commit_batch`.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Insert {
        key: IndexKey,
        record: Record,
    },
    Update {
        key: IndexKey,
        record: Record,
        expected_version: Option<u64>,
    },
    Delete {
        key: IndexKey,
        expected_version: Option<u64>,
    },
}

/// Inverse of one applied batch step, replayed in reverse on rollback.
#[derive(Debug, Clone)]
pub enum UndoOp {
    /// Undo an insert
    Remove { key: IndexKey },
    /// Undo an update, delete or eviction by restoring the prior record
    Restore { key: IndexKey, record: Record },
    /// Undo an autoincrement override
    SetAutoincrement { value: u64 },
}

/// Successful `commit_batch` result: the undo log plus the events that
/// would have been emitted. The transaction coordinator publishes the
/// events only once every participating bucket has committed.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub undo_ops: Vec<UndoOp>,
    pub events: Vec<StoreEvent>,
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T>>;

enum BucketMsg {
    Get {
        key: IndexKey,
        reply: Reply<Option<Record>>,
    },
    All {
        reply: Reply<Vec<(IndexKey, Record)>>,
    },
    FindWhere {
        filter: Filter,
        reply: Reply<Vec<(IndexKey, Record)>>,
    },
    FindOne {
        filter: Filter,
        reply: Reply<Option<(IndexKey, Record)>>,
    },
    Count {
        filter: Option<Filter>,
        reply: Reply<usize>,
    },
    Insert {
        data: FieldMap,
        reply: Reply<Record>,
    },
    Update {
        key: IndexKey,
        changes: FieldMap,
        reply: Reply<Record>,
    },
    Delete {
        key: IndexKey,
        reply: Reply<bool>,
    },
    Stats {
        reply: Reply<BucketStats>,
    },
    PurgeExpired {
        reply: Reply<usize>,
    },
    Snapshot {
        reply: Reply<BucketSnapshot>,
    },
    CommitBatch {
        ops: Vec<BatchOp>,
        autoincrement: Option<u64>,
        reply: Reply<BatchOutcome>,
    },
    RollbackBatch {
        undo_ops: Vec<UndoOp>,
        reply: Reply<()>,
    },
    AutoincrementCounter {
        reply: Reply<u64>,
    },
    Close,
}

/// Cloneable client side of a bucket's mailbox.
///
/// Send failures mean the actor has shut down; they surface as
/// [`StoreError::StoreStopped`].
#[derive(Clone, Debug)]
pub struct BucketHandle {
    name: String,
    sender: mpsc::Sender<BucketMsg>,
}

impl BucketHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> BucketMsg,
    {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| StoreError::StoreStopped)?;
        rx.await.map_err(|_| StoreError::StoreStopped)?
    }

    /// Fetch one record by primary key. O(1).
    pub async fn get(&self, key: impl Into<Value>) -> Result<Option<Record>> {
        let Some(key) = IndexKey::from_value(&key.into()) else {
            return Ok(None);
        };
        self.request(|reply| BucketMsg::Get { key, reply }).await
    }

    /// All records in insertion order.
    pub async fn all(&self) -> Result<Vec<(IndexKey, Record)>> {
        self.request(|reply| BucketMsg::All { reply }).await
    }

    /// Records matching an equality filter, in insertion order. A filter
    /// on a single indexed field uses the index instead of scanning.
    pub async fn find_where(&self, filter: Filter) -> Result<Vec<(IndexKey, Record)>> {
        self.request(|reply| BucketMsg::FindWhere { filter, reply }).await
    }

    /// First record matching the filter, in insertion order.
    pub async fn find_one(&self, filter: Filter) -> Result<Option<(IndexKey, Record)>> {
        self.request(|reply| BucketMsg::FindOne { filter, reply }).await
    }

    pub async fn count(&self, filter: Option<Filter>) -> Result<usize> {
        self.request(|reply| BucketMsg::Count { filter, reply }).await
    }

    pub async fn insert(&self, data: FieldMap) -> Result<Record> {
        self.request(|reply| BucketMsg::Insert { data, reply }).await
    }

    pub async fn update(&self, key: impl Into<Value>, changes: FieldMap) -> Result<Record> {
        let key_value = key.into();
        let key = IndexKey::from_value(&key_value).ok_or_else(|| StoreError::NotFound {
            bucket: self.name.clone(),
            key: key_value.to_string(),
        })?;
        self.request(|reply| BucketMsg::Update { key, changes, reply }).await
    }

    /// Remove a record. Returns whether anything was deleted; deleting an
    /// absent key is not an error.
    pub async fn delete(&self, key: impl Into<Value>) -> Result<bool> {
        let Some(key) = IndexKey::from_value(&key.into()) else {
            return Ok(false);
        };
        self.request(|reply| BucketMsg::Delete { key, reply }).await
    }

    pub async fn stats(&self) -> Result<BucketStats> {
        self.request(|reply| BucketMsg::Stats { reply }).await
    }

    /// Delete every record whose expiry has passed. Returns the count.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.request(|reply| BucketMsg::PurgeExpired { reply }).await
    }

    /// Capture the bucket's complete state within one message turn, so the
    /// snapshot is atomic with respect to concurrent mutations.
    pub async fn snapshot(&self) -> Result<BucketSnapshot> {
        self.request(|reply| BucketMsg::Snapshot { reply }).await
    }

    pub async fn commit_batch(
        &self,
        ops: Vec<BatchOp>,
        autoincrement: Option<u64>,
    ) -> Result<BatchOutcome> {
        self.request(|reply| BucketMsg::CommitBatch { ops, autoincrement, reply })
            .await
    }

    pub async fn rollback_batch(&self, undo_ops: Vec<UndoOp>) -> Result<()> {
        self.request(|reply| BucketMsg::RollbackBatch { undo_ops, reply }).await
    }

    pub async fn autoincrement_counter(&self) -> Result<u64> {
        self.request(|reply| BucketMsg::AutoincrementCounter { reply }).await
    }

    /// Ask the actor to stop once every message ahead of this one has
    /// been processed. Later messages are rejected with `StoreStopped`.
    pub(crate) async fn close(&self) {
        let _ = self.sender.send(BucketMsg::Close).await;
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub struct BucketActor {
    name: String,
    validator: Arc<SchemaValidator>,
    table: IndexMap<IndexKey, Record>,
    autoincrement: u64,
    indexes: IndexManager,
    bus: Arc<EventBus>,
}

impl BucketActor {
    /// Restore state from an optional snapshot (no events), then start the
    /// mailbox task. Messages are only accepted once restore is complete.
    pub fn spawn(
        validator: Arc<SchemaValidator>,
        snapshot: Option<BucketSnapshot>,
        bus: Arc<EventBus>,
    ) -> Result<(BucketHandle, JoinHandle<()>)> {
        let def = validator.def();
        let name = def.name.clone();
        let mut indexes = IndexManager::new(def);
        let mut table = IndexMap::new();
        let mut autoincrement = 0;

        if let Some(snapshot) = snapshot {
            autoincrement = snapshot.autoincrement;
            for (key, record) in snapshot.records {
                table.insert(key, record);
            }
            indexes.rebuild(table.iter())?;
            debug!(bucket = %name, records = table.len(), "restored bucket state");
        }

        let actor = BucketActor {
            name: name.clone(),
            validator,
            table,
            autoincrement,
            indexes,
            bus,
        };

        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let task = tokio::spawn(actor.run(receiver));
        Ok((BucketHandle { name, sender }, task))
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<BucketMsg>) {
        while let Some(msg) = mailbox.recv().await {
            if matches!(msg, BucketMsg::Close) {
                // unanswered messages behind the close are dropped, which
                // surfaces as StoreStopped at their call sites
                mailbox.close();
                break;
            }
            self.handle(msg);
        }
        debug!(bucket = %self.name, "bucket actor stopped");
    }

    fn handle(&mut self, msg: BucketMsg) {
        match msg {
            BucketMsg::Get { key, reply } => {
                let _ = reply.send(Ok(self.table.get(&key).cloned()));
            }
            BucketMsg::All { reply } => {
                let _ = reply.send(Ok(self.collect_all()));
            }
            BucketMsg::FindWhere { filter, reply } => {
                let _ = reply.send(Ok(self.find_where(&filter)));
            }
            BucketMsg::FindOne { filter, reply } => {
                let found = self
                    .table
                    .iter()
                    .find(|(_, record)| matches_filter(record, &filter))
                    .map(|(key, record)| (key.clone(), record.clone()));
                let _ = reply.send(Ok(found));
            }
            BucketMsg::Count { filter, reply } => {
                let count = match filter {
                    Some(filter) => self.find_where(&filter).len(),
                    None => self.table.len(),
                };
                let _ = reply.send(Ok(count));
            }
            BucketMsg::Insert { data, reply } => {
                let _ = reply.send(self.insert(data));
            }
            BucketMsg::Update { key, changes, reply } => {
                let _ = reply.send(self.update(key, changes));
            }
            BucketMsg::Delete { key, reply } => {
                let _ = reply.send(Ok(self.delete(&key)));
            }
            BucketMsg::Stats { reply } => {
                let def = self.validator.def();
                let _ = reply.send(Ok(BucketStats {
                    name: self.name.clone(),
                    size: self.table.len(),
                    autoincrement: self.autoincrement,
                    indexes: self.indexes.secondary_fields(),
                    unique_indexes: self.indexes.unique_fields(),
                    ttl_ms: def.ttl.map(|t| t.as_millis() as u64),
                    max_size: def.max_size,
                }));
            }
            BucketMsg::PurgeExpired { reply } => {
                let _ = reply.send(Ok(self.purge_expired()));
            }
            BucketMsg::Snapshot { reply } => {
                let _ = reply.send(Ok(BucketSnapshot {
                    records: self.collect_all(),
                    autoincrement: self.autoincrement,
                }));
            }
            BucketMsg::CommitBatch { ops, autoincrement, reply } => {
                let _ = reply.send(self.commit_batch(ops, autoincrement));
            }
            BucketMsg::RollbackBatch { undo_ops, reply } => {
                self.rollback_batch(undo_ops);
                let _ = reply.send(Ok(()));
            }
            BucketMsg::AutoincrementCounter { reply } => {
                let _ = reply.send(Ok(self.autoincrement));
            }
            // intercepted by the run loop
            BucketMsg::Close => {}
        }
    }

    fn collect_all(&self) -> Vec<(IndexKey, Record)> {
        self.table
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect()
    }

    fn find_where(&self, filter: &Filter) -> Vec<(IndexKey, Record)> {
        // single indexed-field equality takes the index fast path
        if filter.len() == 1 {
            if let Some((field, value)) = filter.iter().next() {
                if self.indexes.is_indexed(field) {
                    let mut hits: Vec<(usize, IndexKey)> = self
                        .indexes
                        .lookup(field, value)
                        .into_iter()
                        .filter_map(|key| self.table.get_index_of(&key).map(|pos| (pos, key)))
                        .collect();
                    hits.sort_by_key(|(pos, _)| *pos);
                    return hits
                        .into_iter()
                        .filter_map(|(_, key)| {
                            self.table.get(&key).map(|record| (key.clone(), record.clone()))
                        })
                        .collect();
                }
            }
        }
        self.table
            .iter()
            .filter(|(_, record)| matches_filter(record, filter))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect()
    }

    /// Insert protocol: validate, index, duplicate check, evict to make
    /// room, store, commit the counter, emit.
    fn insert(&mut self, data: FieldMap) -> Result<Record> {
        let now = now_ms();
        let PreparedInsert {
            key,
            record,
            used_autoincrement,
        } = self
            .validator
            .prepare_insert(data, self.autoincrement + 1, now)?;

        self.indexes.add_record(&key, &record)?;
        if self.table.contains_key(&key) {
            self.indexes.remove_record(&key, &record);
            return Err(StoreError::DuplicateKey { key: key.to_string() });
        }

        // evict before adding so capacity is exactly reached
        if let Some(max_size) = self.validator.def().max_size {
            if self.table.len() >= max_size {
                let excess = self.table.len() - max_size + 1;
                for (evicted_key, evicted) in self.take_oldest(excess) {
                    self.bus
                        .publish(&StoreEvent::deleted(&self.name, evicted_key, evicted, now));
                }
            }
        }

        self.table.insert(key.clone(), record.clone());
        if used_autoincrement {
            self.autoincrement += 1;
        }
        self.bus
            .publish(&StoreEvent::inserted(&self.name, key, record.clone(), now));
        Ok(record)
    }

    /// Update protocol: look up, validate the change set, transition the
    /// indexes, replace, emit `{old, new}`.
    fn update(&mut self, key: IndexKey, changes: FieldMap) -> Result<Record> {
        let now = now_ms();
        let existing = self
            .table
            .get(&key)
            .cloned()
            .ok_or_else(|| self.not_found(&key))?;
        let new = self.validator.prepare_update(&existing, changes, now)?;
        self.indexes.update_record(&key, &existing, &new)?;
        self.table.insert(key.clone(), new.clone());
        self.bus
            .publish(&StoreEvent::updated(&self.name, key, existing, new.clone(), now));
        Ok(new)
    }

    fn delete(&mut self, key: &IndexKey) -> bool {
        let Some(record) = self.table.shift_remove(key) else {
            return false;
        };
        self.indexes.remove_record(key, &record);
        self.bus
            .publish(&StoreEvent::deleted(&self.name, key.clone(), record, now_ms()));
        true
    }

    fn purge_expired(&mut self) -> usize {
        let now = now_ms();
        let expired: Vec<IndexKey> = self
            .table
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.delete(key);
        }
        expired.len()
    }

    /// Remove the `n` oldest records by `created_at`, insertion order
    /// breaking ties. Returns them for event emission or undo logging.
    fn take_oldest(&mut self, n: usize) -> Vec<(IndexKey, Record)> {
        let mut order: Vec<(usize, IndexKey, i64)> = self
            .table
            .iter()
            .enumerate()
            .map(|(pos, (key, record))| (pos, key.clone(), record.created_at))
            .collect();
        order.sort_by(|a, b| a.2.cmp(&b.2).then(a.0.cmp(&b.0)));
        order.truncate(n);

        let mut removed = Vec::with_capacity(order.len());
        for (_, key, _) in order {
            if let Some(record) = self.table.shift_remove(&key) {
                self.indexes.remove_record(&key, &record);
                removed.push((key, record));
            }
        }
        removed
    }

    /// Apply a transaction's operations for this bucket. Either every
    /// operation applies, or none does: a mid-batch failure replays the
    /// undo log before the error returns, and no events leave the actor.
    fn commit_batch(
        &mut self,
        ops: Vec<BatchOp>,
        autoincrement: Option<u64>,
    ) -> Result<BatchOutcome> {
        let now = now_ms();
        let mut undo_ops = Vec::new();
        let mut events = Vec::new();

        if let Err(err) = self.apply_batch(ops, now, &mut undo_ops, &mut events) {
            for op in undo_ops.into_iter().rev() {
                if let Err(undo_err) = self.apply_undo(op) {
                    warn!(bucket = %self.name, error = %undo_err, "batch self-rollback step failed");
                }
            }
            return Err(err);
        }

        if let Some(value) = autoincrement {
            if value > self.autoincrement {
                undo_ops.push(UndoOp::SetAutoincrement {
                    value: self.autoincrement,
                });
                self.autoincrement = value;
            }
        }

        Ok(BatchOutcome { undo_ops, events })
    }

    fn apply_batch(
        &mut self,
        ops: Vec<BatchOp>,
        now: i64,
        undo_ops: &mut Vec<UndoOp>,
        events: &mut Vec<StoreEvent>,
    ) -> Result<()> {
        for op in ops {
            match op {
                BatchOp::Insert { key, record } => {
                    self.indexes.add_record(&key, &record)?;
                    if self.table.contains_key(&key) {
                        self.indexes.remove_record(&key, &record);
                        return Err(StoreError::DuplicateKey { key: key.to_string() });
                    }
                    if let Some(max_size) = self.validator.def().max_size {
                        if self.table.len() >= max_size {
                            let excess = self.table.len() - max_size + 1;
                            for (evicted_key, evicted) in self.take_oldest(excess) {
                                undo_ops.push(UndoOp::Restore {
                                    key: evicted_key.clone(),
                                    record: evicted.clone(),
                                });
                                events.push(StoreEvent::deleted(
                                    &self.name,
                                    evicted_key,
                                    evicted,
                                    now,
                                ));
                            }
                        }
                    }
                    self.table.insert(key.clone(), record.clone());
                    undo_ops.push(UndoOp::Remove { key: key.clone() });
                    events.push(StoreEvent::inserted(&self.name, key, record, now));
                }
                BatchOp::Update {
                    key,
                    record,
                    expected_version,
                } => {
                    let existing = self
                        .table
                        .get(&key)
                        .cloned()
                        .ok_or_else(|| self.not_found(&key))?;
                    self.check_version(&key, &existing, expected_version)?;
                    self.indexes.update_record(&key, &existing, &record)?;
                    self.table.insert(key.clone(), record.clone());
                    undo_ops.push(UndoOp::Restore {
                        key: key.clone(),
                        record: existing.clone(),
                    });
                    events.push(StoreEvent::updated(&self.name, key, existing, record, now));
                }
                BatchOp::Delete {
                    key,
                    expected_version,
                } => {
                    let existing = self
                        .table
                        .get(&key)
                        .cloned()
                        .ok_or_else(|| self.not_found(&key))?;
                    self.check_version(&key, &existing, expected_version)?;
                    self.indexes.remove_record(&key, &existing);
                    self.table.shift_remove(&key);
                    undo_ops.push(UndoOp::Restore {
                        key: key.clone(),
                        record: existing.clone(),
                    });
                    events.push(StoreEvent::deleted(&self.name, key, existing, now));
                }
            }
        }
        Ok(())
    }

    /// Replay an undo log in reverse, bypassing validation. Individual
    /// failures are swallowed so the remaining undos still run.
    fn rollback_batch(&mut self, undo_ops: Vec<UndoOp>) {
        for op in undo_ops.into_iter().rev() {
            if let Err(err) = self.apply_undo(op) {
                warn!(bucket = %self.name, error = %err, "rollback step failed; continuing");
            }
        }
    }

    fn apply_undo(&mut self, op: UndoOp) -> Result<()> {
        match op {
            UndoOp::Remove { key } => {
                if let Some(record) = self.table.shift_remove(&key) {
                    self.indexes.remove_record(&key, &record);
                }
                Ok(())
            }
            UndoOp::Restore { key, record } => {
                match self.table.get(&key).cloned() {
                    Some(current) => {
                        self.indexes.update_record(&key, &current, &record)?;
                    }
                    None => {
                        self.indexes.add_record(&key, &record)?;
                    }
                }
                self.table.insert(key, record);
                Ok(())
            }
            UndoOp::SetAutoincrement { value } => {
                self.autoincrement = value;
                Ok(())
            }
        }
    }

    fn check_version(
        &self,
        key: &IndexKey,
        existing: &Record,
        expected: Option<u64>,
    ) -> Result<()> {
        if let Some(expected) = expected {
            if existing.version != expected {
                return Err(StoreError::VersionConflict {
                    bucket: self.name.clone(),
                    key: key.to_string(),
                    expected,
                    actual: existing.version,
                });
            }
        }
        Ok(())
    }

    fn not_found(&self, key: &IndexKey) -> StoreError {
        StoreError::NotFound {
            bucket: self.name.clone(),
            key: key.to_string(),
        }
    }
}

pub(crate) fn matches_filter(record: &Record, filter: &Filter) -> bool {
    filter.iter().all(|(field, want)| match record.get(field) {
        Some(value) => deep_equal(value, want),
        None => want.is_null(),
    })
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
