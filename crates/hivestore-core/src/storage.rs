//! Storage adapter contract
//!
//! The persistence coordinator writes bucket snapshots through this trait
//! and reads them back at startup. The on-disk format is adapter-defined;
//! the [`SnapshotEnvelope`] shape is the contract. An in-memory adapter is
//! provided for tests and for stores that want restart-free persistence
//! semantics without touching disk.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::schema::Record;
use crate::value::IndexKey;

/// Version of the envelope layout, for forward-compatible migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// One bucket's complete observable state at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSnapshot {
    /// Records in table insertion order
    pub records: Vec<(IndexKey, Record)>,
    pub autoincrement: u64,
}

/// Envelope metadata stamped on every save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Unix milliseconds
    pub persisted_at: i64,
    pub store_name: String,
    pub schema_version: u32,
}

/// What an adapter stores and returns: snapshot plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub state: BucketSnapshot,
    pub metadata: SnapshotMetadata,
}

/// Pluggable snapshot storage.
///
/// Guarantees required of implementations:
/// - `save` is idempotent on retry for the same key and envelope.
/// - `load` returns `None` for a key that was never saved (not an error).
/// - Concurrent `save` calls for distinct keys are tolerated.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Persist the envelope under `key`, replacing any prior value.
    async fn save(&self, key: &str, envelope: &SnapshotEnvelope) -> Result<()>;

    /// Retrieve the envelope stored under `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<SnapshotEnvelope>>;

    /// Release adapter resources. Called once at store stop.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryAdapter
// ---------------------------------------------------------------------------

/// In-memory adapter backed by a `HashMap<key, serialized envelope>`.
///
/// Serializes envelopes to JSON on save so tests exercise the same
/// round-trip a real backend would.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored envelopes (test helper).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn save(&self, key: &str, envelope: &SnapshotEnvelope) -> Result<()> {
        let serialized =
            serde_json::to_string(envelope).map_err(|e| StoreError::Storage(e.to_string()))?;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), serialized);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<SnapshotEnvelope>> {
        let serialized = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.get(key).cloned()
        };
        match serialized {
            Some(serialized) => serde_json::from_str(&serialized)
                .map(Some)
                .map_err(|e| StoreError::Storage(e.to_string())),
            None => Ok(None),
        }
    }
}
