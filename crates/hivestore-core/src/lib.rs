//! Hivestore: reactive in-memory bucket store
//!
//! A process-local collection of schema-validated key-value tables
//! ("buckets") with secondary indexes, change events, reactive derived
//! queries, atomic multi-bucket transactions, TTL expiration,
//! size-bounded eviction and debounced snapshot persistence.
//!
//! ## Key Components
//!
//! - [`Store`]: facade owning one actor per bucket plus the shared bus
//! - [`BucketDef`] / [`FieldDef`]: declarative bucket schemas
//! - [`BucketHandle`]: serialized CRUD access to one bucket
//! - [`Transaction`]: buffered multi-bucket writes with overlay reads
//! - [`StorageAdapter`]: pluggable snapshot persistence contract
//!
//! Every mutation flows through its bucket's mailbox, which updates the
//! indexes, enforces TTL and size bounds, publishes a change event, and
//! thereby drives query invalidation and persistence dirty-marking.

mod bucket;
mod duration;
mod error;
mod events;
mod index;
mod persistence;
mod query;
mod schema;
mod storage;
mod store;
mod telemetry;
mod transaction;
mod ttl;
mod value;

pub use bucket::{BatchOp, BatchOutcome, BucketHandle, BucketStats, Filter, UndoOp};
pub use duration::parse_duration;
pub use error::{Result, StoreError};
pub use events::{EventBus, EventKind, StoreEvent, SubscriptionToken, TopicPattern};
pub use persistence::{ErrorHook, PersistenceConfig};
pub use query::{QueryBucket, QueryContext, QuerySubscription};
pub use schema::{
    BucketDef, FieldDef, FieldFormat, FieldType, GeneratedValue, Record, EXPIRES_AT_FIELD,
};
pub use storage::{
    BucketSnapshot, MemoryAdapter, SnapshotEnvelope, SnapshotMetadata, StorageAdapter,
    SCHEMA_VERSION,
};
pub use store::{Store, StoreConfig};
pub use telemetry::{init_tracing, LogFormat};
pub use transaction::{Transaction, TxBucket};
pub use value::{deep_equal, FieldMap, IndexKey, Value};
