//! Secondary and unique indexes for one bucket
//!
//! Owned exclusively by the bucket actor. Secondary indexes map a field
//! value to the set of primary keys holding it; unique indexes map a field
//! value to the single primary key allowed to hold it.
//!
//! Index keys use the canonical [`IndexKey`] form, so equality matches the
//! reactive layer's deep equality (NaN equals NaN, `-0.0` equals `0.0`).
//! Fields that are absent, null, or non-primitive in a record are simply
//! not indexed; absent values are not unique-constrained.

use std::collections::{BTreeSet, HashMap};

use crate::error::{Result, StoreError};
use crate::schema::{BucketDef, Record};
use crate::value::{IndexKey, Value};

#[derive(Debug, Default)]
pub struct IndexManager {
    /// field -> value -> primary keys
    secondary: HashMap<String, HashMap<IndexKey, BTreeSet<IndexKey>>>,
    /// field -> value -> owning primary key
    unique: HashMap<String, HashMap<IndexKey, IndexKey>>,
}

impl IndexManager {
    pub fn new(def: &BucketDef) -> Self {
        let mut secondary = HashMap::new();
        for field in &def.indexes {
            secondary.entry(field.clone()).or_insert_with(HashMap::new);
        }
        let mut unique = HashMap::new();
        for field in def.unique_fields() {
            unique.insert(field.to_string(), HashMap::new());
        }
        IndexManager { secondary, unique }
    }

    /// Whether `field` has a secondary index (used for the `where` fast path).
    pub fn is_indexed(&self, field: &str) -> bool {
        self.secondary.contains_key(field)
    }

    pub fn secondary_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.secondary.keys().cloned().collect();
        fields.sort();
        fields
    }

    pub fn unique_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.unique.keys().cloned().collect();
        fields.sort();
        fields
    }

    /// Index a record under `key`. Fails without touching any index if a
    /// unique-indexed value is already owned by a different key.
    pub fn add_record(&mut self, key: &IndexKey, record: &Record) -> Result<()> {
        self.check_unique_conflicts(key, record)?;
        self.apply_add(key, record);
        Ok(())
    }

    /// Remove a record's entries, dropping empty value buckets.
    pub fn remove_record(&mut self, key: &IndexKey, record: &Record) {
        for (field, buckets) in &mut self.secondary {
            if let Some(value) = indexable(record, field) {
                if let Some(keys) = buckets.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        buckets.remove(&value);
                    }
                }
            }
        }
        for (field, owners) in &mut self.unique {
            if let Some(value) = indexable(record, field) {
                if owners.get(&value) == Some(key) {
                    owners.remove(&value);
                }
            }
        }
    }

    /// Transition a record's entries from `old` to `new`. On a unique
    /// conflict the old state is restored before the error returns.
    /// Re-asserting the same unique value is a no-op, not a conflict.
    pub fn update_record(&mut self, key: &IndexKey, old: &Record, new: &Record) -> Result<()> {
        self.remove_record(key, old);
        if let Err(err) = self.check_unique_conflicts(key, new) {
            self.apply_add(key, old);
            return Err(err);
        }
        self.apply_add(key, new);
        Ok(())
    }

    /// Primary keys holding `value` in the secondary index for `field`.
    /// Empty when the value (or the index) is absent.
    pub fn lookup(&self, field: &str, value: &Value) -> BTreeSet<IndexKey> {
        let Some(key) = IndexKey::from_value(value) else {
            return BTreeSet::new();
        };
        self.secondary
            .get(field)
            .and_then(|buckets| buckets.get(&key))
            .cloned()
            .unwrap_or_default()
    }

    /// Owning primary key for `value` in the unique index for `field`.
    pub fn lookup_unique(&self, field: &str, value: &Value) -> Option<IndexKey> {
        let key = IndexKey::from_value(value)?;
        self.unique.get(field).and_then(|owners| owners.get(&key)).cloned()
    }

    /// Clear everything and re-index the given records.
    pub fn rebuild<'a, I>(&mut self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a IndexKey, &'a Record)>,
    {
        for buckets in self.secondary.values_mut() {
            buckets.clear();
        }
        for owners in self.unique.values_mut() {
            owners.clear();
        }
        for (key, record) in records {
            self.add_record(key, record)?;
        }
        Ok(())
    }

    fn check_unique_conflicts(&self, key: &IndexKey, record: &Record) -> Result<()> {
        for (field, owners) in &self.unique {
            if let Some(value) = indexable(record, field) {
                if let Some(owner) = owners.get(&value) {
                    if owner != key {
                        return Err(StoreError::UniqueConstraint {
                            field: field.clone(),
                            value: value.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_add(&mut self, key: &IndexKey, record: &Record) {
        for (field, buckets) in &mut self.secondary {
            if let Some(value) = indexable(record, field) {
                buckets.entry(value).or_default().insert(key.clone());
            }
        }
        for (field, owners) in &mut self.unique {
            if let Some(value) = indexable(record, field) {
                owners.insert(value, key.clone());
            }
        }
    }
}

fn indexable(record: &Record, field: &str) -> Option<IndexKey> {
    match record.get(field) {
        None | Some(Value::Null) => None,
        Some(value) => IndexKey::from_value(value),
    }
}
