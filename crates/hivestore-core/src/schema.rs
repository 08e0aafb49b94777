//! Bucket definitions and schema validation
//!
//! A bucket is declared once with a [`BucketDef`] (primary key, field
//! schema, secondary indexes, TTL, max size, persistence opt-out) and is
//! immutable afterwards. [`SchemaValidator`] is built from the definition
//! at define time (compiling pattern regexes, checking the definition
//! itself) and computes prepared records for the insert and update paths.
//!
//! Uniqueness is not enforced here; the bucket actor checks it against the
//! unique index.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::DateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::value::{deep_equal, IndexKey, Value};

/// Reserved input key carrying a caller-supplied expiry instant.
pub const EXPIRES_AT_FIELD: &str = "_expires_at";

// ---------------------------------------------------------------------------
// Field definitions
// ---------------------------------------------------------------------------

/// Value shape a field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Date,
}

/// Syntactic format constraint for string fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldFormat {
    Email,
    Url,
    IsoDate,
}

/// Strategy for filling a field the caller left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratedValue {
    Uuid,
    Cuid,
    Autoincrement,
    Timestamp,
}

/// Schema definition for one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<Value>,
    pub generated: Option<GeneratedValue>,
    pub enum_values: Option<Vec<Value>>,
    pub format: Option<FieldFormat>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub unique: bool,
}

impl FieldDef {
    pub fn new(field_type: FieldType) -> Self {
        FieldDef {
            field_type,
            required: false,
            default: None,
            generated: None,
            enum_values: None,
            format: None,
            min: None,
            max: None,
            min_length: None,
            max_length: None,
            pattern: None,
            unique: false,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn number() -> Self {
        Self::new(FieldType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    pub fn object() -> Self {
        Self::new(FieldType::Object)
    }

    pub fn array() -> Self {
        Self::new(FieldType::Array)
    }

    pub fn date() -> Self {
        Self::new(FieldType::Date)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn generated(mut self, strategy: GeneratedValue) -> Self {
        self.generated = Some(strategy);
        self
    }

    /// Restrict the field to one of the given values.
    pub fn one_of(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn format(mut self, format: FieldFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Regex the string value must match. Compiled (and checked) when the
    /// bucket is defined.
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Bucket definition
// ---------------------------------------------------------------------------

/// Declarative definition of one bucket. Immutable after `define_bucket`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketDef {
    pub name: String,
    pub primary_key: String,
    pub fields: BTreeMap<String, FieldDef>,
    /// Secondary index field names
    pub indexes: Vec<String>,
    /// Default record lifetime; stamped as `expires_at` on insert
    pub ttl: Option<Duration>,
    pub max_size: Option<usize>,
    /// Whether snapshots of this bucket are persisted (on by default)
    pub persist: bool,
}

impl BucketDef {
    pub fn new(name: &str, primary_key: &str) -> Self {
        BucketDef {
            name: name.to_string(),
            primary_key: primary_key.to_string(),
            fields: BTreeMap::new(),
            indexes: Vec::new(),
            ttl: None,
            max_size: None,
            persist: true,
        }
    }

    pub fn field(mut self, name: &str, def: FieldDef) -> Self {
        self.fields.insert(name.to_string(), def);
        self
    }

    pub fn index(mut self, field: &str) -> Self {
        self.indexes.push(field.to_string());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Opt this bucket out of snapshot persistence.
    pub fn ephemeral(mut self) -> Self {
        self.persist = false;
        self
    }

    /// Unique-indexed field names (in schema order).
    pub fn unique_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, def)| def.unique)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A stored record: field values plus metadata.
///
/// `version` starts at 1 and is bumped on every update; `created_at`
/// never changes; `updated_at` equals `created_at` on insert and the
/// mutation time on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub fields: BTreeMap<String, Value>,
    pub version: u64,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds
    pub updated_at: i64,
    /// Unix milliseconds; record is purgeable once `expires_at <= now`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

/// Outcome of [`SchemaValidator::prepare_insert`].
#[derive(Debug, Clone)]
pub struct PreparedInsert {
    pub key: IndexKey,
    pub record: Record,
    /// Whether a value was produced by the autoincrement strategy, so the
    /// actor knows to commit the counter increment on success.
    pub used_autoincrement: bool,
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Stateless schema transform, built once per bucket definition.
///
/// Validates the definition itself (primary key present, index fields
/// exist, max size positive) and compiles `pattern` constraints so
/// malformed regexes surface at define time rather than on first insert.
#[derive(Debug)]
pub struct SchemaValidator {
    def: BucketDef,
    patterns: BTreeMap<String, Regex>,
}

impl SchemaValidator {
    pub fn new(def: BucketDef) -> Result<Self> {
        if !def.fields.contains_key(&def.primary_key) {
            return Err(invalid(
                &def.primary_key,
                "primary key is not declared in the schema",
            ));
        }
        for index_field in &def.indexes {
            if !def.fields.contains_key(index_field) {
                return Err(invalid(index_field, "index field is not declared in the schema"));
            }
        }
        if def.max_size == Some(0) {
            return Err(invalid("max_size", "max size must be at least 1"));
        }

        let mut patterns = BTreeMap::new();
        for (name, field) in &def.fields {
            if let Some(pattern) = &field.pattern {
                let regex = Regex::new(pattern)
                    .map_err(|e| invalid(name, &format!("invalid pattern: {e}")))?;
                patterns.insert(name.clone(), regex);
            }
        }

        Ok(SchemaValidator { def, patterns })
    }

    pub fn def(&self) -> &BucketDef {
        &self.def
    }

    /// Compute the record an insert would store.
    ///
    /// Fills generated values (using `autoincrement_next` for the
    /// autoincrement strategy) and defaults, then enforces every per-field
    /// constraint. Unknown fields are rejected. Metadata is stamped with
    /// `version = 1` and `created_at = updated_at = now_ms`; a bucket TTL
    /// sets `expires_at` unless the caller supplied `_expires_at`.
    pub fn prepare_insert(
        &self,
        mut data: BTreeMap<String, Value>,
        autoincrement_next: u64,
        now_ms: i64,
    ) -> Result<PreparedInsert> {
        let expires_override = take_expires_override(&mut data)?;
        self.reject_unknown_fields(&data)?;

        let mut fields = BTreeMap::new();
        let mut used_autoincrement = false;

        for (name, field) in &self.def.fields {
            let mut value = data.remove(name);

            if value.is_none() {
                if let Some(strategy) = &field.generated {
                    if *strategy == GeneratedValue::Autoincrement {
                        used_autoincrement = true;
                    }
                    value = Some(generate_value(*strategy, autoincrement_next, now_ms));
                } else if let Some(default) = &field.default {
                    value = Some(default.clone());
                }
            }

            match value {
                Some(value) => {
                    let value = coerce(field, value);
                    self.validate_field(name, field, &value)?;
                    fields.insert(name.clone(), value);
                }
                None => {
                    if field.required {
                        return Err(invalid(name, "field is required"));
                    }
                }
            }
        }

        let key_value = fields
            .get(&self.def.primary_key)
            .ok_or_else(|| invalid(&self.def.primary_key, "primary key value is missing"))?;
        let key = IndexKey::from_value(key_value)
            .ok_or_else(|| invalid(&self.def.primary_key, "primary key must be a primitive value"))?;

        let expires_at = match expires_override {
            // A caller-supplied expiry is authoritative, even below the bucket default.
            Some(at) => Some(at),
            None => self
                .def
                .ttl
                .map(|ttl| now_ms.saturating_add(ttl.as_millis() as i64)),
        };

        Ok(PreparedInsert {
            key,
            record: Record {
                fields,
                version: 1,
                created_at: now_ms,
                updated_at: now_ms,
                expires_at,
            },
            used_autoincrement,
        })
    }

    /// Compute the record an update would store.
    ///
    /// Only the fields present in `changes` are validated. The primary key
    /// and record metadata cannot be changed; `_expires_at` overrides the
    /// current expiry, which is otherwise preserved.
    pub fn prepare_update(
        &self,
        existing: &Record,
        mut changes: BTreeMap<String, Value>,
        now_ms: i64,
    ) -> Result<Record> {
        let expires_override = take_expires_override(&mut changes)?;
        self.reject_unknown_fields(&changes)?;

        let mut fields = existing.fields.clone();
        for (name, value) in changes {
            if name == self.def.primary_key {
                return Err(invalid(&name, "primary key cannot be changed"));
            }
            let field = self
                .def
                .fields
                .get(&name)
                .ok_or_else(|| invalid(&name, "unknown field"))?;
            let value = coerce(field, value);
            self.validate_field(&name, field, &value)?;
            fields.insert(name, value);
        }

        Ok(Record {
            fields,
            version: existing.version + 1,
            created_at: existing.created_at,
            updated_at: now_ms,
            expires_at: expires_override.or(existing.expires_at),
        })
    }

    fn reject_unknown_fields(&self, data: &BTreeMap<String, Value>) -> Result<()> {
        for name in data.keys() {
            if name.starts_with('_') {
                return Err(invalid(name, "metadata fields are reserved"));
            }
            if !self.def.fields.contains_key(name) {
                return Err(invalid(name, "unknown field"));
            }
        }
        Ok(())
    }

    fn validate_field(&self, name: &str, field: &FieldDef, value: &Value) -> Result<()> {
        if value.is_null() {
            if field.required {
                return Err(invalid(name, "field is required"));
            }
            return Ok(());
        }

        let type_ok = matches!(
            (field.field_type, value),
            (FieldType::String, Value::String(_))
                | (FieldType::Number, Value::Number(_))
                | (FieldType::Boolean, Value::Bool(_))
                | (FieldType::Object, Value::Object(_))
                | (FieldType::Array, Value::Array(_))
                | (FieldType::Date, Value::Date(_))
        );
        if !type_ok {
            return Err(invalid(
                name,
                &format!(
                    "expected {}, got {}",
                    type_label(field.field_type),
                    value.type_name()
                ),
            ));
        }

        if let Some(allowed) = &field.enum_values {
            if !allowed.iter().any(|candidate| deep_equal(candidate, value)) {
                return Err(invalid(name, &format!("value {value} is not one of the allowed values")));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = field.min {
                if n < min {
                    return Err(invalid(name, &format!("value {n} is below minimum {min}")));
                }
            }
            if let Some(max) = field.max {
                if n > max {
                    return Err(invalid(name, &format!("value {n} is above maximum {max}")));
                }
            }
        }

        if let Some(s) = value.as_str() {
            let len = s.chars().count();
            if let Some(min_length) = field.min_length {
                if len < min_length {
                    return Err(invalid(name, &format!("length {len} is below minimum {min_length}")));
                }
            }
            if let Some(max_length) = field.max_length {
                if len > max_length {
                    return Err(invalid(name, &format!("length {len} is above maximum {max_length}")));
                }
            }
            if let Some(regex) = self.patterns.get(name) {
                if !regex.is_match(s) {
                    return Err(invalid(name, "value does not match the required pattern"));
                }
            }
            if let Some(format) = field.format {
                validate_format(name, format, s)?;
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> StoreError {
    StoreError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn type_label(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "string",
        FieldType::Number => "number",
        FieldType::Boolean => "boolean",
        FieldType::Object => "object",
        FieldType::Array => "array",
        FieldType::Date => "date",
    }
}

/// Pull the `_expires_at` override out of an input map, accepting a date
/// or a Unix-millisecond number.
fn take_expires_override(data: &mut BTreeMap<String, Value>) -> Result<Option<i64>> {
    match data.remove(EXPIRES_AT_FIELD) {
        None => Ok(None),
        Some(Value::Date(ms)) => Ok(Some(ms)),
        Some(Value::Number(n)) if n.is_finite() => Ok(Some(n as i64)),
        Some(other) => Err(invalid(
            EXPIRES_AT_FIELD,
            &format!("expected a date or millisecond number, got {}", other.type_name()),
        )),
    }
}

/// Coerce caller input towards the declared type where unambiguous:
/// date fields accept RFC 3339 strings and epoch-millisecond numbers.
fn coerce(field: &FieldDef, value: Value) -> Value {
    if field.field_type != FieldType::Date {
        return value;
    }
    match value {
        Value::String(s) => match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Value::Date(dt.timestamp_millis()),
            Err(_) => Value::String(s),
        },
        Value::Number(n) if n.is_finite() => Value::Date(n as i64),
        other => other,
    }
}

fn validate_format(name: &str, format: FieldFormat, s: &str) -> Result<()> {
    let ok = match format {
        FieldFormat::Email => is_valid_email(s),
        FieldFormat::Url => is_valid_url(s),
        FieldFormat::IsoDate => DateTime::parse_from_rfc3339(s).is_ok(),
    };
    if ok {
        Ok(())
    } else {
        Err(invalid(name, &format!("value is not a valid {}", format_label(format))))
    }
}

fn format_label(format: FieldFormat) -> &'static str {
    match format {
        FieldFormat::Email => "email address",
        FieldFormat::Url => "url",
        FieldFormat::IsoDate => "ISO date",
    }
}

fn is_valid_email(s: &str) -> bool {
    let mut parts = s.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && domain.contains('.')
                && !s.chars().any(char::is_whitespace)
        }
        _ => false,
    }
}

fn is_valid_url(s: &str) -> bool {
    match s.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
                && scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && !rest.is_empty()
                && !s.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Generated values
// ---------------------------------------------------------------------------

static CUID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_value(strategy: GeneratedValue, autoincrement_next: u64, now_ms: i64) -> Value {
    match strategy {
        GeneratedValue::Uuid => Value::String(uuid::Uuid::new_v4().to_string()),
        GeneratedValue::Cuid => Value::String(next_cuid(now_ms)),
        GeneratedValue::Autoincrement => Value::Number(autoincrement_next as f64),
        GeneratedValue::Timestamp => Value::Date(now_ms),
    }
}

/// Compact collision-resistant id: `c` + base36 millis + base36 process
/// counter + uuid-derived entropy.
fn next_cuid(now_ms: i64) -> String {
    let count = CUID_COUNTER.fetch_add(1, Ordering::Relaxed) % (36 * 36 * 36 * 36);
    let entropy = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "c{}{:0>4}{}",
        base36(now_ms.max(0) as u64),
        base36(count),
        &entropy[..8]
    )
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
