//! Change events and the process-local publish/subscribe bus
//!
//! Topics are dot-separated: `bucket.<name>.<kind>`. Subscriber patterns
//! may use `*` to match exactly one segment (`bucket.users.*`,
//! `bucket.*.*`). Publication is synchronous: `publish` invokes every
//! matching handler inline and returns after all have run. Handlers are
//! expected to enqueue work, not block; a panicking handler is isolated
//! and reported, never propagated to the publisher or to its siblings.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::schema::Record;
use crate::value::IndexKey;

/// What happened to a record. TTL purges and size eviction emit `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Inserted,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Inserted => "inserted",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mutation, as observed by subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEvent {
    pub bucket: String,
    pub kind: EventKind,
    pub key: IndexKey,
    /// The record after the mutation (for deletes, the removed record)
    pub record: Record,
    /// The prior record, present on updates
    pub old_record: Option<Record>,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl StoreEvent {
    pub fn inserted(bucket: &str, key: IndexKey, record: Record, timestamp: i64) -> Self {
        StoreEvent {
            bucket: bucket.to_string(),
            kind: EventKind::Inserted,
            key,
            record,
            old_record: None,
            timestamp,
        }
    }

    pub fn updated(
        bucket: &str,
        key: IndexKey,
        old: Record,
        new: Record,
        timestamp: i64,
    ) -> Self {
        StoreEvent {
            bucket: bucket.to_string(),
            kind: EventKind::Updated,
            key,
            record: new,
            old_record: Some(old),
            timestamp,
        }
    }

    pub fn deleted(bucket: &str, key: IndexKey, record: Record, timestamp: i64) -> Self {
        StoreEvent {
            bucket: bucket.to_string(),
            kind: EventKind::Deleted,
            key,
            record,
            old_record: None,
            timestamp,
        }
    }

    pub fn topic(&self) -> String {
        format!("bucket.{}.{}", self.bucket, self.kind)
    }
}

// ---------------------------------------------------------------------------
// Topic patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A dot-separated subscription pattern; `*` matches exactly one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        TopicPattern {
            segments: pattern
                .split('.')
                .map(|s| {
                    if s == "*" {
                        Segment::Wildcard
                    } else {
                        Segment::Literal(s.to_string())
                    }
                })
                .collect(),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('.');
        for segment in &self.segments {
            match (parts.next(), segment) {
                (Some(_), Segment::Wildcard) => {}
                (Some(part), Segment::Literal(lit)) if part == lit => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    pattern: TopicPattern,
    handler: Handler,
}

/// Process-local synchronous publish/subscribe.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every topic matching `pattern`.
    pub fn subscribe<F>(self: &Arc<Self>, pattern: &str, handler: F) -> SubscriptionToken
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            id,
            pattern: TopicPattern::parse(pattern),
            handler: Arc::new(handler),
        };
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriber);
        SubscriptionToken {
            id,
            bus: Arc::downgrade(self),
        }
    }

    /// Invoke every matching handler inline, in subscription order.
    pub fn publish(&self, event: &StoreEvent) {
        let topic = event.topic();
        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            subscribers
                .iter()
                .filter(|s| s.pattern.matches(&topic))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(topic = %topic, "event handler panicked; continuing with remaining handlers");
            }
        }
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| s.id != id);
    }
}

/// Removes its subscription when asked; safe to call more than once.
pub struct SubscriptionToken {
    id: u64,
    bus: Weak<EventBus>,
}

impl SubscriptionToken {
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    fn event(bucket: &str, kind: EventKind) -> StoreEvent {
        let record = Record {
            fields: BTreeMap::new(),
            version: 1,
            created_at: 0,
            updated_at: 0,
            expires_at: None,
        };
        StoreEvent {
            bucket: bucket.to_string(),
            kind,
            key: IndexKey::String("k".to_string()),
            record,
            old_record: None,
            timestamp: 0,
        }
    }

    #[test]
    fn test_pattern_matching() {
        assert!(TopicPattern::parse("bucket.users.inserted").matches("bucket.users.inserted"));
        assert!(TopicPattern::parse("bucket.users.*").matches("bucket.users.deleted"));
        assert!(TopicPattern::parse("bucket.*.*").matches("bucket.orders.updated"));
        assert!(!TopicPattern::parse("bucket.users.*").matches("bucket.orders.updated"));
        // a wildcard spans exactly one segment
        assert!(!TopicPattern::parse("bucket.*").matches("bucket.users.updated"));
        assert!(!TopicPattern::parse("bucket.*.*.extra").matches("bucket.users.updated"));
    }

    #[test]
    fn test_publish_reaches_matching_subscribers() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_exact = Arc::clone(&hits);
        let _t1 = bus.subscribe("bucket.users.inserted", move |_| {
            hits_exact.fetch_add(1, Ordering::SeqCst);
        });
        let hits_all = Arc::clone(&hits);
        let _t2 = bus.subscribe("bucket.*.*", move |_| {
            hits_all.fetch_add(1, Ordering::SeqCst);
        });
        let hits_other = Arc::clone(&hits);
        let _t3 = bus.subscribe("bucket.orders.*", move |_| {
            hits_other.fetch_add(100, Ordering::SeqCst);
        });

        bus.publish(&event("users", EventKind::Inserted));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_sub = Arc::clone(&hits);
        let token = bus.subscribe("bucket.*.*", move |_| {
            hits_sub.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&event("users", EventKind::Inserted));
        token.unsubscribe();
        token.unsubscribe();
        bus.publish(&event("users", EventKind::Inserted));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = bus.subscribe("bucket.*.*", |_| panic!("boom"));
        let hits_sub = Arc::clone(&hits);
        let _good = bus.subscribe("bucket.*.*", move |_| {
            hits_sub.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&event("users", EventKind::Deleted));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
