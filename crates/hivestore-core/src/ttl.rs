//! TTL expiration scheduler
//!
//! One periodic task asks every TTL-enabled bucket to purge its expired
//! records. Scheduling is a chained one-shot sleep: the next tick is only
//! armed after the previous one finishes, so slow purges never stack.
//! Per-bucket failures are swallowed so one bad bucket cannot stall the
//! scheduler.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bucket::BucketHandle;

struct TtlInner {
    interval: Option<Duration>,
    buckets: RwLock<Vec<BucketHandle>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub(crate) struct TtlScheduler {
    inner: Arc<TtlInner>,
}

impl TtlScheduler {
    /// `interval = None` disables automatic checks; on-demand purges
    /// still work.
    pub fn new(interval: Option<Duration>) -> Self {
        TtlScheduler {
            inner: Arc::new(TtlInner {
                interval: interval.filter(|i| !i.is_zero()),
                buckets: RwLock::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn register(&self, handle: BucketHandle) {
        self.inner
            .buckets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Start the periodic task, if an interval is configured.
    pub fn start(&self) {
        let Some(interval) = self.inner.interval else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let purged = run_tick(&inner).await;
                        if purged > 0 {
                            debug!(purged, "ttl tick purged expired records");
                        }
                    }
                }
            }
        });
    }

    /// Run one tick now; returns the total number of records purged.
    pub async fn purge_all(&self) -> usize {
        run_tick(&self.inner).await
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }
}

async fn run_tick(inner: &TtlInner) -> usize {
    let handles: Vec<BucketHandle> = inner
        .buckets
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let mut total = 0;
    for handle in handles {
        match handle.purge_expired().await {
            Ok(count) => total += count,
            Err(err) => {
                warn!(bucket = handle.name(), error = %err, "ttl purge failed; skipping bucket");
            }
        }
    }
    total
}
