//! Deduplicating, cache-through work pool
//!
//! A [`DedupPool`] owns a fixed number of worker tasks for one resource kind
//! (package metadata, resolved versions, uploaded files). Concurrent requests
//! for the same key share one [`Deferred`], so at most one computation per key
//! is in flight at any time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::engine::deferred::Deferred;
use crate::engine::error::{ResolveError, StoreError};

/// Cache-through task specialized per resource kind
#[async_trait::async_trait]
pub trait Performer: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    /// Pool name used in log lines
    fn name(&self) -> &'static str;

    /// Returns the cached value for `key`, if any
    fn get(&self, key: &str) -> Option<Self::Output>;

    /// Writes a freshly computed value back to the cache
    fn put(&self, key: &str, value: &Self::Output) -> Result<(), StoreError>;

    /// Computes the value for `key` from scratch
    async fn compute(&self, key: &str) -> Result<Self::Output, ResolveError>;
}

struct PendingEntry<T> {
    deferred: Arc<Deferred<T>>,
    created_at: Instant,
}

type PendingMap<T> = DashMap<String, PendingEntry<T>>;

pub struct DedupPool<P: Performer> {
    performer: Arc<P>,
    pending: Arc<PendingMap<P::Output>>,
    queue: mpsc::UnboundedSender<String>,
}

impl<P: Performer> DedupPool<P> {
    /// Creates the pool and spawns `workers` worker tasks on the current runtime.
    ///
    /// Workers stop once the pool is dropped and the queue drains.
    pub fn start(performer: P, workers: usize) -> Self {
        let performer = Arc::new(performer);
        let pending: Arc<PendingMap<P::Output>> = Arc::new(DashMap::new());
        let (queue, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));

        info!("Starting {} pool with {} workers", performer.name(), workers);

        for id in 0..workers.max(1) {
            let performer = performer.clone();
            let pending = pending.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                run_worker(id, performer, pending, receiver).await;
            });
        }

        Self {
            performer,
            pending,
            queue,
        }
    }

    pub fn performer(&self) -> &P {
        &self.performer
    }

    /// Returns a handle that resolves to the value for `key`.
    ///
    /// Cache hits resolve immediately without touching the workers. Otherwise
    /// the caller joins the pending computation for `key`, starting one if
    /// none exists.
    pub fn process(&self, key: &str) -> Arc<Deferred<P::Output>> {
        if let Some(value) = self.performer.get(key) {
            debug!("{} cache hit for {}", self.performer.name(), key);
            return Arc::new(Deferred::resolved(Ok(Arc::new(value))));
        }

        let deferred = match self.pending.entry(key.to_string()) {
            Entry::Occupied(entry) => return entry.get().deferred.clone(),
            Entry::Vacant(entry) => {
                let deferred = Arc::new(Deferred::new());
                entry.insert(PendingEntry {
                    deferred: deferred.clone(),
                    created_at: Instant::now(),
                });
                deferred
            }
        };

        debug!("{} queueing {}", self.performer.name(), key);
        if self.queue.send(key.to_string()).is_err() {
            // Only possible while the runtime is shutting down.
            deferred.resolve(Err(ResolveError::UpstreamFetch(format!(
                "{} pool is shut down",
                self.performer.name()
            ))));
        }
        deferred
    }

    /// Drops resolved registry entries older than `retention`.
    ///
    /// Returns the number of removed entries. Entries still being computed
    /// are always kept so no waiter can miss its result.
    pub fn sweep(&self, retention: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, entry| {
            !(entry.deferred.is_resolved() && entry.created_at.elapsed() >= retention)
        });
        let removed = before.saturating_sub(self.pending.len());
        if removed > 0 {
            info!("Swept {} entries from {} pool", removed, self.performer.name());
        }
        removed
    }

    /// Number of keys currently held in the in-memory registry
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

async fn run_worker<P: Performer>(
    id: usize,
    performer: Arc<P>,
    pending: Arc<PendingMap<P::Output>>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(key) = next else {
            debug!("{} worker {} stopped", performer.name(), id);
            return;
        };

        debug!("{} worker {} computing {}", performer.name(), id, key);
        let outcome = performer.compute(&key).await.map(Arc::new);

        match &outcome {
            Ok(value) => {
                let _ = performer.put(&key, value).inspect_err(|e| {
                    warn!(
                        "Failed to store {} result for {}: {}",
                        performer.name(),
                        key,
                        e
                    )
                });
            }
            Err(e) => warn!("{} computation failed for {}: {}", performer.name(), key, e),
        }

        let deferred = pending.get(&key).map(|entry| entry.deferred.clone());
        match deferred {
            Some(deferred) => deferred.resolve(outcome),
            None => warn!("{} finished {} with no pending entry", performer.name(), key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Performer that counts computations and stores results in memory
    struct CountingPerformer {
        computed: AtomicUsize,
        delay: Duration,
        cache: StdMutex<HashMap<String, String>>,
        fail_put: bool,
    }

    impl CountingPerformer {
        fn new(delay: Duration) -> Self {
            Self {
                computed: AtomicUsize::new(0),
                delay,
                cache: StdMutex::new(HashMap::new()),
                fail_put: false,
            }
        }

        fn computed(&self) -> usize {
            self.computed.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Performer for CountingPerformer {
        type Output = String;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn get(&self, key: &str) -> Option<String> {
            self.cache.lock().unwrap().get(key).cloned()
        }

        fn put(&self, key: &str, value: &String) -> Result<(), StoreError> {
            if self.fail_put {
                return Err(StoreError::LockPoisoned);
            }
            self.cache
                .lock()
                .unwrap()
                .insert(key.to_string(), value.clone());
            Ok(())
        }

        async fn compute(&self, key: &str) -> Result<String, ResolveError> {
            self.computed.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if key == "missing" {
                return Err(ResolveError::NotFound(key.to_string()));
            }
            Ok(format!("value-of-{}", key))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_trigger_a_single_computation() {
        let pool = Arc::new(DedupPool::start(
            CountingPerformer::new(Duration::from_millis(50)),
            4,
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.process("react").wait().await })
            })
            .collect();

        for result in join_all(handles).await {
            assert_eq!(*result.unwrap().unwrap(), "value-of-react");
        }
        assert_eq!(pool.performer().computed(), 1);
    }

    #[tokio::test]
    async fn cached_value_is_returned_without_computation() {
        let performer = CountingPerformer::new(Duration::ZERO);
        performer
            .cache
            .lock()
            .unwrap()
            .insert("lodash".to_string(), "cached".to_string());
        let pool = DedupPool::start(performer, 1);

        let deferred = pool.process("lodash");

        assert!(deferred.is_resolved());
        assert_eq!(*deferred.wait().await.unwrap(), "cached");
        assert_eq!(pool.performer().computed(), 0);
        assert_eq!(pool.pending_len(), 0);
    }

    #[tokio::test]
    async fn computed_value_is_written_through_and_not_recomputed() {
        let pool = DedupPool::start(CountingPerformer::new(Duration::ZERO), 2);

        pool.process("chalk").wait().await.unwrap();
        let second = pool.process("chalk");

        assert!(second.is_resolved());
        assert_eq!(*second.wait().await.unwrap(), "value-of-chalk");
        assert_eq!(pool.performer().computed(), 1);
    }

    #[tokio::test]
    async fn errors_are_broadcast_and_not_cached() {
        let pool = DedupPool::start(CountingPerformer::new(Duration::ZERO), 1);

        let outcome = pool.process("missing").wait().await;

        assert_eq!(outcome, Err(ResolveError::NotFound("missing".to_string())));
        assert!(pool.performer().get("missing").is_none());
    }

    #[tokio::test]
    async fn put_failure_still_resolves_waiters() {
        let mut performer = CountingPerformer::new(Duration::ZERO);
        performer.fail_put = true;
        let pool = DedupPool::start(performer, 1);

        let outcome = pool.process("debug").wait().await;

        assert_eq!(*outcome.unwrap(), "value-of-debug");
    }

    #[tokio::test]
    async fn timed_out_wait_does_not_cancel_computation() {
        let pool = DedupPool::start(CountingPerformer::new(Duration::from_millis(100)), 1);

        let first = pool
            .process("express")
            .wait_timeout(Duration::from_millis(5))
            .await;
        assert_eq!(first, Err(ResolveError::Timeout));

        let second = pool.process("express").wait().await;
        assert_eq!(*second.unwrap(), "value-of-express");
        assert_eq!(pool.performer().computed(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_resolved_entries_past_retention() {
        let pool = DedupPool::start(CountingPerformer::new(Duration::from_millis(200)), 1);

        pool.process("missing").wait().await.unwrap_err();
        let in_flight = pool.process("slow");

        assert_eq!(pool.sweep(Duration::ZERO), 1);
        assert_eq!(pool.pending_len(), 1);
        assert!(!in_flight.is_resolved());
    }
}
