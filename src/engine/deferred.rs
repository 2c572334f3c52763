//! Single-assignment result slot shared by any number of waiters

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::error;

use crate::engine::error::ResolveError;

/// Result broadcast to every waiter of a [`Deferred`]
pub type Outcome<T> = Result<Arc<T>, ResolveError>;

/// A value that will be set exactly once and can be awaited concurrently.
///
/// Waiters that arrive after resolution read the value without suspending.
/// Timing out on a wait never affects the computation that will eventually
/// resolve the slot.
pub struct Deferred<T> {
    slot: Mutex<Option<Outcome<T>>>,
    notify: Notify,
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Creates a slot that is already resolved with `outcome`
    pub fn resolved(outcome: Outcome<T>) -> Self {
        Self {
            slot: Mutex::new(Some(outcome)),
            notify: Notify::new(),
        }
    }

    /// Returns the outcome if the slot has been resolved
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Sets the outcome and wakes all current waiters.
    ///
    /// Resolving twice is a contract violation: the first outcome is kept.
    pub fn resolve(&self, outcome: Outcome<T>) {
        {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                error!("Deferred resolved twice, keeping the first outcome");
                debug_assert!(false, "Deferred resolved twice");
                return;
            }
            *slot = Some(outcome);
        }
        self.notify.notify_waiters();
    }

    /// Waits until the slot is resolved
    pub async fn wait(&self) -> Outcome<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the slot so a concurrent resolve cannot
            // slip between the check and the await.
            notified.as_mut().enable();

            if let Some(outcome) = self.peek() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Waits at most `duration`, yielding [`ResolveError::Timeout`] afterwards
    pub async fn wait_timeout(&self, duration: Duration) -> Outcome<T> {
        match tokio::time::timeout(duration, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ResolveError::Timeout),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
