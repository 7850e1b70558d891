//! Correlation table of in-flight requests
//!
//! Each entry is a oneshot waiter keyed by correlation ID. Resolution,
//! rejection and timeout all go through [`PendingTable::take`], so an entry
//! is completed at most once and a late reply finds nothing. Dropping the
//! [`PendingReply`] handle (the caller gave up or its task was aborted)
//! removes the entry as well.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::common::{Error, Result};

type Waiter<T> = oneshot::Sender<Result<T>>;
type Entries<T> = Mutex<HashMap<String, (u64, Waiter<T>)>>;

pub struct PendingTable<T> {
    entries: Arc<Entries<T>>,
    next_seq: AtomicU64,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }
}

/// Handle returned by [`PendingTable::register`]. Removes its entry when dropped.
pub struct PendingReply<T> {
    correlation_id: String,
    seq: u64,
    rx: oneshot::Receiver<Result<T>>,
    entries: Weak<Entries<T>>,
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut entries = entries.lock();
        // A newer registration under the same ID is left alone
        if matches!(entries.get(&self.correlation_id), Some((seq, _)) if *seq == self.seq) {
            entries.remove(&self.correlation_id);
        }
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Replaces (and drops) any previous waiter for the same ID.
    pub fn register(&self, correlation_id: &str) -> PendingReply<T> {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .insert(correlation_id.to_string(), (seq, tx));
        PendingReply {
            correlation_id: correlation_id.to_string(),
            seq,
            rx,
            entries: Arc::downgrade(&self.entries),
        }
    }

    fn take(&self, correlation_id: &str) -> Option<Waiter<T>> {
        self.entries.lock().remove(correlation_id).map(|(_, tx)| tx)
    }

    /// Complete a waiter. Returns false when no entry matched.
    pub fn complete(&self, correlation_id: &str, outcome: Result<T>) -> bool {
        match self.take(correlation_id) {
            // The receiver may already be gone if the caller was cancelled
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn resolve(&self, correlation_id: &str, value: T) -> bool {
        self.complete(correlation_id, Ok(value))
    }

    pub fn reject(&self, correlation_id: &str, error: Error) -> bool {
        self.complete(correlation_id, Err(error))
    }

    /// Drop an entry without completing it
    pub fn cancel(&self, correlation_id: &str) {
        self.take(correlation_id);
    }

    /// Reject every entry, used on shutdown
    pub fn reject_all(&self, reason: &str) {
        let drained: Vec<(String, (u64, Waiter<T>))> = self.entries.lock().drain().collect();
        for (_, (_, tx)) in drained {
            let _ = tx.send(Err(Error::ConnectionClosed(reason.to_string())));
        }
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Wait for the reply registered under `pending`. The entry is gone once
    /// this returns or the future is dropped, whatever the outcome.
    pub async fn wait(&self, mut pending: PendingReply<T>, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Internal(format!(
                "pending entry {} dropped without reply",
                pending.correlation_id
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "no reply for {} within {:?}",
                pending.correlation_id, timeout
            ))),
        }
    }
}

impl<T> PendingReply<T> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}
