//! Per-run execution locks.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes stage executions of the same run.
///
/// Different runs never contend; each `portalRunId` has its own mutex.
#[derive(Debug, Default)]
pub struct RunLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RunLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to a run.
    ///
    /// The run's entry is removed once the returned guard drops and nobody
    /// else holds or waits for it, so the table only tracks active runs.
    pub async fn acquire(&self, portal_run_id: &str) -> RunLockGuard<'_> {
        // Clone the Arc out so no shard lock is held across the await.
        let lock = self
            .locks
            .entry(portal_run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        RunLockGuard {
            locks: self,
            portal_run_id: portal_run_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn release(&self, portal_run_id: &str) {
        // Acquirers clone under the shard lock, so a count of one means the
        // table holds the only reference.
        self.locks
            .remove_if(portal_run_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of tracked runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns true if no run is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one run; releases its table entry on drop.
#[derive(Debug)]
pub struct RunLockGuard<'a> {
    locks: &'a RunLocks,
    portal_run_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RunLockGuard<'_> {
    /// The locked run.
    #[must_use]
    pub fn portal_run_id(&self) -> &str {
        &self.portal_run_id
    }
}

impl Drop for RunLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.portal_run_id);
    }
}
