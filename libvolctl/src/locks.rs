//! Per-identifier serialization of controller operations.
//!
//! Map, unmap, provision and check all read backend state and then act on
//! it.  Two such calls for the same identifier must not interleave, or a
//! retried `MapVolume` could attach the same BDev to two targets.  Calls for
//! different identifiers run fully in parallel.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A set of async mutexes keyed by identifier, created on demand and
/// dropped once nobody holds or waits for them.
#[derive(Default)]
pub struct VolumeLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `id` is free and hold it until the guard is dropped.
    pub async fn lock(&self, id: &str) -> VolumeGuard {
        // Cloned under the shard lock, so `release` sees this waiter in the
        // strong count and keeps the entry.
        let mutex = Arc::clone(
            self.locks
                .entry(id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = mutex.lock_owned().await;
        VolumeGuard {
            id: id.to_owned(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of identifiers currently held or waited for.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive hold on one identifier.
pub struct VolumeGuard {
    id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for VolumeGuard {
    fn drop(&mut self) {
        // Release the mutex first so its Arc is no longer counted by us.
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let locks = Arc::new(VolumeLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("vol-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty(), "entries must be removed after release");
    }

    #[tokio::test]
    async fn different_ids_do_not_block() {
        let locks = VolumeLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn waiter_keeps_entry_alive() {
        let locks = Arc::new(VolumeLocks::new());
        let first = locks.lock("v").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _second = locks.lock("v").await;
            })
        };
        tokio::task::yield_now().await;
        drop(first);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
