//! One mutex per campaign, shared by the registry, the ledger and the status
//! tracker so that every mutation of a campaign's files is serialized.
//!
//! Entries live only while someone holds or waits for them; the last guard
//! out removes the campaign's mutex from the table.

use dashmap::DashMap;
use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CampaignLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Proof that the caller holds a campaign's lock. Methods suffixed
/// `_locked` take this instead of acquiring the lock themselves.
pub struct CampaignGuard {
    campaign_id: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl CampaignGuard {
    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }
}

impl Drop for CampaignGuard {
    fn drop(&mut self) {
        // Unlock first so the guard's own Arc is gone before counting.
        drop(self.guard.take());
        // Waiters cloned the Arc under the shard lock, so a count of 1 means
        // only the table still refers to the mutex.
        self.locks
            .remove_if(&self.campaign_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl CampaignLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the campaign's lock is free. Never hold the returned guard
    /// across an `.await`.
    pub fn acquire(&self, campaign_id: &str) -> CampaignGuard {
        // Clone the Arc out first so the DashMap shard is not held while waiting.
        let mutex = self
            .locks
            .entry(campaign_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        CampaignGuard {
            campaign_id: campaign_id.to_string(),
            guard: Some(mutex.lock_arc()),
            locks: self.locks.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_same_campaign_is_serialized() {
        let locks = CampaignLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = locks.acquire("camp-a");
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_distinct_campaigns_do_not_block() {
        let locks = CampaignLocks::new();
        let a = locks.acquire("camp-a");
        let b = locks.acquire("camp-b");
        assert_eq!(a.campaign_id(), "camp-a");
        assert_eq!(b.campaign_id(), "camp-b");
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_released_locks_are_pruned() {
        let locks = CampaignLocks::new();
        let first = locks.acquire("camp-a");
        assert_eq!(locks.len(), 1);

        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || {
                let _guard = locks.acquire("camp-a");
            })
        };
        // The waiter keeps the entry alive until it has run.
        while locks
            .locks
            .get("camp-a")
            .map_or(0, |mutex| Arc::strong_count(mutex.value()))
            < 3
        {
            thread::yield_now();
        }
        drop(first);
        waiter.join().unwrap();

        assert!(locks.is_empty());
        drop(locks.acquire("camp-b"));
        assert!(locks.is_empty());
    }
}
