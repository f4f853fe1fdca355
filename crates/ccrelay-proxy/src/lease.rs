//! Leases held by launchers that reuse a proxy they did not start.
//!
//! The owning launcher keeps serving until every lease is released or its
//! holder process has died.

use crate::singleton::process_alive;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// How often [`LeaseTable::wait_idle`] re-checks the table.
pub const LEASE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
pub struct LeaseTable {
    next_id: AtomicU64,
    /// lease id -> holder pid
    leases: Mutex<HashMap<u64, u32>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, pid: u32) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.leases.lock().insert(id, pid);
        debug!(lease = id, pid, "lease acquired");
        id
    }

    /// Returns false for an unknown or already released lease.
    pub fn release(&self, id: u64) -> bool {
        let released = self.leases.lock().remove(&id).is_some();
        if released {
            debug!(lease = id, "lease released");
        }
        released
    }

    /// Live leases, after dropping those whose holder has exited.
    pub fn active(&self) -> usize {
        let mut leases = self.leases.lock();
        leases.retain(|id, pid| {
            let alive = process_alive(*pid);
            if !alive {
                debug!(lease = *id, pid = *pid, "holder exited, dropping lease");
            }
            alive
        });
        leases.len()
    }

    /// Resolve once no live lease remains.
    pub async fn wait_idle(&self) {
        while self.active() > 0 {
            tokio::time::sleep(LEASE_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEAD_PID: u32 = 999_999_999;

    #[test]
    fn test_acquire_and_release() {
        let table = LeaseTable::new();
        let a = table.acquire(std::process::id());
        let b = table.acquire(std::process::id());
        assert_ne!(a, b);
        assert_eq!(table.active(), 2);

        assert!(table.release(a));
        assert!(!table.release(a));
        assert_eq!(table.active(), 1);
    }

    #[test]
    fn test_dead_holders_are_dropped() {
        let table = LeaseTable::new();
        table.acquire(DEAD_PID);
        assert_eq!(table.active(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_after_release() {
        let table = std::sync::Arc::new(LeaseTable::new());
        let id = table.acquire(std::process::id());

        let waiter = tokio::spawn({
            let table = table.clone();
            async move { table.wait_idle().await }
        });
        tokio::time::sleep(LEASE_POLL * 2).await;
        assert!(!waiter.is_finished());

        table.release(id);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
