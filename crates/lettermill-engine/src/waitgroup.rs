//! In-flight message tracking for campaign pipes.
//!
//! Every message rendered for a pipe holds a ticket until a worker finishes
//! with it (sent, errored or dropped). A sentinel ticket is held from pipe
//! creation until the campaign's subscribers are exhausted so cleanup cannot
//! fire while fetches are still in progress.

use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Notify;

/// Counts outstanding tickets and wakes waiters when the count hits zero.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicI64,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `n` tickets.
    pub fn add(&self, n: i64) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Release one ticket, waking waiters if the count reaches zero.
    pub fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Current outstanding ticket count.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until the count reaches zero.
    pub async fn wait(&self) {
        loop {
            if self.count.load(Ordering::Acquire) <= 0 {
                return;
            }

            let notified = self.notify.notified();

            // Re-check after registering so a done() racing the first load
            // can't be missed.
            if self.count.load(Ordering::Acquire) <= 0 {
                return;
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_when_drained() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(3);

        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };

        for _ in 0..3 {
            wg.done();
        }

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_on_empty_group_returns_immediately() {
        let wg = WaitGroup::new();
        tokio::time::timeout(Duration::from_millis(100), wg.wait())
            .await
            .expect("empty group should not block");
    }

    #[tokio::test]
    async fn test_concurrent_tickets() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(1); // sentinel

        let mut handles = Vec::new();
        for _ in 0..50 {
            wg.add(1);
            let wg = wg.clone();
            handles.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                wg.done();
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(wg.count(), 1);
        wg.done();

        tokio::time::timeout(Duration::from_secs(1), wg.wait())
            .await
            .expect("group should drain");
    }
}
