//! Global sliding-window rate limit applied across all running campaigns.
//!
//! This is a coarse rolling limit, not a token bucket: once the count for
//! the current window hits the rate, the dispatching task sleeps out the
//! remainder of the window. Brief bursts across window boundaries are
//! allowed.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug)]
struct WindowState {
    start: Instant,
    count: u64,
}

/// Shared sliding-window limiter.
///
/// The `{start, count}` pair is serialized under one async mutex; the sleep
/// itself happens outside the lock with the count already zeroed, so other
/// producers keep making progress against the fresh window.
#[derive(Debug)]
pub struct SlidingWindow {
    enabled: bool,
    rate: u64,
    duration: Duration,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    pub fn new(enabled: bool, rate: u64, duration: Duration) -> Self {
        Self {
            enabled,
            rate,
            duration,
            state: Mutex::new(WindowState {
                start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Whether the limiter is in effect at all.
    pub fn is_active(&self) -> bool {
        self.enabled && self.rate > 0 && self.duration > Duration::from_secs(1)
    }

    /// Account for one dispatched message, sleeping out the window
    /// remainder when the rate has been reached.
    pub async fn throttle(&self) {
        if !self.is_active() {
            return;
        }

        let wait = {
            let mut state = self.state.lock().await;
            let elapsed = state.start.elapsed();

            // Window has expired. Reset the clock.
            if elapsed >= self.duration {
                state.start = Instant::now();
                state.count = 0;
                return;
            }

            state.count += 1;
            if state.count < self.rate {
                return;
            }

            state.count = 0;
            self.duration - elapsed
        };

        info!(
            rate = self.rate,
            wait_secs = wait.as_secs(),
            "sliding window rate reached, sleeping out the window"
        );
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_configurations() {
        assert!(!SlidingWindow::new(false, 100, Duration::from_secs(60)).is_active());
        assert!(!SlidingWindow::new(true, 0, Duration::from_secs(60)).is_active());
        assert!(!SlidingWindow::new(true, 100, Duration::from_secs(1)).is_active());
        assert!(SlidingWindow::new(true, 100, Duration::from_secs(60)).is_active());
    }

    #[tokio::test]
    async fn test_throttle_below_rate_is_immediate() {
        let w = SlidingWindow::new(true, 100, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..50 {
            w.throttle().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_sleeps_at_rate() {
        let w = SlidingWindow::new(true, 3, Duration::from_secs(10));

        // First two dispatches pass straight through; the third hits the
        // rate and sleeps out the window remainder.
        w.throttle().await;
        w.throttle().await;

        let start = tokio::time::Instant::now();
        w.throttle().await;
        assert!(start.elapsed() >= Duration::from_secs(9));
    }
}
