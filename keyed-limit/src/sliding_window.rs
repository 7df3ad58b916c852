use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;
use tokio::sync::watch;
use tracing::debug;

use super::Strategy;
use crate::sweep;

struct WindowCounts {
    prev_count: usize,
    curr_count: usize,
    current_start: Instant,
}

/// A per-key sliding window counter.
///
/// Maintains a count for the current fixed sub-window and the previous one.
/// The effective count is `previous * %_of_window_left + current`, which
/// approximates the sliding log's accuracy at O(1) memory per key. Being an
/// estimate, it can both under- and over-admit near boundaries by a
/// fractional event.
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    windows: Arc<Mutex<HashMap<String, WindowCounts>>>,
    clock: Clock,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl Strategy for SlidingWindow {
    async fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut windows = self.windows.lock();

        if let Some(data) = windows.get_mut(key) {
            let elapsed = now.duration_since(data.current_start);
            if elapsed >= self.window {
                // Roll the window. Like the fixed window, the first
                // request of a fresh window is always admitted.
                data.prev_count = data.curr_count;
                data.curr_count = 1;
                data.current_start = now;
                return true;
            }

            return if Self::estimate(data, elapsed, self.window) < self.limit {
                data.curr_count += 1;
                true
            } else {
                false
            };
        }

        windows.insert(
            key.to_string(),
            WindowCounts {
                prev_count: 0,
                curr_count: 1,
                current_start: now,
            },
        );
        true
    }

    async fn stats(&self, key: &str) -> usize {
        let now = self.clock.now();
        let windows = self.windows.lock();
        windows.get(key).map_or(0, |data| {
            let elapsed = now.duration_since(data.current_start);
            if elapsed >= self.window {
                // The blend window has fully passed; nothing left to decay.
                0
            } else {
                Self::estimate(data, elapsed, self.window)
            }
        })
    }

    fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl SlidingWindow {
    /// Creates a new `SlidingWindow` strategy.
    ///
    /// # Arguments
    ///
    /// * `limit` - The maximum number of requests a single key may make
    ///   within one window.
    /// * `window` - The length of a sub-window.
    pub fn new(limit: NonZeroUsize, window: Duration) -> Self {
        Self::with_clock(limit, window, Clock::new())
    }

    pub fn with_clock(limit: NonZeroUsize, window: Duration, clock: Clock) -> Self {
        let windows: Arc<Mutex<HashMap<String, WindowCounts>>> = Arc::default();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let swept = Arc::clone(&windows);
        let sweep_clock = clock.clone();
        sweep::spawn_sweep(sweep::SWEEP_INTERVAL, shutdown_rx, move || {
            let now = sweep_clock.now();
            let mut windows = swept.lock();
            let before = windows.len();
            windows.retain(|_, data| now.duration_since(data.current_start) < window);
            let evicted = before - windows.len();
            if evicted > 0 {
                debug!(evicted, "sliding window sweep");
            }
        });

        Self {
            limit: limit.get(),
            window,
            windows,
            clock,
            shutdown,
        }
    }

    /// Weighted blend of the previous and current sub-window. The previous
    /// window's contribution decays linearly over the current one; the cast
    /// truncates, never rounds.
    fn estimate(data: &WindowCounts, elapsed: Duration, window: Duration) -> usize {
        let prev_weight = (window - elapsed).as_secs_f64() / window.as_secs_f64();
        (data.prev_count as f64 * prev_weight) as usize + data.curr_count
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }
}

impl fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_lt;

    use super::*;

    const KEY: &str = "203.0.113.7";

    #[tokio::test]
    async fn it_enforces_limits() {
        let (clock, _mock) = Clock::mock();
        let rl = SlidingWindow::with_clock(
            NonZeroUsize::new(100).unwrap(),
            Duration::from_secs(1),
            clock,
        );

        let mut admitted = 0;
        for _ in 0..500 {
            if rl.allow(KEY).await {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 100);
    }

    #[tokio::test]
    async fn test_partial_recovery() {
        let (clock, mock) = Clock::mock();
        let rl = SlidingWindow::with_clock(
            NonZeroUsize::new(2).unwrap(),
            Duration::from_millis(100),
            clock,
        );

        assert!(rl.allow(KEY).await);
        assert!(rl.allow(KEY).await);

        // Force the window to roll. The roll itself admits.
        mock.increment(Duration::from_millis(110));
        assert!(rl.allow(KEY).await);

        // Next call sees prev=2 decayed by ~1.0 plus curr=1: over limit.
        assert!(!rl.allow(KEY).await);
    }

    #[tokio::test]
    async fn test_prevents_double_burst() {
        let (clock, mock) = Clock::mock();
        let rl = SlidingWindow::with_clock(
            NonZeroUsize::new(100).unwrap(),
            Duration::from_millis(100),
            clock,
        );

        for _ in 0..100 {
            let _ = rl.allow(KEY).await;
        }

        // Roll, then move 20ms into the new window. The previous window
        // still weighs ~0.8, so only a fraction of the quota is available,
        // not the full fresh burst a fixed window would hand out.
        mock.increment(Duration::from_millis(100));
        let _ = rl.allow(KEY).await;
        mock.increment(Duration::from_millis(20));

        let mut extra = 0;
        while rl.allow(KEY).await {
            extra += 1;
        }
        assert_lt!(extra, 50, "a full second burst must not fit");
    }

    #[tokio::test]
    async fn stats_recomputes_without_mutating() {
        let (clock, mock) = Clock::mock();
        let rl = SlidingWindow::with_clock(
            NonZeroUsize::new(10).unwrap(),
            Duration::from_millis(100),
            clock,
        );

        for _ in 0..4 {
            assert!(rl.allow(KEY).await);
        }
        assert_eq!(rl.stats(KEY).await, 4);
        assert_eq!(rl.stats(KEY).await, 4);

        // Roll into a new window, then decay half of it: 4 * 0.5 + 1 = 3.
        mock.increment(Duration::from_millis(100));
        assert!(rl.allow(KEY).await);
        mock.increment(Duration::from_millis(50));
        assert_eq!(rl.stats(KEY).await, 3);

        // Once the current sub-window has fully expired there is nothing
        // left to decay.
        mock.increment(Duration::from_millis(100));
        assert_eq!(rl.stats(KEY).await, 0);
    }

    #[tokio::test]
    async fn stats_reports_zero_for_unseen_keys() {
        let rl = SlidingWindow::new(NonZeroUsize::new(5).unwrap(), Duration::from_secs(1));
        assert_eq!(rl.stats("198.51.100.9").await, 0);
    }

    #[tokio::test]
    async fn keys_do_not_interfere() {
        let rl = SlidingWindow::new(NonZeroUsize::new(1).unwrap(), Duration::from_secs(10));

        assert!(rl.allow("10.0.0.1").await);
        assert!(!rl.allow("10.0.0.1").await);
        assert!(rl.allow("10.0.0.2").await);
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_windows() {
        tokio::time::pause();

        let (clock, mock) = Clock::mock();
        let rl = SlidingWindow::with_clock(
            NonZeroUsize::new(5).unwrap(),
            Duration::from_millis(100),
            clock,
        );
        // Let the sweeper task start and register its timer.
        tokio::task::yield_now().await;

        assert!(rl.allow(KEY).await);
        assert_eq!(rl.tracked_keys(), 1);

        mock.increment(Duration::from_millis(200));
        tokio::time::advance(sweep::SWEEP_INTERVAL + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(rl.tracked_keys(), 0);
        assert!(rl.allow(KEY).await);
        assert_eq!(rl.stats(KEY).await, 1);
    }
}
