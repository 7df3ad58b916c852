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

struct WindowData {
    count: usize,
    window_start: Instant,
}

/// A per-key fixed window limiter.
///
/// Divides time into fixed intervals per caller. It is the cheapest
/// strategy but is susceptible to "boundary bursts" where double the limit
/// is admitted in a short period spanning two adjacent windows. That is the
/// documented behavior of the algorithm, not an accident: a request that
/// arrives after the window expired always opens a fresh window and is
/// admitted.
pub struct FixedWindow {
    limit: usize,
    window: Duration,
    keys: Arc<Mutex<HashMap<String, WindowData>>>,
    clock: Clock,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl Strategy for FixedWindow {
    async fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut keys = self.keys.lock();

        if let Some(data) = keys.get_mut(key) {
            if now.duration_since(data.window_start) < self.window {
                return if data.count < self.limit {
                    data.count += 1;
                    true
                } else {
                    false
                };
            }
        }

        // Unseen key, or a window that has run out: open a fresh one.
        keys.insert(
            key.to_string(),
            WindowData {
                count: 1,
                window_start: now,
            },
        );
        true
    }

    async fn stats(&self, key: &str) -> usize {
        let keys = self.keys.lock();
        keys.get(key).map_or(0, |data| data.count)
    }

    fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl FixedWindow {
    /// Creates a new `FixedWindow` strategy.
    ///
    /// # Arguments
    ///
    /// * `limit` - The maximum number of requests a single key may make
    ///   within one window.
    /// * `window` - The duration of the fixed time window.
    pub fn new(limit: NonZeroUsize, window: Duration) -> Self {
        Self::with_clock(limit, window, Clock::new())
    }

    pub fn with_clock(limit: NonZeroUsize, window: Duration, clock: Clock) -> Self {
        let keys: Arc<Mutex<HashMap<String, WindowData>>> = Arc::default();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let swept = Arc::clone(&keys);
        let sweep_clock = clock.clone();
        sweep::spawn_sweep(sweep::SWEEP_INTERVAL, shutdown_rx, move || {
            let now = sweep_clock.now();
            let mut keys = swept.lock();
            let before = keys.len();
            keys.retain(|_, data| now.duration_since(data.window_start) < window);
            let evicted = before - keys.len();
            if evicted > 0 {
                debug!(evicted, "fixed window sweep");
            }
        });

        Self {
            limit: limit.get(),
            window,
            keys,
            clock,
            shutdown,
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.keys.lock().len()
    }
}

impl fmt::Debug for FixedWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedWindow")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
