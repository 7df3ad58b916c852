use std::collections::HashMap;
use std::collections::VecDeque;
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

/// A per-key sliding window log limiter.
///
/// Keeps the timestamp of every admission inside the trailing window, so
/// the count it enforces is exact rather than an estimate. The price is
/// O(requests-in-window) memory per key, which makes the background
/// reclamation sweep matter more here than for the counter strategies.
pub struct SlidingLog {
    limit: usize,
    window: Duration,
    logs: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    clock: Clock,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl Strategy for SlidingLog {
    async fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut logs = self.logs.lock();
        let log = logs.entry(key.to_string()).or_default();

        // Entries are appended in time order, so the expired ones form a
        // prefix. If the oldest entry is still inside the window there is
        // nothing to trim; otherwise a sorted search finds the first entry
        // worth keeping and the prefix goes in one drain.
        if log
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= self.window)
        {
            let first_valid = log.partition_point(|ts| now.duration_since(*ts) >= self.window);
            log.drain(..first_valid);
        }

        if log.len() < self.limit {
            log.push_back(now);
            true
        } else {
            false
        }
    }

    async fn stats(&self, key: &str) -> usize {
        let now = self.clock.now();
        let logs = self.logs.lock();
        logs.get(key).map_or(0, |log| {
            log.len() - log.partition_point(|ts| now.duration_since(*ts) >= self.window)
        })
    }

    fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl SlidingLog {
    /// Creates a new `SlidingLog` strategy.
    ///
    /// # Arguments
    ///
    /// * `limit` - The maximum number of requests a single key may make
    ///   within the trailing window.
    /// * `window` - The length of the trailing window.
    pub fn new(limit: NonZeroUsize, window: Duration) -> Self {
        Self::with_clock(limit, window, Clock::new())
    }

    pub fn with_clock(limit: NonZeroUsize, window: Duration, clock: Clock) -> Self {
        let logs: Arc<Mutex<HashMap<String, VecDeque<Instant>>>> = Arc::default();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let swept = Arc::clone(&logs);
        let sweep_clock = clock.clone();
        sweep::spawn_sweep(sweep::SWEEP_INTERVAL, shutdown_rx, move || {
            let now = sweep_clock.now();
            let mut logs = swept.lock();
            let before = logs.len();
            // A key goes once its newest admission has aged out: at that
            // point the entire log is outside the window.
            logs.retain(|_, log| {
                log.back()
                    .is_some_and(|newest| now.duration_since(*newest) < window)
            });
            let evicted = before - logs.len();
            if evicted > 0 {
                debug!(evicted, "sliding log sweep");
            }
        });

        Self {
            limit: limit.get(),
            window,
            logs,
            clock,
            shutdown,
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.logs.lock().len()
    }
}

impl fmt::Debug for SlidingLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingLog")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
