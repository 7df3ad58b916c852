use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;
use tokio::sync::watch;
use tracing::debug;

use super::Strategy;
use crate::sweep;

struct BucketLevel {
    tokens: f64,
    last_refill: Instant,
}

/// A per-key token bucket.
///
/// Each key owns a bucket that starts full (permitting an initial burst up
/// to capacity) and refills continuously at `refill_rate` tokens per
/// second, capped at capacity. Every call refills before deciding, so
/// rejected requests advance the refill clock too.
pub struct TokenBucket {
    capacity: usize,
    refill_rate: f64,
    buckets: Arc<Mutex<HashMap<String, BucketLevel>>>,
    clock: Clock,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl Strategy for TokenBucket {
    async fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock();

        let data = buckets.entry(key.to_string()).or_insert_with(|| BucketLevel {
            tokens: self.capacity as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(data.last_refill).as_secs_f64();
        data.tokens = (data.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        data.last_refill = now;

        if data.tokens >= 1.0 {
            data.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Consumption so far, as `capacity - floor(level)` with the level
    /// projected forward to now. The projection is read-only: the stored
    /// level is only rewritten by `allow`.
    async fn stats(&self, key: &str) -> usize {
        let now = self.clock.now();
        let buckets = self.buckets.lock();
        buckets.get(key).map_or(0, |data| {
            let elapsed = now.duration_since(data.last_refill).as_secs_f64();
            let projected = (data.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
            self.capacity - projected.floor() as usize
        })
    }

    fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl TokenBucket {
    /// Creates a new `TokenBucket` strategy.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The maximum number of tokens a bucket can hold; also
    ///   the size of the initial burst a fresh key is granted.
    /// * `refill_rate` - Tokens added per second, continuously.
    pub fn new(capacity: NonZeroUsize, refill_rate: f64) -> Self {
        Self::with_clock(capacity, refill_rate, Clock::new())
    }

    pub fn with_clock(capacity: NonZeroUsize, refill_rate: f64, clock: Clock) -> Self {
        let buckets: Arc<Mutex<HashMap<String, BucketLevel>>> = Arc::default();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let swept = Arc::clone(&buckets);
        let sweep_clock = clock.clone();
        sweep::spawn_sweep(sweep::SWEEP_INTERVAL, shutdown_rx, move || {
            let now = sweep_clock.now();
            let mut buckets = swept.lock();
            let before = buckets.len();
            buckets.retain(|_, data| now.duration_since(data.last_refill) < sweep::STALE_AFTER);
            let evicted = before - buckets.len();
            if evicted > 0 {
                debug!(evicted, "token bucket sweep");
            }
        });

        Self {
            capacity: capacity.get(),
            refill_rate,
            buckets,
            clock,
            shutdown,
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use more_asserts::assert_ge;

    use super::*;

    const KEY: &str = "203.0.113.7";

    #[tokio::test]
    async fn it_enforces_limits_starting_full() {
        let (clock, mock) = Clock::mock();
        let rl = TokenBucket::with_clock(NonZeroUsize::new(2).unwrap(), 10.0, clock);

        // 1. A fresh key can burst up to capacity immediately
        assert!(rl.allow(KEY).await);
        assert!(rl.allow(KEY).await);

        // 2. Third request fails (exhausted)
        assert!(!rl.allow(KEY).await);

        // 3. Wait for one token's worth of refill
        mock.increment(Duration::from_millis(110));

        // 4. Exactly 1 new token
        assert!(rl.allow(KEY).await);
        assert!(!rl.allow(KEY).await);
    }

    #[tokio::test]
    async fn refill_is_continuous_and_capped() {
        let (clock, mock) = Clock::mock();
        let rl = TokenBucket::with_clock(NonZeroUsize::new(10).unwrap(), 0.5, clock);

        for _ in 0..10 {
            assert!(rl.allow(KEY).await);
        }
        assert!(!rl.allow(KEY).await);

        // 4 seconds at 0.5 tokens/sec buys exactly 2 admissions.
        mock.increment(Duration::from_secs(4));
        assert!(rl.allow(KEY).await);
        assert!(rl.allow(KEY).await);
        assert!(!rl.allow(KEY).await);

        // A long idle period refills to capacity, never beyond it.
        mock.increment(Duration::from_secs(3600));
        let mut admitted = 0;
        while rl.allow(KEY).await {
            admitted += 1;
        }
        assert_eq!(admitted, 10);
    }

    // Rejected calls still advance last_refill. The fractional refill
    // accumulated between calls must survive that bookkeeping.
    #[tokio::test]
    async fn rejections_do_not_lose_partial_refill() {
        let (clock, mock) = Clock::mock();
        let rl = TokenBucket::with_clock(NonZeroUsize::new(1).unwrap(), 1.0, clock);

        assert!(rl.allow(KEY).await);

        for _ in 0..3 {
            mock.increment(Duration::from_millis(300));
            assert!(!rl.allow(KEY).await);
        }

        // 1.2 seconds of refill have accumulated across the rejections.
        mock.increment(Duration::from_millis(300));
        assert!(rl.allow(KEY).await);
    }

    #[tokio::test]
    async fn stats_projects_without_mutating() {
        let (clock, mock) = Clock::mock();
        let rl = TokenBucket::with_clock(NonZeroUsize::new(10).unwrap(), 0.5, clock);

        for _ in 0..4 {
            assert!(rl.allow(KEY).await);
        }
        assert_eq!(rl.stats(KEY).await, 4);

        // Two seconds later the projection sees one token back...
        mock.increment(Duration::from_secs(2));
        assert_eq!(rl.stats(KEY).await, 3);
        // ...and reading it twice changes nothing.
        assert_eq!(rl.stats(KEY).await, 3);

        // The stored level was not rewritten: 6 tokens + the 1 projected
        // one really are available to allow.
        let mut admitted = 0;
        while rl.allow(KEY).await {
            admitted += 1;
        }
        assert_eq!(admitted, 7);
    }

    #[tokio::test]
    async fn stats_reports_zero_for_unseen_keys() {
        let rl = TokenBucket::new(NonZeroUsize::new(5).unwrap(), 1.0);
        assert_eq!(rl.stats("198.51.100.9").await, 0);
    }

    #[tokio::test]
    async fn keys_burst_independently() {
        let (clock, _mock) = Clock::mock();
        let rl = TokenBucket::with_clock(NonZeroUsize::new(3).unwrap(), 1.0, clock);

        let mut first = 0;
        while rl.allow("10.0.0.1").await {
            first += 1;
        }
        assert_eq!(first, 3);

        let mut second = 0;
        while rl.allow("10.0.0.2").await {
            second += 1;
        }
        assert_ge!(second, 3);
    }

    #[tokio::test]
    async fn sweep_reclaims_idle_buckets() {
        tokio::time::pause();

        let (clock, mock) = Clock::mock();
        let rl = TokenBucket::with_clock(NonZeroUsize::new(10).unwrap(), 0.001, clock);
        // Let the sweeper task start and register its timer.
        tokio::task::yield_now().await;

        for _ in 0..10 {
            assert!(rl.allow(KEY).await);
        }
        assert_eq!(rl.tracked_keys(), 1);

        mock.increment(sweep::STALE_AFTER + Duration::from_secs(1));
        tokio::time::advance(sweep::SWEEP_INTERVAL + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(rl.tracked_keys(), 0);
        // A reclaimed key starts over with a full bucket; at this refill
        // rate the drained bucket would otherwise still be nearly empty.
        assert!(rl.allow(KEY).await);
    }
}
