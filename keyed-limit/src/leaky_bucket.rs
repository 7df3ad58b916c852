use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use quanta::Clock;
use quanta::Instant;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;

use super::Strategy;
use crate::sweep;

/// Capacity of the command channel feeding the processing loop. A full
/// queue rejects the request instead of blocking the caller.
const QUEUE_DEPTH: usize = 100;

enum Command {
    Check {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Level {
        key: String,
        reply: oneshot::Sender<usize>,
    },
    #[cfg(test)]
    TrackedKeys { reply: oneshot::Sender<usize> },
}

struct BucketSlot {
    size: usize,
    last_request: Instant,
}

/// A per-key leaky bucket.
///
/// Admissions raise a key's queue level, bounded by `threshold`; a tick
/// every `interval` drains each level by one, modeling constant-rate
/// processing regardless of arrival bursts.
///
/// Unlike the other strategies there is no shared lock here: all state is
/// owned by a single processing loop, and `allow`/`stats` submit commands
/// to it and wait for the reply. Admission checks use a bounded queue and
/// fail fast: if the queue is saturated the request is rejected rather
/// than parked.
pub struct LeakyBucket {
    threshold: usize,
    interval: Duration,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl Strategy for LeakyBucket {
    async fn allow(&self, key: &str) -> bool {
        let (reply, decision) = oneshot::channel();
        let cmd = Command::Check {
            key: key.to_string(),
            reply,
        };
        // Saturated queue or a closed loop: reject, never block.
        if self.commands.try_send(cmd).is_err() {
            return false;
        }
        decision.await.unwrap_or(false)
    }

    async fn stats(&self, key: &str) -> usize {
        let (reply, level) = oneshot::channel();
        let cmd = Command::Level {
            key: key.to_string(),
            reply,
        };
        // A diagnostics read may wait for a queue slot; only admission
        // checks are fail-fast.
        if self.commands.send(cmd).await.is_err() {
            return 0;
        }
        level.await.unwrap_or(0)
    }

    fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl LeakyBucket {
    /// Creates a new `LeakyBucket` strategy.
    ///
    /// # Arguments
    ///
    /// * `threshold` - The maximum queue level per key.
    /// * `interval` - How often every key's level drains by one.
    pub fn new(threshold: NonZeroUsize, interval: Duration) -> Self {
        Self::with_clock(threshold, interval, Clock::new())
    }

    pub fn with_clock(threshold: NonZeroUsize, interval: Duration, clock: Clock) -> Self {
        let (commands, command_rx) = mpsc::channel(QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(run(
            command_rx,
            shutdown_rx,
            threshold.get(),
            interval,
            clock,
        ));

        Self {
            threshold: threshold.get(),
            interval,
            commands,
            shutdown,
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked_keys(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self
            .commands
            .send(Command::TrackedKeys { reply })
            .await
            .is_err()
        {
            return 0;
        }
        count.await.unwrap_or(0)
    }
}

/// The processing loop. It exclusively owns the bucket map; admission
/// checks, level reads, drain ticks and staleness eviction are all applied
/// here, one at a time.
async fn run(
    mut commands: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
    threshold: usize,
    interval: Duration,
    clock: Clock,
) {
    let mut buckets: HashMap<String, BucketSlot> = HashMap::new();
    let first = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(first, interval);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            cmd = commands.recv() => match cmd {
                Some(Command::Check { key, reply }) => {
                    let now = clock.now();
                    let slot = buckets.entry(key).or_insert_with(|| BucketSlot {
                        size: 0,
                        last_request: now,
                    });
                    let admitted = slot.size < threshold;
                    if admitted {
                        slot.size += 1;
                        slot.last_request = now;
                    }
                    let _ = reply.send(admitted);
                }
                Some(Command::Level { key, reply }) => {
                    let _ = reply.send(buckets.get(&key).map_or(0, |slot| slot.size));
                }
                #[cfg(test)]
                Some(Command::TrackedKeys { reply }) => {
                    let _ = reply.send(buckets.len());
                }
                None => break,
            },
            _ = ticker.tick() => {
                let now = clock.now();
                let before = buckets.len();
                buckets.retain(|_, slot| {
                    if slot.size > 0 {
                        slot.size -= 1;
                    }
                    // Reclamation rides the tick: an empty bucket that has
                    // been untouched for the staleness threshold goes.
                    slot.size > 0
                        || now.duration_since(slot.last_request) < sweep::STALE_AFTER
                });
                let evicted = before - buckets.len();
                if evicted > 0 {
                    debug!(evicted, "leaky bucket tick evicted idle keys");
                }
            }
        }
    }
}

impl fmt::Debug for LeakyBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakyBucket")
            .field("threshold", &self.threshold)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
