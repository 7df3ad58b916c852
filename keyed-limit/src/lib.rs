//! # keyed-limit
//!
//! `keyed-limit` provides strategy driven, per-caller rate limiting.
//!
//! ## Core Philosophy
//!
//! Most rate limiters answer "how many requests may this *process* serve?".
//! `keyed-limit` answers "how many requests may this *caller* make?": every
//! strategy keeps independent state per key (typically a client address) and
//! evicts idle keys in the background so memory stays proportional to the
//! active caller set, not the historical one.
//!
//! ## Key Concepts
//!
//! * **Keyed State**: each strategy owns a private map from caller key to
//!   counter state. Keys appear on first use and are reclaimed once stale.
//! * **Strategy Trait**: a unified interface over five interchangeable
//!   limiting algorithms, so the calling layer never depends on a concrete
//!   implementation.
//! * **Background Reclamation**: every strategy runs a periodic sweep for
//!   its lifetime, stopped by [`Strategy::close`] (or by dropping the
//!   strategy).
//!
//! Constructors spawn their reclamation task on the ambient Tokio runtime,
//! so they must be called from within one.
//!
//! ## Example
//!
//! ```rust
//! use keyed_limit::FixedWindow;
//! use keyed_limit::Strategy;
//! use std::num::NonZeroUsize;
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let limit = NonZeroUsize::new(100).unwrap();
//!     let limiter = FixedWindow::new(limit, Duration::from_secs(60));
//!
//!     if limiter.allow("203.0.113.7").await {
//!         // Request allowed
//!     }
//!     limiter.close();
//! }
//! ```

use std::fmt::Debug;

use async_trait::async_trait;

mod fixed_window;
mod leaky_bucket;
mod sliding_log;
mod sliding_window;
mod sweep;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use sliding_log::SlidingLog;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

/// The core trait for all per-key rate-limiting algorithms.
///
/// Strategies are `Send` and `Sync` so a single instance can be shared
/// across tasks via `Arc`. `allow` and `stats` are total over any key:
/// they never fail and never panic on a key they have not seen.
///
/// The methods are `async` because [`LeakyBucket`] resolves every decision
/// through its processing loop; the lock-based strategies complete without
/// suspending (lock contention aside).
#[async_trait]
pub trait Strategy: Debug + Send + Sync {
    /// Decides whether one request from `key` is admitted, recording one
    /// unit of consumption on admission.
    ///
    /// Keyed state is created lazily on the first call for a key.
    async fn allow(&self, key: &str) -> bool;

    /// Reports the current consumption for `key` without recording
    /// anything. A key that has never been seen (or whose state has been
    /// reclaimed) reports 0.
    async fn stats(&self, key: &str) -> usize;

    /// Signals the background reclamation task to stop.
    ///
    /// Call once at shutdown of the owning process. Dropping the strategy
    /// has the same effect on the task.
    fn close(&self);
}
