use std::sync::Arc;

use keyed_limit::Strategy;
use tower::Layer;

use crate::service::KeyedLimitService;

/// Applies per-caller rate limiting to requests.
///
/// `key_fn` derives the caller key from each request (see
/// [`client_key`](crate::client_key) for the usual address-based
/// derivation). The strategy is held behind `Arc` and may be a trait
/// object, so the algorithm stays swappable without touching the stack.
#[derive(Debug)]
pub struct KeyedLimitLayer<L, F>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    key_fn: F,
}

impl<L, F> Clone for KeyedLimitLayer<L, F>
where
    L: ?Sized,
    F: Clone,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<L, F> KeyedLimitLayer<L, F>
where
    L: Strategy + ?Sized,
{
    /// Create a KeyedLimitLayer
    pub fn new(limiter: Arc<L>, key_fn: F) -> Self {
        KeyedLimitLayer { limiter, key_fn }
    }
}

impl<L, S, F> Layer<S> for KeyedLimitLayer<L, F>
where
    L: ?Sized,
    F: Clone,
{
    type Service = KeyedLimitService<L, S, F>;

    fn layer(&self, service: S) -> Self::Service {
        KeyedLimitService::new(service, self.limiter.clone(), self.key_fn.clone())
    }
}
