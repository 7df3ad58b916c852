use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tower::BoxError;
use tower::Service;
use tracing::trace;

use keyed_limit::Strategy;

use crate::error::LimitError;

#[derive(Clone, Debug)]
struct KeyedLimitMetrics {
    rejected: Counter<u64>,
}

/// A `tower::Service` that admits or rejects each request according to a
/// per-caller strategy before handing it to the inner service.
#[derive(Debug)]
pub struct KeyedLimitService<L, S, F>
where
    L: ?Sized,
{
    inner: S,
    limiter: Arc<L>,
    key_fn: F,
    instruments: KeyedLimitMetrics,
}

impl<L, S, F> Clone for KeyedLimitService<L, S, F>
where
    L: ?Sized,
    S: Clone,
    F: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            key_fn: self.key_fn.clone(),
            instruments: self.instruments.clone(),
        }
    }
}

impl<L, S, F, Req> Service<Req> for KeyedLimitService<L, S, F>
where
    L: Strategy + ?Sized + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
    F: Fn(&Req) -> String,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Admission is keyed, and the key only exists once the request
        // does. Readiness is therefore the inner service's alone.
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        let limiter = Arc::clone(&self.limiter);
        let rejected = self.instruments.rejected.clone();

        // Hand the ready inner service to the future and leave a fresh
        // clone behind for the next call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if limiter.allow(&key).await {
                trace!(key = %key, "request admitted");
                inner.call(req).await
            } else {
                trace!(key = %key, "request rejected");
                rejected.add(1, &[KeyValue::new("strategy", format!("{limiter:?}"))]);
                Err(BoxError::from(LimitError::RateLimited { key }))
            }
        })
    }
}

impl<L, S, F> KeyedLimitService<L, S, F>
where
    L: ?Sized,
{
    pub fn new(inner: S, limiter: Arc<L>, key_fn: F) -> Self {
        let meter = global::meter("keyed_limit_service");
        let instruments = KeyedLimitMetrics {
            rejected: meter.u64_counter("rejected").build(),
        };

        Self {
            inner,
            limiter,
            key_fn,
            instruments,
        }
    }
}
