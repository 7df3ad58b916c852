//! # Tower Keyed
//!
//! `tower-keyed` gates requests through a per-caller rate limiting strategy
//! from [`keyed_limit`], as middleware for the
//! [Tower](https://github.com/tower-rs/tower) ecosystem.
//!
//! ## How it works
//!
//! [`KeyedLimitLayer`] pairs a strategy with a key extraction function.
//! For every request the service derives the caller key, asks the strategy
//! for an admission decision, and either forwards the request or resolves
//! it to [`LimitError::RateLimited`]. The layer depends only on the
//! [`keyed_limit::Strategy`] trait, so the five algorithms are freely
//! interchangeable behind it, including as `Arc<dyn Strategy>`.
//!
//! Because the key comes from the request itself, gating happens inside
//! `call` rather than `poll_ready`: there is nothing to decide before a
//! request exists.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`LimitError`], allowing automatic
//!   conversion to HTTP status codes (429, 500).

mod error;
mod keys;
mod layer;
mod service;


pub use error::LimitError;
pub use keys::client_key;
pub use layer::KeyedLimitLayer;
pub use service::KeyedLimitService;
