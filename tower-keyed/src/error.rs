/// Errors produced by the keyed rate limiting middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LimitError {
    /// The caller identified by `key` is over its rate limit.
    ///
    /// When the `axum` feature is enabled, this converts to
    /// `429 Too Many Requests`. No retry metadata is attached: the
    /// strategies decide admission, not backoff schedules.
    #[error("rate limit exceeded for {key}")]
    RateLimited {
        /// The caller key the decision applied to.
        key: String,
    },

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to
    /// `500 Internal Server Error`.
    #[error("internal service error: {0}")]
    Inner(String),
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for LimitError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
