use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use clap::Parser;
use clap::ValueEnum;
use tower::BoxError;
use tower::ServiceBuilder;
use tracing::info;

use keyed_limit::FixedWindow;
use keyed_limit::LeakyBucket;
use keyed_limit::SlidingLog;
use keyed_limit::SlidingWindow;
use keyed_limit::Strategy;
use keyed_limit::TokenBucket;
use tower_keyed::KeyedLimitLayer;
use tower_keyed::LimitError;
use tower_keyed::client_key;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Algorithm {
    FixedWindow,
    SlidingLog,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

#[derive(Parser)]
#[command(about = "demo server with per-caller rate limiting")]
struct Args {
    /// Which limiting strategy to run
    #[arg(long, value_enum, default_value_t = Algorithm::FixedWindow)]
    strategy: Algorithm,

    /// Requests per window (or bucket capacity / queue threshold)
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Window / drain interval in seconds
    #[arg(long, default_value_t = 1.0)]
    window_secs: f64,

    /// Token bucket refill rate, tokens per second
    #[arg(long, default_value_t = 0.5)]
    refill_rate: f64,

    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,
}

/// The caller key is the peer IP, with the raw peer string as the fallback
/// when it does not parse as an address.
fn peer_key(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| client_key(&addr.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let args = Args::parse();
    let limit = NonZeroUsize::new(args.limit.max(1)).unwrap();
    let window = Duration::from_secs_f64(args.window_secs);

    let strategy: Arc<dyn Strategy> = match args.strategy {
        Algorithm::FixedWindow => Arc::new(FixedWindow::new(limit, window)),
        Algorithm::SlidingLog => Arc::new(SlidingLog::new(limit, window)),
        Algorithm::SlidingWindow => Arc::new(SlidingWindow::new(limit, window)),
        Algorithm::TokenBucket => Arc::new(TokenBucket::new(limit, args.refill_rate)),
        Algorithm::LeakyBucket => Arc::new(LeakyBucket::new(limit, window)),
    };
    info!(strategy = ?strategy, "strategy configured");

    let app = Router::new()
        .route("/rate-limit", get(limited))
        .layer(
            ServiceBuilder::new()
                // Outermost: catches BoxError and renders a Response
                .layer(HandleErrorLayer::new(handle_limit_error))
                // The admission gate itself
                .layer(KeyedLimitLayer::new(Arc::clone(&strategy), peer_key))
                // Converts the Route's Infallible into BoxError so the
                // gate can wrap it
                .map_err(BoxError::from),
        )
        // Diagnostics stay outside the gate
        .route("/stats", get(stats))
        .with_state(Arc::clone(&strategy));

    let listener = tokio::net::TcpListener::bind(args.addr).await.unwrap();
    info!(addr = %args.addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    strategy.close();
    info!("strategy closed, bye");
}

async fn limited() -> &'static str {
    "API endpoint\n"
}

async fn stats(
    State(strategy): State<Arc<dyn Strategy>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> String {
    let key = client_key(&addr.to_string());
    format!("Requests from {}: {}\n", key, strategy.stats(&key).await)
}

/// The signature must match BoxError -> IntoResponse
async fn handle_limit_error(err: BoxError) -> impl IntoResponse {
    if let Some(limit_err) = err.downcast_ref::<LimitError>() {
        limit_err.clone().into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Service Error").into_response()
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    info!("received Ctrl+C, shutting down");
}
