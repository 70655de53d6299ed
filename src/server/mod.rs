pub mod handlers;
pub mod request;
pub mod response;
pub mod state;
pub mod url_validation;

use crate::config::Config;
use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use state::AppState;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Header carrying the crate version on every response
pub const VERSION_HEADER: &str = "x-hls-relay-version";

/// Build the router with a fresh [`AppState`].
pub fn build_router(config: Config) -> Result<Router, reqwest::Error> {
    Ok(router(AppState::new(config)?))
}

/// Build the router around an existing state.
///
/// `/stream` and `/proxy` are also served under `/api/` for clients built
/// against that layout; a rewritten playlist points back at whichever path
/// it was requested on.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .route(
            "/stream",
            get(handlers::stream::serve_stream).options(handlers::health::preflight),
        )
        .route(
            "/api/stream",
            get(handlers::stream::serve_stream).options(handlers::health::preflight),
        )
        .route(
            "/proxy",
            get(handlers::proxy::serve_proxy).options(handlers::health::preflight),
        )
        .route(
            "/api/proxy",
            get(handlers::proxy::serve_proxy).options(handlers::health::preflight),
        )
        .layer(cors)
        .layer(middleware::from_fn(version_header))
        .with_state(state)
}

async fn version_header(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(
        VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    resp
}

/// Start the Axum HTTP server and run until SIGINT
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);

    let state = AppState::new(config)?;
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("🚀 Relay listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Relay stopped");
    Ok(())
}

/// Resolve on Ctrl-C, cancelling every in-flight relay first.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }

    info!("Shutdown signal received, cancelling in-flight relays");
    shutdown.cancel();
}
