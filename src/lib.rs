pub mod api;
pub mod app_state;
pub mod config;
pub mod encoder;
pub mod error;
pub mod media;
pub mod session;

use anyhow::Context;
use axum::Router;
use axum::extract::Extension;
use axum::routing::{get, post};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

//
// Re-export
//
pub use api::log_request_errors;
pub use app_state::AppState;
pub use config::Config;
pub use error::RelayError;
pub use session::{PeerController, SessionRegistry, StreamController};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(api::liveness))
        .route("/stream/start", post(api::start_stream))
        .route("/stream/stop", post(api::stop_stream))
        .route("/stream/debug/sessions", get(api::debug_sessions))
        .route("/stream/debug/sessions/{session_id}", get(api::debug_session))
        .route("/signaling", get(api::signaling))
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

/// Serves the relay on the configured port until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", config.listen_on_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    serve(listener, config, shutdown_signal()).await
}

/// Serves the relay on `listener` until `shutdown` resolves, then closes every session.
pub async fn serve<F>(listener: TcpListener, config: Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    ffmpeg_next::init().context("Failed to initialize ffmpeg")?;
    let state = AppState::new(config)?;
    let app = router(state.clone());

    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    state.shutdown().await;
    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(?error, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
