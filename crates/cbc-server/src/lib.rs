pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use cbc_core::workflow::Engine;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(engine: Arc<Engine>) -> Router {
    let app_state = state::AppState::new(engine);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/events", post(routes::events::submit_event))
        .route("/api/runs", get(routes::runs::list_runs))
        .route("/api/runs/{id}", get(routes::runs::get_run))
        .route("/api/definition", get(routes::definition::get_definition))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Advance due runs every `interval` on the blocking pool.
///
/// Ticks never overlap: the next one starts after the previous returns.
pub fn spawn_tick_worker(engine: Arc<Engine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let engine = engine.clone();
            match tokio::task::spawn_blocking(move || engine.tick()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "tick failed"),
                Err(e) => tracing::error!(error = %e, "tick task panicked"),
            }
        }
    })
}

/// Serve the API on a pre-bound listener with a background tick worker.
///
/// Accepts a `TcpListener` that was already bound so the caller can read the
/// actual port before starting (useful when `port = 0`).
pub async fn serve_on(
    engine: Arc<Engine>,
    listener: tokio::net::TcpListener,
    tick_interval: Duration,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let worker = spawn_tick_worker(engine.clone(), tick_interval);
    let app = build_router(engine);

    tracing::info!("cbc API listening on http://localhost:{actual_port}");

    let result = axum::serve(listener, app).await;
    worker.abort();
    result?;
    Ok(())
}
