pub mod error;
pub mod routes;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use racing_api::SystemClock;
use teamsync_core::{Engine, SyncConfig};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: state::AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Events (SSE)
        .route("/api/events", get(routes::events::sse_events))
        // Sync
        .route(
            "/api/sync/trigger/{phase}",
            post(routes::sync::trigger_phase),
        )
        .route("/api/sync/smart", post(routes::sync::trigger_smart))
        .route("/api/sync/last", get(routes::sync::last_batch))
        .route("/api/sync/budgets", get(routes::sync::budgets))
        // Queue
        .route(
            "/api/queue",
            get(routes::queue::get_status).post(routes::queue::enqueue),
        )
        .route(
            "/api/queue/retry-failed",
            post(routes::queue::retry_failed),
        )
        .route("/api/queue/{id}", get(routes::queue::get_item))
        .route("/api/queue/{id}/cancel", post(routes::queue::cancel))
        .route("/api/queue/{id}/retry", post(routes::queue::retry))
        // Scheduler
        .route("/api/scheduler", get(routes::scheduler::get_status))
        .route("/api/scheduler/start", post(routes::scheduler::start))
        .route("/api/scheduler/stop", post(routes::scheduler::stop))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Load the config under `root`, wire the engine and serve the API.
///
/// The scheduler is started unless `start_scheduler` is false; it can still
/// be started later through `POST /api/scheduler/start`.
pub async fn serve(root: PathBuf, port: u16, start_scheduler: bool) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(root, listener, start_scheduler).await
}

/// Like `serve`, on a pre-bound listener (useful when `port = 0`).
pub async fn serve_on(
    root: PathBuf,
    listener: tokio::net::TcpListener,
    start_scheduler: bool,
) -> anyhow::Result<()> {
    let config = SyncConfig::load(&root)?;
    let engine = Engine::open(&root, &config, Arc::new(SystemClock))?;
    if start_scheduler {
        engine.scheduler.start();
    }
    let scheduler = Arc::clone(&engine.scheduler);
    let app = build_router(state::AppState::new(engine));

    let actual_port = listener.local_addr()?.port();
    tracing::info!("teamsync server listening on http://localhost:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    scheduler.stop();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        futures::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
