use axum::extract::State;
use axum::Json;
use teamsync_core::schedule::SchedulerStatus;

use crate::state::AppState;

/// GET /api/scheduler
pub async fn get_status(State(app): State<AppState>) -> Json<SchedulerStatus> {
    Json(app.scheduler.status())
}

/// POST /api/scheduler/start
pub async fn start(State(app): State<AppState>) -> Json<SchedulerStatus> {
    app.scheduler.start();
    Json(app.scheduler.status())
}

/// POST /api/scheduler/stop
pub async fn stop(State(app): State<AppState>) -> Json<SchedulerStatus> {
    app.scheduler.stop();
    Json(app.scheduler.status())
}
