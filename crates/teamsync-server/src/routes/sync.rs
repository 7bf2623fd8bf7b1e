use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use teamsync_core::coordinator::{Phase, TriggerOutcome};

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/sync/trigger/{phase}: start one phase in the background.
pub async fn trigger_phase(
    State(app): State<AppState>,
    Path(phase): Path<String>,
) -> Result<(StatusCode, Json<TriggerOutcome>), AppError> {
    let phase: Phase = phase.parse()?;
    let outcome = app.coordinator.trigger_phase(phase);
    let status = match outcome {
        TriggerOutcome::Accepted { .. } => StatusCode::ACCEPTED,
        TriggerOutcome::Busy => StatusCode::CONFLICT,
        TriggerOutcome::RateLimitedUntil { .. } => StatusCode::TOO_MANY_REQUESTS,
    };
    Ok((status, Json(outcome)))
}

/// POST /api/sync/smart: start a smart sync in the background.
pub async fn trigger_smart(
    State(app): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let plan = app
        .coordinator
        .trigger_smart()
        .ok_or_else(|| AppError::conflict("a sync batch is already running"))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "outcome": "accepted", "plan": plan })),
    ))
}

/// GET /api/sync/last: most recent batch plus coordinator status.
pub async fn last_batch(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": app.coordinator.status(),
        "last_batch": app.coordinator.last_batch(),
    }))
}

/// GET /api/sync/budgets: per-category rate budget usage.
pub async fn budgets(State(app): State<AppState>) -> Json<serde_json::Value> {
    let budgets = app.coordinator.client().budget_status();
    Json(serde_json::json!(budgets))
}
