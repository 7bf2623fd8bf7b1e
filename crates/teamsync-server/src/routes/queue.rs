use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use teamsync_core::queue::{EntityKey, EntityKind, QueueStatus, Tier, WorkItem};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_TIER: Tier = 2;

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("invalid item id '{raw}'")))
}

/// GET /api/queue: queue snapshot.
pub async fn get_status(State(app): State<AppState>) -> Json<QueueStatus> {
    Json(app.queue().get_status())
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub kind: EntityKind,
    pub id: u64,
    #[serde(default)]
    pub tier: Option<Tier>,
}

/// POST /api/queue: add one entity.
pub async fn enqueue(
    State(app): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let key = EntityKey {
        kind: body.kind,
        id: body.id,
    };
    let id = app
        .queue()
        .enqueue(key, body.tier.unwrap_or(DEFAULT_TIER), "api");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "key": key.to_string() })),
    )
}

/// GET /api/queue/{id}: one item.
pub async fn get_item(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkItem>, AppError> {
    let id = parse_id(&id)?;
    app.queue()
        .get_item(id)
        .map(Json)
        .ok_or_else(|| teamsync_core::SyncError::ItemNotFound(id.to_string()).into())
}

/// POST /api/queue/{id}/cancel: drop a pending item.
pub async fn cancel(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_id(&id)?;
    if !app.queue().cancel(id)? {
        return Err(AppError::conflict("only pending items can be cancelled"));
    }
    Ok(Json(serde_json::json!({ "cancelled": id })))
}

/// POST /api/queue/{id}/retry: requeue a failed item.
pub async fn retry(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_id(&id)?;
    if !app.queue().retry(id)? {
        return Err(AppError::conflict("only failed items can be retried"));
    }
    Ok(Json(serde_json::json!({ "retried": id })))
}

/// POST /api/queue/retry-failed: requeue every failed item.
pub async fn retry_failed(State(app): State<AppState>) -> Json<serde_json::Value> {
    let count = app.queue().retry_all_failed();
    Json(serde_json::json!({ "retried": count }))
}
