use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use teamsync_core::SyncError;

// ---------------------------------------------------------------------------
// Internal sentinels for explicit status codes
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP 409 through the `anyhow::Error` chain.
#[derive(Debug)]
struct ConflictError(String);

impl std::fmt::Display for ConflictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConflictError {}

#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self(ConflictError(msg.into()).into())
    }
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::NotInitialized
        | SyncError::InvalidConfig(_)
        | SyncError::UnknownPhase(_) => StatusCode::BAD_REQUEST,
        SyncError::ItemNotFound(_) => StatusCode::NOT_FOUND,
        SyncError::Busy => StatusCode::CONFLICT,
        SyncError::RecentlyRun { .. } => StatusCode::TOO_MANY_REQUESTS,
        SyncError::Api(_) => StatusCode::BAD_GATEWAY,
        SyncError::Store(_)
        | SyncError::Db(_)
        | SyncError::Io(_)
        | SyncError::Yaml(_)
        | SyncError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.downcast_ref::<ConflictError>().is_some() {
            StatusCode::CONFLICT
        } else if self.0.downcast_ref::<BadRequestError>().is_some() {
            StatusCode::BAD_REQUEST
        } else if let Some(e) = self.0.downcast_ref::<SyncError>() {
            status_for(e)
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn status(err: SyncError) -> StatusCode {
        AppError(err.into()).into_response().status()
    }

    #[test]
    fn busy_maps_to_409() {
        assert_eq!(status(SyncError::Busy), StatusCode::CONFLICT);
    }

    #[test]
    fn recently_run_maps_to_429() {
        assert_eq!(
            status(SyncError::RecentlyRun { until: Utc::now() }),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn unknown_phase_maps_to_400() {
        assert_eq!(
            status(SyncError::UnknownPhase("teams".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn item_not_found_maps_to_404() {
        assert_eq!(
            status(SyncError::ItemNotFound("abc".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn api_failure_maps_to_502() {
        let err = SyncError::Api(racing_api::CallError::Transient("reset".into()));
        assert_eq!(status(err), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn non_sync_error_maps_to_500() {
        let err = AppError(anyhow::anyhow!("something unexpected"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn sentinels_keep_their_status() {
        assert_eq!(
            AppError::conflict("running").into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::bad_request("bad id").into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn response_body_is_json() {
        let response = AppError(SyncError::Busy.into()).into_response();
        let ct = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .expect("should have content-type");
        assert!(ct.to_str().unwrap().contains("application/json"));
    }
}
