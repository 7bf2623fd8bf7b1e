//! Raw fetch surface of the racing data API.
//!
//! Payloads stay opaque (`serde_json::Value`); interpreting rider, event and
//! result fields belongs to the storage layer. The only decision made here is
//! the [`CallError`] classification of each response.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::error::CallError;

/// One raw record as returned by the API.
pub type Record = Value;

pub type ApiResult<T> = std::result::Result<T, CallError>;

// ─── RacingApi ────────────────────────────────────────────────────────────

/// Fetch operations against the remote API. Implementations must not apply
/// their own rate limiting; every call is routed through
/// [`RateBudgetedClient`](crate::RateBudgetedClient).
pub trait RacingApi: Send + Sync {
    fn club_members(&self, club_id: u64) -> BoxFuture<'_, ApiResult<Vec<Record>>>;
    fn rider(&self, rider_id: u64) -> BoxFuture<'_, ApiResult<Record>>;
    fn riders_bulk(&self, rider_ids: Vec<u64>) -> BoxFuture<'_, ApiResult<Vec<Record>>>;
    fn event(&self, event_id: u64) -> BoxFuture<'_, ApiResult<Record>>;
    fn event_signups(&self, event_id: u64) -> BoxFuture<'_, ApiResult<Vec<Record>>>;
    fn event_results(&self, event_id: u64) -> BoxFuture<'_, ApiResult<Vec<Record>>>;
    fn upcoming_events(&self, hours: u32) -> BoxFuture<'_, ApiResult<Vec<Record>>>;
}

// ─── HttpRacingApi ────────────────────────────────────────────────────────

/// reqwest-backed implementation of [`RacingApi`].
#[derive(Debug, Clone)]
pub struct HttpRacingApi {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRacingApi {
    /// Build a client for `base_url` with a fixed per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::Validation(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(reqwest::header::AUTHORIZATION, key),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> ApiResult<Value> {
        let resp = self.authorize(req).send().await.map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, resp.headers()));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| CallError::Transient(format!("malformed response body: {e}")))
    }

    async fn get(&self, path: &str) -> ApiResult<Value> {
        debug!(path, "GET");
        self.send(self.http.get(self.url(path))).await
    }
}

impl RacingApi for HttpRacingApi {
    fn club_members(&self, club_id: u64) -> BoxFuture<'_, ApiResult<Vec<Record>>> {
        Box::pin(async move {
            let body = self.get(&format!("/public/clubs/{club_id}")).await?;
            Ok(records_field(body, "riders"))
        })
    }

    fn rider(&self, rider_id: u64) -> BoxFuture<'_, ApiResult<Record>> {
        Box::pin(async move { self.get(&format!("/public/riders/{rider_id}")).await })
    }

    fn riders_bulk(&self, rider_ids: Vec<u64>) -> BoxFuture<'_, ApiResult<Vec<Record>>> {
        Box::pin(async move {
            debug!(count = rider_ids.len(), "POST /public/riders");
            let req = self.http.post(self.url("/public/riders")).json(&rider_ids);
            let body = self.send(req).await?;
            Ok(records_field(body, "riders"))
        })
    }

    fn event(&self, event_id: u64) -> BoxFuture<'_, ApiResult<Record>> {
        Box::pin(async move { self.get(&format!("/public/events/{event_id}")).await })
    }

    fn event_signups(&self, event_id: u64) -> BoxFuture<'_, ApiResult<Vec<Record>>> {
        Box::pin(async move {
            let body = self.get(&format!("/api/events/{event_id}/signups")).await?;
            Ok(records_field(body, "signups"))
        })
    }

    fn event_results(&self, event_id: u64) -> BoxFuture<'_, ApiResult<Vec<Record>>> {
        Box::pin(async move {
            let body = self.get(&format!("/public/results/{event_id}")).await?;
            Ok(records_field(body, "results"))
        })
    }

    fn upcoming_events(&self, hours: u32) -> BoxFuture<'_, ApiResult<Vec<Record>>> {
        Box::pin(async move {
            let body = self.get(&format!("/api/events/upcoming?hours={hours}")).await?;
            Ok(records_field(body, "events"))
        })
    }
}

// ─── Classification ───────────────────────────────────────────────────────

/// Map a non-success HTTP status onto the call taxonomy.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> CallError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CallError::RateLimited {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        StatusCode::NOT_FOUND => CallError::NotFound,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            CallError::Validation(format!("remote rejected request ({status})"))
        }
        other => CallError::Transient(format!("unexpected status {other}")),
    }
}

fn transport_error(err: reqwest::Error) -> CallError {
    if err.is_timeout() {
        CallError::Transient("request timed out".into())
    } else {
        CallError::Transient(err.to_string())
    }
}

/// Collection endpoints answer either with a bare array or with an object
/// wrapping it under `field`.
fn records_field(body: Value, field: &str) -> Vec<Record> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(field) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
