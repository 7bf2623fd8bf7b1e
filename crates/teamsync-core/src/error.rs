use chrono::{DateTime, Utc};
use racing_api::CallError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not initialized: run 'teamsync init'")]
    NotInitialized,

    #[error("a sync batch is already running")]
    Busy,

    #[error("sync ran recently; next run allowed after {until}")]
    RecentlyRun { until: DateTime<Utc> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown phase '{0}': expected riders, events or results")]
    UnknownPhase(String),

    #[error("queue item not found: {0}")]
    ItemNotFound(String),

    #[error(transparent)]
    Api(#[from] CallError),

    #[error("store error: {0}")]
    Store(String),

    #[error("sync log error: {0}")]
    Db(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
