use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::UpsertSummary;

pub type ItemId = Uuid;

/// Priority class; lower values are processed first.
pub type Tier = u8;

// ---------------------------------------------------------------------------
// EntityKey
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Rider,
    Event,
    Result,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rider => "rider",
            Self::Event => "event",
            Self::Result => "result",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rider" => Ok(Self::Rider),
            "event" => Ok(Self::Event),
            "result" => Ok(Self::Result),
            other => Err(format!("unknown entity kind '{other}'")),
        }
    }
}

/// Identity used for queue dedup, e.g. `rider:150437`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: u64,
}

impl EntityKey {
    pub fn rider(id: u64) -> Self {
        Self {
            kind: EntityKind::Rider,
            id,
        }
    }

    pub fn event(id: u64) -> Self {
        Self {
            kind: EntityKind::Event,
            id,
        }
    }

    pub fn result(id: u64) -> Self {
        Self {
            kind: EntityKind::Result,
            id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("entity key '{s}' must look like kind:id"))?;
        let id = id
            .parse::<u64>()
            .map_err(|_| format!("entity key '{s}' has a non-numeric id"))?;
        Ok(Self {
            kind: kind.parse()?,
            id,
        })
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub key: EntityKey,
    pub tier: Tier,
    pub status: ItemStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub requested_by: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// What the store reported for a completed item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<UpsertSummary>,
}

// ---------------------------------------------------------------------------
// Events and status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventKind {
    Enqueued,
    Processing,
    Completed,
    Failed,
    Retry,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub kind: QueueEventKind,
    pub item_id: ItemId,
    pub key: EntityKey,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueEvent {
    pub(crate) fn of(kind: QueueEventKind, item: &WorkItem) -> Self {
        Self {
            kind,
            item_id: item.id,
            key: item.key,
            retry_count: item.retry_count,
            error: item.last_error.clone(),
        }
    }
}

/// Read-only snapshot of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue_depth: usize,
    pub processing: Option<WorkItem>,
    /// Pending items in dequeue order.
    pub pending: Vec<WorkItem>,
    pub failed: Vec<WorkItem>,
    pub completed_count: usize,
    pub worker_running: bool,
}
