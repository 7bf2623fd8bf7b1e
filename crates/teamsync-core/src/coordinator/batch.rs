use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::store::UpsertSummary;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One stage of a batch. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Riders,
    Events,
    Results,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Self::Riders, Self::Events, Self::Results];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Riders => "riders",
            Self::Events => "events",
            Self::Results => "results",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| SyncError::UnknownPhase(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    #[serde(default)]
    pub skip_riders: bool,
    #[serde(default)]
    pub skip_events: bool,
    #[serde(default)]
    pub skip_results: bool,
    /// Bypass the recent-run guard.
    #[serde(default)]
    pub force: bool,
}

impl BatchOptions {
    /// Run only `phase`.
    pub fn only(phase: Phase) -> Self {
        Self {
            skip_riders: phase != Phase::Riders,
            skip_events: phase != Phase::Events,
            skip_results: phase != Phase::Results,
            force: true,
        }
    }

    pub fn skips(&self, phase: Phase) -> bool {
        match phase {
            Phase::Riders => self.skip_riders,
            Phase::Events => self.skip_events,
            Phase::Results => self.skip_results,
        }
    }
}

// ---------------------------------------------------------------------------
// PhaseResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Success,
    Partial,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub items_processed: u32,
    pub items_new: u32,
    pub items_updated: u32,
    pub items_failed: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseResult {
    pub fn skipped(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Skipped,
            items_processed: 0,
            items_new: 0,
            items_updated: 0,
            items_failed: 0,
            duration_ms: 0,
            error: None,
        }
    }

    pub fn failed(phase: Phase, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: PhaseStatus::Error,
            duration_ms,
            error: Some(message.into()),
            ..Self::skipped(phase)
        }
    }
}

/// Running totals for one phase while it executes.
#[derive(Debug, Default, Clone)]
pub(crate) struct PhaseTally {
    pub processed: u32,
    pub failed: u32,
    pub upserts: UpsertSummary,
    pub errors: Vec<String>,
}

impl PhaseTally {
    pub fn record_ok(&mut self, summary: UpsertSummary) {
        self.processed += 1;
        self.upserts += summary;
    }

    pub fn record_err(&mut self, message: String) {
        self.processed += 1;
        self.failed += 1;
        self.errors.push(message);
    }

    pub fn into_result(self, phase: Phase, duration_ms: u64) -> PhaseResult {
        let status = if self.failed == 0 {
            PhaseStatus::Success
        } else if self.failed < self.processed {
            PhaseStatus::Partial
        } else {
            PhaseStatus::Error
        };
        let error = match self.errors.len() {
            0 => None,
            1 => self.errors.into_iter().next(),
            n => Some(format!("{} (and {} more)", self.errors[0], n - 1)),
        };
        PhaseResult {
            phase,
            status,
            items_processed: self.processed,
            items_new: self.upserts.new,
            items_updated: self.upserts.updated,
            items_failed: self.failed,
            duration_ms,
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// BatchRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    Partial,
    Error,
}

/// Finalized record of one coordinator execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRun {
    pub id: Uuid,
    pub requested_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub phases: Vec<PhaseResult>,
    pub status: BatchStatus,
    pub duration_ms: u64,
    /// e.g. "2/3 phases succeeded".
    pub summary: String,
}

impl BatchRun {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// A batch that has started but not finished. `finish` consumes it, so a
/// run can only ever produce one terminal record.
#[derive(Debug)]
pub(crate) struct BatchInProgress {
    id: Uuid,
    requested_by: String,
    started_at: DateTime<Utc>,
    phases: Vec<PhaseResult>,
}

impl BatchInProgress {
    pub fn start(requested_by: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requested_by: requested_by.to_string(),
            started_at,
            phases: Vec::with_capacity(Phase::ALL.len()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn push(&mut self, result: PhaseResult) {
        self.phases.push(result);
    }

    pub fn finish(self, completed_at: DateTime<Utc>, duration_ms: u64) -> BatchRun {
        let executed: Vec<&PhaseResult> = self
            .phases
            .iter()
            .filter(|p| p.status != PhaseStatus::Skipped)
            .collect();
        let succeeded = executed
            .iter()
            .filter(|p| p.status == PhaseStatus::Success)
            .count();
        let errored = executed
            .iter()
            .filter(|p| p.status == PhaseStatus::Error)
            .count();
        let status = if succeeded == executed.len() {
            BatchStatus::Success
        } else if errored == executed.len() {
            BatchStatus::Error
        } else {
            BatchStatus::Partial
        };
        let summary = format!("{succeeded}/{} phases succeeded", executed.len());
        BatchRun {
            id: self.id,
            requested_by: self.requested_by,
            started_at: self.started_at,
            completed_at,
            phases: self.phases,
            status,
            duration_ms,
            summary,
        }
    }
}
