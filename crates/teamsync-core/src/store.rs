//! Storage seam for synced entities.
//!
//! The orchestrator only needs "upsert succeeded / failed" signals plus a few
//! queries to decide what to sync next. Field mapping into real tables lives
//! behind [`EntityStore`]; [`MemoryStore`] is the in-process implementation
//! used by the CLI and tests.

use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use racing_api::Record;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub new: u32,
    pub updated: u32,
}

impl UpsertSummary {
    pub fn total(&self) -> u32 {
        self.new + self.updated
    }
}

impl AddAssign for UpsertSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.new += rhs.new;
        self.updated += rhs.updated;
    }
}

/// The slice of an event the coordinator reasons about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: u64,
    pub starts_at: DateTime<Utc>,
}

pub trait EntityStore: Send + Sync {
    fn upsert_riders(&self, records: &[Record]) -> Result<UpsertSummary>;
    fn upsert_event(&self, record: &Record) -> Result<UpsertSummary>;
    fn upsert_signups(&self, event_id: u64, records: &[Record]) -> Result<UpsertSummary>;
    fn upsert_results(&self, event_id: u64, records: &[Record]) -> Result<UpsertSummary>;
    /// Events starting in `[now, now + within]`, soonest first.
    fn upcoming_events(&self, now: DateTime<Utc>, within: Duration) -> Result<Vec<StoredEvent>>;
    /// Events starting at or after `since`, oldest first.
    fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<StoredEvent>>;
    fn has_results(&self, event_id: u64) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Record field helpers
// ---------------------------------------------------------------------------

/// First of `fields` holding a numeric id (number or numeric string).
pub fn record_id(record: &Record, fields: &[&str]) -> Option<u64> {
    fields.iter().find_map(|f| match record.get(*f)? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

pub const RIDER_ID_FIELDS: &[&str] = &["riderId", "rider_id", "id"];
pub const EVENT_ID_FIELDS: &[&str] = &["eventId", "event_id", "id"];

/// Start time of an event record: unix seconds in `time`/`time_unix`, or an
/// RFC 3339 string in `eventStart`/`event_date`.
pub fn event_start(record: &Record) -> Option<DateTime<Utc>> {
    for field in ["time", "time_unix"] {
        if let Some(secs) = record.get(field).and_then(|v| v.as_i64()) {
            return Utc.timestamp_opt(secs, 0).single();
        }
    }
    for field in ["eventStart", "event_date"] {
        if let Some(s) = record.get(field).and_then(|v| v.as_str()) {
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Some(t.with_timezone(&Utc));
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    riders: HashMap<u64, Record>,
    events: HashMap<u64, Record>,
    signups: HashMap<u64, HashMap<u64, Record>>,
    results: HashMap<u64, HashMap<u64, Record>>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

fn upsert_into(table: &mut HashMap<u64, Record>, id: u64, record: &Record) -> UpsertSummary {
    match table.insert(id, record.clone()) {
        Some(_) => UpsertSummary { new: 0, updated: 1 },
        None => UpsertSummary { new: 1, updated: 0 },
    }
}

fn upsert_keyed(table: &mut HashMap<u64, Record>, records: &[Record], what: &str) -> UpsertSummary {
    let mut summary = UpsertSummary::default();
    for record in records {
        match record_id(record, RIDER_ID_FIELDS) {
            Some(id) => summary += upsert_into(table, id, record),
            None => warn!(what, "skipping record without rider id"),
        }
    }
    summary
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn rider_count(&self) -> usize {
        self.tables().riders.len()
    }

    pub fn event_count(&self) -> usize {
        self.tables().events.len()
    }

    pub fn result_count(&self, event_id: u64) -> usize {
        self.tables().results.get(&event_id).map_or(0, |r| r.len())
    }

    fn stored_events(&self, keep: impl Fn(DateTime<Utc>) -> bool) -> Vec<StoredEvent> {
        let mut out: Vec<StoredEvent> = self
            .tables()
            .events
            .iter()
            .filter_map(|(id, record)| {
                let starts_at = event_start(record)?;
                keep(starts_at).then_some(StoredEvent {
                    event_id: *id,
                    starts_at,
                })
            })
            .collect();
        out.sort_by_key(|e| (e.starts_at, e.event_id));
        out
    }
}

impl EntityStore for MemoryStore {
    fn upsert_riders(&self, records: &[Record]) -> Result<UpsertSummary> {
        Ok(upsert_keyed(&mut self.tables().riders, records, "rider"))
    }

    fn upsert_event(&self, record: &Record) -> Result<UpsertSummary> {
        let id = record_id(record, EVENT_ID_FIELDS)
            .ok_or_else(|| SyncError::Store("event record has no id".into()))?;
        Ok(upsert_into(&mut self.tables().events, id, record))
    }

    fn upsert_signups(&self, event_id: u64, records: &[Record]) -> Result<UpsertSummary> {
        let mut tables = self.tables();
        let table = tables.signups.entry(event_id).or_default();
        Ok(upsert_keyed(table, records, "signup"))
    }

    fn upsert_results(&self, event_id: u64, records: &[Record]) -> Result<UpsertSummary> {
        let mut tables = self.tables();
        let table = tables.results.entry(event_id).or_default();
        Ok(upsert_keyed(table, records, "result"))
    }

    fn upcoming_events(&self, now: DateTime<Utc>, within: Duration) -> Result<Vec<StoredEvent>> {
        let until = now + within;
        Ok(self.stored_events(|t| t >= now && t <= until))
    }

    fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<StoredEvent>> {
        Ok(self.stored_events(|t| t >= since))
    }

    fn has_results(&self, event_id: u64) -> Result<bool> {
        Ok(self
            .tables()
            .results
            .get(&event_id)
            .is_some_and(|r| !r.is_empty()))
    }
}
