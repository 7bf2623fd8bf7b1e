//! Audit trail of executed phases, persisted with redb.
//!
//! # Table design
//!
//! A single `SYNC_LOG` table uses a 24-byte composite key:
//! ```text
//! [ finished_at_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//!
//! Big-endian timestamps make byte order equal time order, so "most recent
//! first" is a reverse iteration with no sorting.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::{Phase, PhaseResult, PhaseStatus};
use crate::error::{Result, SyncError};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// One row per executed phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub phase: Phase,
    pub status: PhaseStatus,
    pub items_processed: u32,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SyncLogEntry {
    pub fn from_phase(batch_id: Uuid, result: &PhaseResult, finished_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            phase: result.phase,
            status: result.status,
            items_processed: result.items_processed,
            duration_ms: result.duration_ms,
            finished_at,
            error_message: result.error.clone(),
        }
    }

    /// Success or partial; the phase produced fresh data.
    pub fn is_completion(&self) -> bool {
        matches!(self.status, PhaseStatus::Success | PhaseStatus::Partial)
    }
}

pub trait SyncLog: Send + Sync {
    fn append(&self, entry: &SyncLogEntry) -> Result<()>;
    /// Newest first.
    fn recent(&self, limit: usize) -> Result<Vec<SyncLogEntry>>;
    fn last_for(&self, phase: Phase) -> Result<Option<SyncLogEntry>>;
    /// Finish time of the newest successful or partial phase.
    fn last_completed(&self) -> Result<Option<DateTime<Utc>>>;
}

// ---------------------------------------------------------------------------
// Table definition
// ---------------------------------------------------------------------------

/// Key: 24-byte composite (finished_at_ms big-endian ++ uuid bytes)
/// Value: JSON-encoded SyncLogEntry
const SYNC_LOG: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sync_log");

fn entry_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn db_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Db(e.to_string())
}

// ---------------------------------------------------------------------------
// SyncLogDb
// ---------------------------------------------------------------------------

pub struct SyncLogDb {
    db: Database,
}

impl SyncLogDb {
    /// Open or create the database at `path`, creating the table if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(SYNC_LOG).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Walk entries newest first until `visit` returns false.
    fn scan_newest(&self, mut visit: impl FnMut(SyncLogEntry) -> bool) -> Result<()> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(SYNC_LOG).map_err(db_err)?;
        for entry in table.iter().map_err(db_err)?.rev() {
            let (_, v) = entry.map_err(db_err)?;
            let row: SyncLogEntry = serde_json::from_slice(v.value())?;
            if !visit(row) {
                break;
            }
        }
        Ok(())
    }
}

impl SyncLog for SyncLogDb {
    fn append(&self, entry: &SyncLogEntry) -> Result<()> {
        let key = entry_key(entry.finished_at, entry.id);
        let value = serde_json::to_vec(entry)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(SYNC_LOG).map_err(db_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        self.scan_newest(|row| {
            out.push(row);
            out.len() < limit
        })?;
        Ok(out)
    }

    fn last_for(&self, phase: Phase) -> Result<Option<SyncLogEntry>> {
        let mut found = None;
        self.scan_newest(|row| {
            if row.phase == phase {
                found = Some(row);
                return false;
            }
            true
        })?;
        Ok(found)
    }

    fn last_completed(&self) -> Result<Option<DateTime<Utc>>> {
        let mut found = None;
        self.scan_newest(|row| {
            if row.is_completion() {
                found = Some(row.finished_at);
                return false;
            }
            true
        })?;
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// MemorySyncLog
// ---------------------------------------------------------------------------

/// Non-persistent log for tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemorySyncLog {
    rows: Mutex<Vec<SyncLogEntry>>,
}

impl MemorySyncLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_newest(&self) -> Vec<SyncLogEntry> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone();
        rows.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        rows
    }
}

impl SyncLog for MemorySyncLog {
    fn append(&self, entry: &SyncLogEntry) -> Result<()> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        Ok(self.sorted_newest().into_iter().take(limit).collect())
    }

    fn last_for(&self, phase: Phase) -> Result<Option<SyncLogEntry>> {
        Ok(self.sorted_newest().into_iter().find(|r| r.phase == phase))
    }

    fn last_completed(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .sorted_newest()
            .into_iter()
            .find(SyncLogEntry::is_completion)
            .map(|r| r.finished_at))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, SyncLogDb) {
        let dir = TempDir::new().unwrap();
        let db = SyncLogDb::open(&dir.path().join("nested/sync-log.db")).unwrap();
        (dir, db)
    }

    fn row(phase: Phase, status: PhaseStatus, at: DateTime<Utc>) -> SyncLogEntry {
        SyncLogEntry {
            id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            phase,
            status,
            items_processed: 3,
            duration_ms: 1200,
            finished_at: at,
            error_message: None,
        }
    }

    #[test]
    fn recent_is_newest_first_regardless_of_insert_order() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        db.append(&row(Phase::Events, PhaseStatus::Success, now)).unwrap();
        db.append(&row(Phase::Riders, PhaseStatus::Success, now - CDur::minutes(10)))
            .unwrap();
        db.append(&row(Phase::Results, PhaseStatus::Error, now + CDur::minutes(1)))
            .unwrap();

        let rows = db.recent(2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].phase, Phase::Results);
        assert_eq!(rows[1].phase, Phase::Events);
    }

    #[test]
    fn last_completed_skips_error_rows() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let partial = row(Phase::Riders, PhaseStatus::Partial, now - CDur::minutes(5));
        db.append(&partial).unwrap();
        db.append(&row(Phase::Events, PhaseStatus::Error, now)).unwrap();

        let last = db.last_completed().unwrap().unwrap();
        assert_eq!(last.timestamp_millis(), partial.finished_at.timestamp_millis());
        assert_eq!(db.last_for(Phase::Events).unwrap().unwrap().status, PhaseStatus::Error);
        assert!(db.last_for(Phase::Results).unwrap().is_none());
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync-log.db");
        {
            let db = SyncLogDb::open(&path).unwrap();
            db.append(&row(Phase::Riders, PhaseStatus::Success, Utc::now()))
                .unwrap();
        }
        let db = SyncLogDb::open(&path).unwrap();
        assert_eq!(db.recent(10).unwrap().len(), 1);
    }

    #[test]
    fn memory_log_matches_db_semantics() {
        let log = MemorySyncLog::new();
        let now = Utc::now();
        log.append(&row(Phase::Riders, PhaseStatus::Success, now - CDur::minutes(3)))
            .unwrap();
        log.append(&row(Phase::Results, PhaseStatus::Error, now)).unwrap();
        assert_eq!(log.recent(5).unwrap()[0].phase, Phase::Results);
        assert!(log.last_completed().unwrap().unwrap() < now);
    }
}
