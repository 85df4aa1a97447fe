//! Audit/run ledger.
//!
//! One SQLite database holding run records, the append-only audit log and a
//! small key/value table for per-window planning fingerprints. Writers share
//! a single connection behind a mutex.

mod action;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::redact::redact_value;
use crate::window::{TriggerKind, Window};

pub use action::AuditAction;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Open,
    Success,
    /// Closed with at least one per-item failure.
    Partial,
    /// A precondition failed.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Open => "open",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(RunStatus::Open),
            "success" => Some(RunStatus::Success),
            "partial" => Some(RunStatus::Partial),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Per-run aggregate counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub changes_applied: u32,
    pub conflicts: u32,
    pub skipped: u32,
    pub failures: u32,
}

impl RunCounts {
    /// Count `n` records of `action`.
    pub fn add(&mut self, action: AuditAction, n: u32) {
        if action == AuditAction::ApplyAiChange {
            self.changes_applied += n;
        }
        if action.is_conflict() {
            self.conflicts += n;
        }
        if action.is_skip() {
            self.skipped += n;
        }
        if action.is_failure() {
            self.failures += n;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: String,
    pub trigger: TriggerKind,
    pub window: Window,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub run_id: Option<String>,
    pub action: String,
    pub calendar_id: String,
    pub uid: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    /// `None` for actions this version does not know.
    pub fn action(&self) -> Option<AuditAction> {
        AuditAction::parse(&self.action)
    }
}

#[derive(Debug)]
pub struct Ledger {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Ledger {
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Ledger {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Ledger {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> LedgerResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Create an `open` run record and return its id.
    pub fn open_run(&self, trigger: TriggerKind, window: &Window) -> LedgerResult<String> {
        let run_id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_runs (run_id, trigger_kind, window_start, window_end, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                trigger.as_str(),
                window.start.to_rfc3339(),
                window.end.to_rfc3339(),
                RunStatus::Open.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(run_id)
    }

    /// Append one audit record. Details are scrubbed of secrets before storage.
    pub fn record(
        &self,
        run_id: Option<&str>,
        action: AuditAction,
        calendar_id: &str,
        uid: &str,
        details: &serde_json::Value,
    ) -> LedgerResult<i64> {
        let details_json = serde_json::to_string(&redact_value(details))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_events (run_id, action, calendar_id, uid, details_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                action.as_str(),
                calendar_id,
                uid,
                details_json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Finalize a run. Only an `open` run can be closed.
    pub fn close_run(&self, run_id: &str, status: RunStatus, counts: RunCounts, message: &str) -> LedgerResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sync_runs
             SET status = ?1, changes_applied = ?2, conflicts = ?3, skipped = ?4, failures = ?5,
                 message = ?6, finished_at = ?7
             WHERE run_id = ?8 AND status = ?9",
            params![
                status.as_str(),
                counts.changes_applied,
                counts.conflicts,
                counts.skipped,
                counts.failures,
                message,
                Utc::now().to_rfc3339(),
                run_id,
                RunStatus::Open.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(LedgerError::UnknownRun(run_id.to_string()));
        }
        Ok(())
    }

    /// Counts for a run, derived from its audit records.
    pub fn tally(&self, run_id: &str) -> LedgerResult<RunCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT action, COUNT(*) FROM audit_events WHERE run_id = ?1 GROUP BY action")?;
        let rows = stmt.query_map([run_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?;
        let mut counts = RunCounts::default();
        for row in rows {
            let (action, n) = row?;
            if let Some(action) = AuditAction::parse(&action) {
                counts.add(action, n);
            }
        }
        Ok(counts)
    }

    pub fn get_run(&self, run_id: &str) -> LedgerResult<Option<SyncRun>> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE run_id = ?1"),
                [run_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> LedgerResult<Vec<SyncRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit as i64], row_to_run)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent audit records first, optionally for one run.
    pub fn list_audit(&self, run_id: Option<&str>, limit: usize) -> LedgerResult<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let rows = match run_id {
            Some(run_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_events WHERE run_id = ?1 ORDER BY id DESC LIMIT ?2"
                ))?;
                stmt.query_map(params![run_id, limit as i64], row_to_audit)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_events ORDER BY id DESC LIMIT ?1"
                ))?;
                stmt.query_map([limit as i64], row_to_audit)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    pub fn get_audit(&self, id: i64) -> LedgerResult<Option<AuditEvent>> {
        let conn = self.conn()?;
        let event = conn
            .query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_events WHERE id = ?1"),
                [id],
                row_to_audit,
            )
            .optional()?;
        Ok(event)
    }

    pub fn get_meta(&self, key: &str) -> LedgerResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM app_meta WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> LedgerResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO app_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

const RUN_COLUMNS: &str = "run_id, trigger_kind, window_start, window_end, status, changes_applied, \
     conflicts, skipped, failures, message, started_at, finished_at";

const AUDIT_COLUMNS: &str = "id, run_id, action, calendar_id, uid, details_json, created_at";

fn parse_ts(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e)))
}

fn invalid_text(column: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("unexpected value '{value}'").into(),
    )
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    let trigger: String = row.get(1)?;
    let status: String = row.get(4)?;
    let finished_at: Option<String> = row.get(11)?;
    Ok(SyncRun {
        run_id: row.get(0)?,
        trigger: TriggerKind::parse(&trigger).ok_or_else(|| invalid_text(1, &trigger))?,
        window: Window {
            start: parse_ts(&row.get::<_, String>(2)?, 2)?,
            end: parse_ts(&row.get::<_, String>(3)?, 3)?,
        },
        status: RunStatus::parse(&status).ok_or_else(|| invalid_text(4, &status))?,
        counts: RunCounts {
            changes_applied: row.get(5)?,
            conflicts: row.get(6)?,
            skipped: row.get(7)?,
            failures: row.get(8)?,
        },
        message: row.get(9)?,
        started_at: parse_ts(&row.get::<_, String>(10)?, 10)?,
        finished_at: finished_at.as_deref().map(|raw| parse_ts(raw, 11)).transpose()?,
    })
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditEvent> {
    let details_json: String = row.get(5)?;
    let details = serde_json::from_str(&details_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(AuditEvent {
        id: row.get(0)?,
        run_id: row.get(1)?,
        action: row.get(2)?,
        calendar_id: row.get(3)?,
        uid: row.get(4)?,
        details,
        created_at: parse_ts(&row.get::<_, String>(6)?, 6)?,
    })
}

/// Audit writer bound to one run (or to none, for undo/reinstruct).
/// Every record is also emitted as a tracing event.
#[derive(Clone, Copy)]
pub struct AuditTrail<'a> {
    ledger: &'a Ledger,
    run_id: Option<&'a str>,
}

impl<'a> AuditTrail<'a> {
    pub fn for_run(ledger: &'a Ledger, run_id: &'a str) -> Self {
        AuditTrail {
            ledger,
            run_id: Some(run_id),
        }
    }

    pub fn detached(ledger: &'a Ledger) -> Self {
        AuditTrail { ledger, run_id: None }
    }

    pub fn run_id(&self) -> Option<&'a str> {
        self.run_id
    }

    pub fn ledger(&self) -> &'a Ledger {
        self.ledger
    }

    pub fn record(
        &self,
        action: AuditAction,
        calendar_id: &str,
        uid: &str,
        details: serde_json::Value,
    ) -> LedgerResult<i64> {
        let run_id = self.run_id.unwrap_or("-");
        if action.is_failure() {
            tracing::warn!(run_id, action = action.as_str(), calendar_id, uid, "{}", action.as_str());
        } else {
            tracing::debug!(run_id, action = action.as_str(), calendar_id, uid, "{}", action.as_str());
        }
        self.ledger.record(self.run_id, action, calendar_id, uid, &details)
    }
}
