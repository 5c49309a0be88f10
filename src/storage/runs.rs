//! Durable run records.
//!
//! Status transitions are guarded in SQL so a record only ever moves forward:
//! QUEUED -> RUNNING -> {PASS | FAIL | CANCELLED}, or QUEUED -> CANCELLED.
//! Writes that would move a terminal record report `false` and change nothing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::Pool;
use crate::model::{Event, RunConfig, RunRecord, RunStatus};

const COLUMNS: &str =
    "id, status, created_at, started_at, completed_at, error, result, logs, configuration_snapshot";

/// Terminal write for a run.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: RunStatus,
    pub error: Option<String>,
    /// `None` keeps whatever event list is already stored.
    pub events: Option<Vec<Event>>,
}

impl Completion {
    pub fn new(status: RunStatus, error: Option<String>, events: Option<Vec<Event>>) -> Self {
        debug_assert!(status.is_terminal(), "completion requires a terminal status");
        Self {
            status,
            error,
            events,
        }
    }
}

/// Durable store of run records.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a QUEUED record. An existing record with the same id is left untouched.
    async fn create(&self, run_id: &str, config: &RunConfig) -> Result<()>;

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Most recent records first.
    async fn list(&self, limit: usize) -> Result<Vec<RunRecord>>;

    /// QUEUED -> RUNNING. Returns whether the transition applied.
    async fn mark_running(&self, run_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// QUEUED/RUNNING -> terminal. Returns whether the transition applied.
    async fn complete(&self, run_id: &str, completion: Completion) -> Result<bool>;

    /// Ids of records that still claim QUEUED or RUNNING.
    async fn active_run_ids(&self) -> Result<Vec<String>>;
}

/// [`RunStore`] backed by the SQLite pool.
#[derive(Clone)]
pub struct SqliteRunStore {
    pool: Pool,
}

impl SqliteRunStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&*conn)
        })
        .await?
    }
}

struct RawRecord {
    id: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    result: Option<String>,
    logs: Option<String>,
    configuration_snapshot: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            created_at: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            error: row.get(5)?,
            result: row.get(6)?,
            logs: row.get(7)?,
            configuration_snapshot: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            status: self
                .status
                .parse()
                .with_context(|| format!("run {} has an invalid status", self.id))?,
            created_at: parse_time(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            id: self.id,
            error: self.error,
            result: self.result,
            logs: self.logs,
            configuration_snapshot: self.configuration_snapshot,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

#[async_trait::async_trait]
impl RunStore for SqliteRunStore {
    async fn create(&self, run_id: &str, config: &RunConfig) -> Result<()> {
        let run_id = run_id.to_string();
        let snapshot = serde_json::to_string(config)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO test_runs (id, status, configuration_snapshot, created_at)
                 VALUES (?1, 'QUEUED', ?2, ?3)
                 ON CONFLICT(id) DO NOTHING",
                params![run_id, snapshot, Utc::now().to_rfc3339()],
            )
            .context("Failed to insert test run")?;
            Ok(())
        })
        .await
    }

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM test_runs WHERE id = ?1", COLUMNS),
                    params![run_id],
                    RawRecord::from_row,
                )
                .optional()?;
            raw.map(RawRecord::into_record).transpose()
        })
        .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM test_runs ORDER BY created_at DESC LIMIT ?1",
                COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit as i64], RawRecord::from_row)?;

            let mut records = Vec::new();
            for r in rows {
                records.push(r?.into_record()?);
            }
            Ok(records)
        })
        .await
    }

    async fn mark_running(&self, run_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE test_runs SET status = 'RUNNING', started_at = ?2
                 WHERE id = ?1 AND status = 'QUEUED'",
                params![run_id, at.to_rfc3339()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn complete(&self, run_id: &str, completion: Completion) -> Result<bool> {
        let run_id = run_id.to_string();
        let events = completion
            .events
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let status = completion.status.as_str();
        let error = completion.error;
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE test_runs
                 SET status = ?2,
                     error = ?3,
                     result = COALESCE(?4, result, logs, '[]'),
                     logs = COALESCE(?4, logs, result, '[]'),
                     completed_at = ?5
                 WHERE id = ?1 AND status IN ('QUEUED', 'RUNNING')",
                params![run_id, status, error, events, Utc::now().to_rfc3339()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn active_run_ids(&self) -> Result<Vec<String>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM test_runs WHERE status IN ('QUEUED', 'RUNNING') ORDER BY created_at",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }
}
