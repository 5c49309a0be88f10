//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS test_runs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'QUEUED',
            error TEXT,
            result TEXT,
            configuration_snapshot TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_test_runs_created ON test_runs(created_at);
        CREATE INDEX IF NOT EXISTS idx_test_runs_status ON test_runs(status);",
    )?;

    // Migration: legacy event column, kept in sync with `result`
    let has_logs: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('test_runs') WHERE name='logs'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_logs == 0 {
        conn.execute("ALTER TABLE test_runs ADD COLUMN logs TEXT", [])?;
    }

    Ok(())
}
