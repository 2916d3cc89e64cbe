//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS config_entries (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL,
            repo_url TEXT,
            host_groups_json TEXT NOT NULL,
            global_vars_json TEXT NOT NULL DEFAULT '{}',
            extra_vars TEXT NOT NULL DEFAULT '',
            cli_args TEXT NOT NULL DEFAULT '',
            use_config INTEGER NOT NULL DEFAULT 0,
            config_refs_json TEXT NOT NULL DEFAULT '{}',
            is_recurring INTEGER NOT NULL DEFAULT 0,
            cron_expr TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'waiting',
            error_msg TEXT NOT NULL DEFAULT '',
            step_count INTEGER NOT NULL DEFAULT 0,
            total_duration_ms INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS steps (
            id INTEGER PRIMARY KEY,
            job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            entry_name TEXT NOT NULL,
            entry_path TEXT NOT NULL,
            log_path TEXT,
            status TEXT NOT NULL DEFAULT 'waiting',
            started_at TEXT,
            finished_at TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            exit_code INTEGER,
            error_msg TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS histories (
            id INTEGER PRIMARY KEY,
            job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            run_id TEXT NOT NULL,
            status TEXT NOT NULL,
            total_duration_ms INTEGER NOT NULL DEFAULT 0,
            trigger_kind TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS step_histories (
            id INTEGER PRIMARY KEY,
            history_id INTEGER NOT NULL REFERENCES histories(id) ON DELETE CASCADE,
            job_id INTEGER NOT NULL,
            step_id INTEGER NOT NULL,
            label TEXT NOT NULL,
            status TEXT NOT NULL,
            log_path TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
        CREATE INDEX IF NOT EXISTS idx_jobs_recurring ON jobs(is_recurring);
        CREATE INDEX IF NOT EXISTS idx_steps_job ON steps(job_id, position);
        CREATE INDEX IF NOT EXISTS idx_histories_job ON histories(job_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_step_histories_history ON step_histories(history_id);",
    )?;

    // Migration: per-job history retention arrived with schema version 2
    let has_keep: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('jobs') WHERE name='max_history_keep'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_keep == 0 {
        conn.execute(
            "ALTER TABLE jobs ADD COLUMN max_history_keep INTEGER NOT NULL DEFAULT 3",
            [],
        )?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
