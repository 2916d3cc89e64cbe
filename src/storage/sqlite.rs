//! `JobRepository` backed by the r2d2 SQLite pool.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use super::{JobRepository, Pool};
use crate::error::{Error, Result};
use crate::model::{
    ConfigEntry, ConfigEntryId, History, HistoryDetail, HistoryId, Job, JobFilter, JobId,
    JobUpdate, NewConfigEntry, NewHistory, NewJob, NewStep, Page, PageRequest, Status, Step,
    StepHistory, StepId, StepUpdate,
};

const JOB_COLUMNS: &str = "id, name, description, kind, repo_url, host_groups_json, \
     global_vars_json, extra_vars, cli_args, use_config, config_refs_json, is_recurring, \
     cron_expr, max_history_keep, status, error_msg, step_count, total_duration_ms, \
     created_at, updated_at";

const STEP_COLUMNS: &str = "id, job_id, position, entry_name, entry_path, log_path, status, \
     started_at, finished_at, duration_ms, exit_code, error_msg";

const HISTORY_COLUMNS: &str =
    "id, job_id, run_id, status, total_duration_ms, trigger_kind, created_at";

const STEP_HISTORY_COLUMNS: &str =
    "id, history_id, job_id, step_id, label, status, log_path, duration_ms, created_at";

/// SQLite implementation of [`JobRepository`].
#[derive(Clone)]
pub struct SqliteRepository {
    pool: Pool,
}

impl SqliteRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn enum_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        kind: enum_col(row, 3)?,
        repo_url: row.get(4)?,
        host_groups: json_col(row, 5)?,
        global_vars: json_col(row, 6)?,
        extra_vars: row.get(7)?,
        cli_args: row.get(8)?,
        use_config: row.get(9)?,
        config_refs: json_col(row, 10)?,
        is_recurring: row.get(11)?,
        cron_expr: row.get(12)?,
        max_history_keep: row.get(13)?,
        status: enum_col(row, 14)?,
        error_msg: row.get(15)?,
        step_count: row.get(16)?,
        total_duration_ms: row.get(17)?,
        created_at: time_col(row, 18)?,
        updated_at: time_col(row, 19)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        id: row.get(0)?,
        job_id: row.get(1)?,
        position: row.get(2)?,
        entry_name: row.get(3)?,
        entry_path: row.get(4)?,
        log_path: row.get(5)?,
        status: enum_col(row, 6)?,
        started_at: opt_time_col(row, 7)?,
        finished_at: opt_time_col(row, 8)?,
        duration_ms: row.get(9)?,
        exit_code: row.get(10)?,
        error_msg: row.get(11)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<History> {
    Ok(History {
        id: row.get(0)?,
        job_id: row.get(1)?,
        run_id: row.get(2)?,
        status: enum_col(row, 3)?,
        total_duration_ms: row.get(4)?,
        trigger: enum_col(row, 5)?,
        created_at: time_col(row, 6)?,
    })
}

fn step_history_from_row(row: &Row<'_>) -> rusqlite::Result<StepHistory> {
    Ok(StepHistory {
        id: row.get(0)?,
        history_id: row.get(1)?,
        job_id: row.get(2)?,
        step_id: row.get(3)?,
        label: row.get(4)?,
        status: enum_col(row, 5)?,
        log_path: row.get(6)?,
        duration_ms: row.get(7)?,
        created_at: time_col(row, 8)?,
    })
}

fn config_entry_from_row(row: &Row<'_>) -> rusqlite::Result<ConfigEntry> {
    Ok(ConfigEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: enum_col(row, 2)?,
        content: row.get(3)?,
        created_at: time_col(row, 4)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

/// Map a unique-index failure to `Conflict`, everything else to `Storage`.
fn name_taken(err: rusqlite::Error, what: &str, name: &str) -> Error {
    if is_constraint_violation(&err) {
        Error::Conflict(format!("{what} name '{name}' already exists"))
    } else {
        err.into()
    }
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

/// Column assignments collected from a partial-update struct.
#[derive(Default)]
struct Assignments {
    columns: Vec<&'static str>,
    values: Vec<Value>,
}

impl Assignments {
    fn set(&mut self, column: &'static str, value: impl Into<Value>) {
        self.columns.push(column);
        self.values.push(value.into());
    }

    fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn apply(mut self, conn: &Connection, table: &str, id: i64) -> rusqlite::Result<usize> {
        if self.columns.is_empty() {
            return Ok(0);
        }
        let sets: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE {table} SET {} WHERE id = ?{}",
            sets.join(", "),
            self.columns.len() + 1
        );
        self.values.push(Value::Integer(id));
        conn.execute(&sql, params_from_iter(self.values.iter()))
    }
}

fn job_assignments(update: &JobUpdate) -> Result<Assignments> {
    let mut set = Assignments::default();
    if let Some(name) = &update.name {
        set.set("name", name.clone());
    }
    if let Some(description) = &update.description {
        set.set("description", description.clone());
    }
    if let Some(repo_url) = &update.repo_url {
        set.set("repo_url", repo_url.clone());
    }
    if let Some(groups) = &update.host_groups {
        set.set("host_groups_json", serde_json::to_string(groups)?);
    }
    if let Some(vars) = &update.global_vars {
        set.set("global_vars_json", serde_json::to_string(vars)?);
    }
    if let Some(extra) = &update.extra_vars {
        set.set("extra_vars", extra.clone());
    }
    if let Some(args) = &update.cli_args {
        set.set("cli_args", args.clone());
    }
    if let Some(use_config) = update.use_config {
        set.set("use_config", use_config);
    }
    if let Some(refs) = &update.config_refs {
        set.set("config_refs_json", serde_json::to_string(refs)?);
    }
    if let Some(recurring) = update.is_recurring {
        set.set("is_recurring", recurring);
    }
    if let Some(expr) = &update.cron_expr {
        set.set("cron_expr", expr.clone());
    }
    if let Some(keep) = update.max_history_keep {
        set.set("max_history_keep", keep);
    }
    if let Some(status) = update.status {
        set.set("status", status.as_str().to_string());
    }
    if let Some(msg) = &update.error_msg {
        set.set("error_msg", msg.clone());
    }
    if let Some(count) = update.step_count {
        set.set("step_count", count);
    }
    if let Some(total) = update.total_duration_ms {
        set.set("total_duration_ms", total);
    }
    Ok(set)
}

fn step_assignments(update: &StepUpdate) -> Assignments {
    let mut set = Assignments::default();
    if let Some(status) = update.status {
        set.set("status", status.as_str().to_string());
    }
    if let Some(log_path) = &update.log_path {
        set.set("log_path", log_path.clone());
    }
    if let Some(started) = &update.started_at {
        set.set("started_at", started.as_ref().map(ts));
    }
    if let Some(finished) = &update.finished_at {
        set.set("finished_at", finished.as_ref().map(ts));
    }
    if let Some(duration) = update.duration_ms {
        set.set("duration_ms", duration);
    }
    if let Some(code) = update.exit_code {
        set.set("exit_code", code);
    }
    if let Some(msg) = &update.error_msg {
        set.set("error_msg", msg.clone());
    }
    set
}

// ---------------------------------------------------------------------------
// Row loaders shared between methods
// ---------------------------------------------------------------------------

fn load_job(conn: &Connection, id: JobId) -> rusqlite::Result<Option<Job>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        [id],
        job_from_row,
    )
    .optional()
}

fn load_steps(conn: &Connection, job_id: JobId) -> rusqlite::Result<Vec<Step>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM steps WHERE job_id = ?1 ORDER BY position, id"
    ))?;
    let rows = stmt.query_map([job_id], step_from_row)?;
    rows.collect()
}

fn load_step_histories(conn: &Connection, history_id: HistoryId) -> rusqlite::Result<Vec<StepHistory>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_HISTORY_COLUMNS} FROM step_histories WHERE history_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map([history_id], step_history_from_row)?;
    rows.collect()
}

fn load_history(conn: &Connection, id: HistoryId) -> rusqlite::Result<Option<HistoryDetail>> {
    let history = conn
        .query_row(
            &format!("SELECT {HISTORY_COLUMNS} FROM histories WHERE id = ?1"),
            [id],
            history_from_row,
        )
        .optional()?;
    match history {
        Some(history) => {
            let steps = load_step_histories(conn, history.id)?;
            Ok(Some(HistoryDetail { history, steps }))
        }
        None => Ok(None),
    }
}

fn delete_history_rows(conn: &Connection, id: HistoryId) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM step_histories WHERE history_id = ?1", [id])?;
    conn.execute("DELETE FROM histories WHERE id = ?1", [id])?;
    Ok(())
}

#[async_trait]
impl JobRepository for SqliteRepository {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let conn = self.pool.get()?;
        let now = ts(&Utc::now());
        conn.execute(
            "INSERT INTO jobs (name, description, kind, repo_url, host_groups_json, \
                 global_vars_json, extra_vars, cli_args, use_config, config_refs_json, \
                 is_recurring, cron_expr, max_history_keep, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'waiting', ?14, ?14)",
            params![
                job.name,
                job.description,
                job.kind.as_str(),
                job.repo_url,
                serde_json::to_string(&job.host_groups)?,
                serde_json::to_string(&job.global_vars)?,
                job.extra_vars,
                job.cli_args,
                job.use_config,
                serde_json::to_string(&job.config_refs)?,
                job.is_recurring,
                job.cron_expr,
                job.max_history_keep,
                now,
            ],
        )
        .map_err(|e| name_taken(e, "job", &job.name))?;

        let id = conn.last_insert_rowid();
        load_job(&conn, id)?.ok_or_else(|| Error::not_found("job", id))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let conn = self.pool.get()?;
        Ok(load_job(&conn, id)?)
    }

    async fn find_job_by_name(&self, name: &str) -> Result<Option<Job>> {
        let conn = self.pool.get()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
                [name],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    async fn list_jobs(&self, filter: &JobFilter, page: PageRequest) -> Result<Page<Job>> {
        let conn = self.pool.get()?;

        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(name) = &filter.name {
            values.push(Value::Text(name.clone()));
            clauses.push(format!("instr(name, ?{}) > 0", values.len()));
        }
        if let Some(kind) = filter.kind {
            values.push(Value::Text(kind.as_str().to_string()));
            clauses.push(format!("kind = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(recurring) = filter.recurring {
            values.push(Value::Integer(i64::from(recurring)));
            clauses.push(format!("is_recurring = ?{}", values.len()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM jobs{where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        values.push(Value::Integer(page.limit()));
        values.push(Value::Integer(page.offset()));
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs{where_sql} ORDER BY id DESC LIMIT ?{} OFFSET ?{}",
            values.len() - 1,
            values.len()
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(values.iter()), job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page: page.page.max(1),
            size: page.limit() as u32,
        })
    }

    async fn list_recurring_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE is_recurring = 1 AND trim(cron_expr) != '' ORDER BY id"
        ))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<()> {
        let conn = self.pool.get()?;
        let mut set = job_assignments(&update)?;
        set.set("updated_at", ts(&Utc::now()));

        let changed = set.apply(&conn, "jobs", id).map_err(|e| match &update.name {
            Some(name) => name_taken(e, "job", name),
            None => e.into(),
        })?;
        if changed == 0 {
            return Err(Error::not_found("job", id));
        }
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM step_histories WHERE job_id = ?1", [id])?;
        tx.execute("DELETE FROM histories WHERE job_id = ?1", [id])?;
        tx.execute("DELETE FROM steps WHERE job_id = ?1", [id])?;
        let removed = tx.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    async fn claim_job(&self, id: JobId) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'running', error_msg = '', updated_at = ?2
             WHERE id = ?1 AND status != 'running'",
            params![id, ts(&Utc::now())],
        )?;
        if changed == 1 {
            return Ok(true);
        }
        match load_job(&conn, id)? {
            Some(_) => Ok(false),
            None => Err(Error::not_found("job", id)),
        }
    }

    async fn replace_steps(&self, job_id: JobId, steps: Vec<NewStep>) -> Result<Vec<Step>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM steps WHERE job_id = ?1", [job_id])?;
        for (position, step) in steps.iter().enumerate() {
            tx.execute(
                "INSERT INTO steps (job_id, position, entry_name, entry_path) VALUES (?1, ?2, ?3, ?4)",
                params![job_id, position as i64, step.entry_name, step.entry_path],
            )?;
        }
        tx.execute(
            "UPDATE jobs SET step_count = ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id, steps.len() as i64, ts(&Utc::now())],
        )?;
        let stored = load_steps(&tx, job_id)?;
        tx.commit()?;
        Ok(stored)
    }

    async fn list_steps(&self, job_id: JobId) -> Result<Vec<Step>> {
        let conn = self.pool.get()?;
        Ok(load_steps(&conn, job_id)?)
    }

    async fn get_step(&self, job_id: JobId, step_id: StepId) -> Result<Option<Step>> {
        let conn = self.pool.get()?;
        let step = conn
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1 AND job_id = ?2"),
                [step_id, job_id],
                step_from_row,
            )
            .optional()?;
        Ok(step)
    }

    async fn update_step(&self, step_id: StepId, update: StepUpdate) -> Result<()> {
        let set = step_assignments(&update);
        if set.is_empty() {
            return Ok(());
        }
        let conn = self.pool.get()?;
        if set.apply(&conn, "steps", step_id)? == 0 {
            return Err(Error::not_found("step", step_id));
        }
        Ok(())
    }

    async fn reset_steps(&self, job_id: JobId) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE steps SET status = 'waiting', log_path = NULL, started_at = NULL,
                 finished_at = NULL, duration_ms = 0, exit_code = NULL, error_msg = ''
             WHERE job_id = ?1",
            [job_id],
        )?;
        Ok(())
    }

    async fn step_status(&self, job_id: JobId, step_id: StepId) -> Result<Option<Status>> {
        let conn = self.pool.get()?;
        let status = conn
            .query_row(
                "SELECT status FROM steps WHERE id = ?1 AND job_id = ?2",
                [step_id, job_id],
                |row| enum_col::<Status>(row, 0),
            )
            .optional()?;
        Ok(status)
    }

    async fn create_history(&self, history: NewHistory) -> Result<HistoryDetail> {
        let mut conn = self.pool.get()?;
        let now = ts(&Utc::now());
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO histories (job_id, run_id, status, total_duration_ms, trigger_kind, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                history.job_id,
                history.run_id,
                history.status.as_str(),
                history.total_duration_ms,
                history.trigger.as_str(),
                now,
            ],
        )?;
        let history_id = tx.last_insert_rowid();
        for step in &history.steps {
            tx.execute(
                "INSERT INTO step_histories (history_id, job_id, step_id, label, status, log_path, duration_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    history_id,
                    history.job_id,
                    step.step_id,
                    step.label,
                    step.status.as_str(),
                    step.log_path,
                    step.duration_ms,
                    now,
                ],
            )?;
        }
        let detail = load_history(&tx, history_id)?;
        tx.commit()?;
        detail.ok_or_else(|| Error::not_found("history", history_id))
    }

    async fn list_history(&self, job_id: JobId, page: PageRequest) -> Result<Page<History>> {
        let conn = self.pool.get()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM histories WHERE job_id = ?1",
            [job_id],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM histories WHERE job_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let items = stmt
            .query_map(params![job_id, page.limit(), page.offset()], history_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total: total.max(0) as u64,
            page: page.page.max(1),
            size: page.limit() as u32,
        })
    }

    async fn get_history(&self, id: HistoryId) -> Result<Option<HistoryDetail>> {
        let conn = self.pool.get()?;
        Ok(load_history(&conn, id)?)
    }

    async fn get_step_history(&self, id: i64) -> Result<Option<StepHistory>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("SELECT {STEP_HISTORY_COLUMNS} FROM step_histories WHERE id = ?1"),
                [id],
                step_history_from_row,
            )
            .optional()?;
        Ok(row)
    }

    async fn delete_history(&self, id: HistoryId) -> Result<Option<HistoryDetail>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let detail = load_history(&tx, id)?;
        if detail.is_some() {
            delete_history_rows(&tx, id)?;
        }
        tx.commit()?;
        Ok(detail)
    }

    async fn prune_history(&self, job_id: JobId, keep: usize) -> Result<Vec<StepHistory>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let stale: Vec<HistoryId> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM histories WHERE job_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT -1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![job_id, keep as i64], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut removed = Vec::new();
        for id in stale {
            removed.extend(load_step_histories(&tx, id)?);
            delete_history_rows(&tx, id)?;
        }
        tx.commit()?;
        Ok(removed)
    }

    async fn recover_interrupted(&self, reason: &str) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let now = ts(&Utc::now());
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE steps SET status = 'failed', error_msg = ?1, finished_at = ?2
             WHERE status = 'running'",
            params![reason, now],
        )?;
        let jobs = tx.execute(
            "UPDATE jobs SET status = 'failed', error_msg = ?1, updated_at = ?2
             WHERE status = 'running'",
            params![reason, now],
        )?;
        tx.commit()?;
        Ok(jobs)
    }

    async fn create_config_entry(&self, entry: NewConfigEntry) -> Result<ConfigEntry> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO config_entries (name, kind, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![entry.name, entry.kind.as_str(), entry.content, ts(&Utc::now())],
        )
        .map_err(|e| name_taken(e, "config entry", &entry.name))?;
        let id = conn.last_insert_rowid();
        let stored = conn.query_row(
            "SELECT id, name, kind, content, created_at FROM config_entries WHERE id = ?1",
            [id],
            config_entry_from_row,
        )?;
        Ok(stored)
    }

    async fn get_config_entry(&self, id: ConfigEntryId) -> Result<Option<ConfigEntry>> {
        let conn = self.pool.get()?;
        let entry = conn
            .query_row(
                "SELECT id, name, kind, content, created_at FROM config_entries WHERE id = ?1",
                [id],
                config_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    async fn list_config_entries(&self) -> Result<Vec<ConfigEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, content, created_at FROM config_entries ORDER BY name",
        )?;
        let entries = stmt
            .query_map([], config_entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    async fn delete_config_entry(&self, id: ConfigEntryId) -> Result<bool> {
        let conn = self.pool.get()?;
        Ok(conn.execute("DELETE FROM config_entries WHERE id = ?1", [id])? > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{ConfigKind, ConfigRefs, HostRef, JobKind, NewStepHistory, Trigger};
    use crate::storage::open_pool;

    fn repo() -> (tempfile::TempDir, SqliteRepository) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("test.db")).unwrap();
        (dir, SqliteRepository::new(pool))
    }

    fn new_job(name: &str) -> NewJob {
        let mut host_groups = BTreeMap::new();
        host_groups.insert(
            "web".to_string(),
            vec![HostRef {
                address: "10.0.0.1".into(),
                port: 22,
                user: "deploy".into(),
            }],
        );
        NewJob {
            name: name.to_string(),
            description: String::new(),
            kind: JobKind::Manual,
            repo_url: None,
            host_groups,
            global_vars: BTreeMap::new(),
            extra_vars: String::new(),
            cli_args: String::new(),
            use_config: false,
            config_refs: ConfigRefs::default(),
            is_recurring: false,
            cron_expr: String::new(),
            max_history_keep: 3,
        }
    }

    fn finished_run(job_id: JobId, step_id: StepId, run: &str) -> NewHistory {
        NewHistory {
            job_id,
            run_id: run.to_string(),
            status: Status::Succeeded,
            total_duration_ms: 10,
            trigger: Trigger::Manual,
            steps: vec![NewStepHistory {
                step_id,
                label: "site.yml".into(),
                status: Status::Succeeded,
                log_path: Some(format!("/logs/{run}/site.yml.log")),
                duration_ms: 10,
            }],
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch_job() {
        let (_dir, repo) = repo();
        let job = repo.create_job(new_job("deploy")).await.unwrap();
        assert_eq!(job.status, Status::Waiting);
        assert_eq!(job.host_groups["web"][0].user, "deploy");

        let fetched = repo.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "deploy");
        assert!(repo.find_job_by_name("deploy").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let (_dir, repo) = repo();
        repo.create_job(new_job("deploy")).await.unwrap();
        let err = repo.create_job(new_job("deploy")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_partial_update_leaves_other_columns() {
        let (_dir, repo) = repo();
        let job = repo.create_job(new_job("deploy")).await.unwrap();
        repo.update_job(
            job.id,
            JobUpdate {
                description: Some("nightly".into()),
                ..JobUpdate::default()
            },
        )
        .await
        .unwrap();

        let fetched = repo.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.description, "nightly");
        assert_eq!(fetched.name, "deploy");
        assert_eq!(fetched.host_groups, job.host_groups);

        let missing = repo.update_job(9999, JobUpdate::status(Status::Failed)).await;
        assert!(matches!(missing, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_claim_refuses_running_job() {
        let (_dir, repo) = repo();
        let job = repo.create_job(new_job("deploy")).await.unwrap();
        assert!(repo.claim_job(job.id).await.unwrap());
        assert!(!repo.claim_job(job.id).await.unwrap());
        assert!(matches!(
            repo.claim_job(4242).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_steps_keep_order_and_reset() {
        let (_dir, repo) = repo();
        let job = repo.create_job(new_job("deploy")).await.unwrap();
        let steps = repo
            .replace_steps(
                job.id,
                ["b.yml", "a.yml", "c.yml"]
                    .iter()
                    .map(|n| NewStep {
                        entry_name: n.to_string(),
                        entry_path: format!("/w/{n}"),
                    })
                    .collect(),
            )
            .await
            .unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.entry_name.as_str()).collect();
        assert_eq!(names, ["b.yml", "a.yml", "c.yml"]);
        assert_eq!(repo.get_job(job.id).await.unwrap().unwrap().step_count, 3);

        repo.update_step(steps[0].id, StepUpdate::started("/l/b.log".into(), Utc::now()))
            .await
            .unwrap();
        assert_eq!(
            repo.step_status(job.id, steps[0].id).await.unwrap(),
            Some(Status::Running)
        );

        repo.reset_steps(job.id).await.unwrap();
        let step = repo.get_step(job.id, steps[0].id).await.unwrap().unwrap();
        assert_eq!(step.status, Status::Waiting);
        assert!(step.log_path.is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_histories() {
        let (_dir, repo) = repo();
        let job = repo.create_job(new_job("deploy")).await.unwrap();
        for run in ["r1", "r2", "r3", "r4"] {
            repo.create_history(finished_run(job.id, 1, run)).await.unwrap();
        }

        let removed = repo.prune_history(job.id, 3).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].log_path.as_deref(), Some("/logs/r1/site.yml.log"));

        let page = repo.list_history(job.id, PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 3);
        let runs: Vec<_> = page.items.iter().map(|h| h.run_id.as_str()).collect();
        assert_eq!(runs, ["r4", "r3", "r2"]);
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates() {
        let (_dir, repo) = repo();
        for name in ["web-deploy", "db-backup", "web-restart"] {
            repo.create_job(new_job(name)).await.unwrap();
        }
        let filter = JobFilter {
            name: Some("web".into()),
            ..JobFilter::default()
        };
        let page = repo.list_jobs(&filter, PageRequest::new(1, 1)).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "web-restart");

        let second = repo.list_jobs(&filter, PageRequest::new(2, 1)).await.unwrap();
        assert_eq!(second.items[0].name, "web-deploy");
    }

    #[tokio::test]
    async fn test_recover_interrupted_fails_running_rows() {
        let (_dir, repo) = repo();
        let job = repo.create_job(new_job("deploy")).await.unwrap();
        let steps = repo
            .replace_steps(
                job.id,
                vec![NewStep {
                    entry_name: "site.yml".into(),
                    entry_path: "/w/site.yml".into(),
                }],
            )
            .await
            .unwrap();
        repo.claim_job(job.id).await.unwrap();
        repo.update_step(steps[0].id, StepUpdate::started("/l".into(), Utc::now()))
            .await
            .unwrap();

        assert_eq!(repo.recover_interrupted("interrupted by restart").await.unwrap(), 1);
        let job = repo.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Failed);
        assert_eq!(job.error_msg, "interrupted by restart");
        let step = repo.get_step(job.id, steps[0].id).await.unwrap().unwrap();
        assert_eq!(step.status, Status::Failed);
    }

    #[tokio::test]
    async fn test_delete_job_removes_history() {
        let (_dir, repo) = repo();
        let job = repo.create_job(new_job("deploy")).await.unwrap();
        let detail = repo.create_history(finished_run(job.id, 1, "r1")).await.unwrap();
        assert!(repo.delete_job(job.id).await.unwrap());
        assert!(repo.get_history(detail.history.id).await.unwrap().is_none());
        assert!(!repo.delete_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_config_entries() {
        let (_dir, repo) = repo();
        let entry = repo
            .create_config_entry(NewConfigEntry {
                name: "prod-hosts".into(),
                kind: ConfigKind::Inventory,
                content: "[web]\n10.0.0.1".into(),
            })
            .await
            .unwrap();
        assert_eq!(entry.kind, ConfigKind::Inventory);
        assert_eq!(repo.list_config_entries().await.unwrap().len(), 1);
        assert!(repo.delete_config_entry(entry.id).await.unwrap());
        assert!(repo.get_config_entry(entry.id).await.unwrap().is_none());
    }
}
