//! Persistence contract for jobs, steps, history and configuration entries.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    ConfigEntry, ConfigEntryId, HistoryDetail, HistoryId, History, Job, JobFilter, JobId, JobUpdate,
    NewConfigEntry, NewHistory, NewJob, NewStep, Page, PageRequest, Status, Step, StepHistory,
    StepId, StepUpdate,
};

/// Everything the engine needs from durable storage.
///
/// Implementations must be usable concurrently from the executor, the
/// scheduler and any number of tail sessions.
#[async_trait]
pub trait JobRepository: Send + Sync {
    // -- jobs --------------------------------------------------------------

    /// Insert a job. A duplicate name is a `Conflict`.
    async fn create_job(&self, job: NewJob) -> Result<Job>;
    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;
    async fn find_job_by_name(&self, name: &str) -> Result<Option<Job>>;
    async fn list_jobs(&self, filter: &JobFilter, page: PageRequest) -> Result<Page<Job>>;
    /// Jobs flagged recurring with a non-empty expression.
    async fn list_recurring_jobs(&self) -> Result<Vec<Job>>;
    /// Apply a partial update. Returns `NotFound` for unknown ids.
    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<()>;
    /// Remove a job together with its steps and history. Returns whether it existed.
    async fn delete_job(&self, id: JobId) -> Result<bool>;
    /// Atomically move a non-running job to `running`.
    ///
    /// Returns `false` when the job is already running.
    async fn claim_job(&self, id: JobId) -> Result<bool>;

    // -- steps -------------------------------------------------------------

    /// Replace the steps of a job with `steps`, in order.
    async fn replace_steps(&self, job_id: JobId, steps: Vec<NewStep>) -> Result<Vec<Step>>;
    async fn list_steps(&self, job_id: JobId) -> Result<Vec<Step>>;
    async fn get_step(&self, job_id: JobId, step_id: StepId) -> Result<Option<Step>>;
    async fn update_step(&self, step_id: StepId, update: StepUpdate) -> Result<()>;
    /// Reset every step of a job to `waiting` and clear per-run fields.
    async fn reset_steps(&self, job_id: JobId) -> Result<()>;

    // -- history -----------------------------------------------------------

    async fn create_history(&self, history: NewHistory) -> Result<HistoryDetail>;
    /// Newest first.
    async fn list_history(&self, job_id: JobId, page: PageRequest) -> Result<Page<History>>;
    async fn get_history(&self, id: HistoryId) -> Result<Option<HistoryDetail>>;
    async fn get_step_history(&self, id: i64) -> Result<Option<StepHistory>>;
    /// Delete one history row; returns what was removed so its logs can be cleaned.
    async fn delete_history(&self, id: HistoryId) -> Result<Option<HistoryDetail>>;
    /// Keep the newest `keep` histories of a job and return the removed step rows.
    async fn prune_history(&self, job_id: JobId, keep: usize) -> Result<Vec<StepHistory>>;

    // -- recovery ----------------------------------------------------------

    /// Mark jobs and steps stuck in `running` as failed. Returns the number of jobs touched.
    async fn recover_interrupted(&self, reason: &str) -> Result<usize>;

    // -- configuration entries ---------------------------------------------

    async fn create_config_entry(&self, entry: NewConfigEntry) -> Result<ConfigEntry>;
    async fn get_config_entry(&self, id: ConfigEntryId) -> Result<Option<ConfigEntry>>;
    async fn list_config_entries(&self) -> Result<Vec<ConfigEntry>>;
    async fn delete_config_entry(&self, id: ConfigEntryId) -> Result<bool>;

    /// Current status of a step, the cheap query used by tail sessions.
    async fn step_status(&self, job_id: JobId, step_id: StepId) -> Result<Option<Status>> {
        Ok(self.get_step(job_id, step_id).await?.map(|s| s.status))
    }
}
