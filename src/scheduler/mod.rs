//! Recurrence Scheduler: job id -> fire handle, kept in step with the
//! repository by explicit `upsert` / `remove` calls.

pub mod cron;

pub use self::cron::PlannedFire;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use ::cron::Schedule as CronSchedule;
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{Job, JobId};
use crate::storage::JobRepository;

/// What a fired schedule invokes.
#[async_trait]
pub trait FireTarget: Send + Sync {
    async fn fire(&self, job_id: JobId) -> Result<()>;
}

struct FireHandle {
    expr: String,
    schedule: CronSchedule,
    task: JoinHandle<()>,
}

/// Outcome of the startup load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub scheduled: usize,
    pub rejected: usize,
}

pub struct RecurrenceScheduler {
    repo: Arc<dyn JobRepository>,
    target: Arc<dyn FireTarget>,
    handles: Mutex<HashMap<JobId, FireHandle>>,
}

impl RecurrenceScheduler {
    pub fn new(repo: Arc<dyn JobRepository>, target: Arc<dyn FireTarget>) -> Self {
        Self {
            repo,
            target,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<JobId, FireHandle>> {
        // A poisoned registry still holds valid handles.
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register, replace or drop the fire handle of `job`.
    ///
    /// The expression is parsed before the registry is touched, so a bad
    /// expression leaves any existing handle in place.
    pub fn upsert(&self, job: &Job) -> Result<()> {
        if !job.wants_schedule() {
            self.remove(job.id);
            return Ok(());
        }
        let schedule = cron::parse(&job.cron_expr)?;

        let task = tokio::spawn(fire_loop(job.id, schedule.clone(), self.target.clone()));
        let previous = self.registry().insert(
            job.id,
            FireHandle {
                expr: job.cron_expr.clone(),
                schedule,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
        info!(job_id = job.id, expr = %job.cron_expr, "recurrence armed");
        Ok(())
    }

    /// Cancel and forget the handle of `job_id`. Returns whether one existed.
    pub fn remove(&self, job_id: JobId) -> bool {
        match self.registry().remove(&job_id) {
            Some(handle) => {
                handle.task.abort();
                info!(job_id, "recurrence disarmed");
                true
            }
            None => false,
        }
    }

    /// Arm every recurring job in the repository. One bad expression is
    /// logged and skipped.
    pub async fn load_active(&self) -> Result<LoadReport> {
        let jobs = self.repo.list_recurring_jobs().await?;
        let mut report = LoadReport::default();
        for job in &jobs {
            match self.upsert(job) {
                Ok(()) => report.scheduled += 1,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "skipping recurring job");
                    report.rejected += 1;
                }
            }
        }
        info!(scheduled = report.scheduled, rejected = report.rejected, "recurring jobs loaded");
        Ok(report)
    }

    /// Upcoming fires of every registered job within `hours`.
    pub fn preview(&self, hours: u64) -> Vec<PlannedFire> {
        let now = Utc::now();
        let registry = self.registry();
        let mut preview: Vec<PlannedFire> = registry
            .iter()
            .flat_map(|(job_id, handle)| {
                cron::upcoming_within(&handle.schedule, now, hours)
                    .into_iter()
                    .map(|at| PlannedFire {
                        at,
                        job_id: *job_id,
                        expr: handle.expr.clone(),
                    })
            })
            .collect();
        preview.sort_by(|a, b| a.at.cmp(&b.at).then(a.job_id.cmp(&b.job_id)));
        preview
    }

    /// Cancel every handle.
    pub fn shutdown(&self) {
        let mut registry = self.registry();
        for (_, handle) in registry.drain() {
            handle.task.abort();
        }
        info!("scheduler stopped");
    }

    pub fn is_scheduled(&self, job_id: JobId) -> bool {
        self.registry().contains_key(&job_id)
    }

    pub fn handle_count(&self) -> usize {
        self.registry().len()
    }
}

impl Drop for RecurrenceScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.registry().drain() {
            handle.task.abort();
        }
    }
}

async fn fire_loop(job_id: JobId, schedule: CronSchedule, target: Arc<dyn FireTarget>) {
    let mut last_fired = Utc::now();
    loop {
        let now = Utc::now().max(last_fired);
        let Some(next) = schedule.after(&now).next() else {
            info!(job_id, "recurrence has no further fire times");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
        last_fired = next;

        info!(job_id, at = %next, "recurrence fired");
        match AssertUnwindSafe(target.fire(job_id)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job_id, error = %e, "scheduled run was not started"),
            Err(_) => warn!(job_id, "scheduled run panicked while starting"),
        }
    }
}
