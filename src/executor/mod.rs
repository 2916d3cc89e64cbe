//! Job Executor: runs a job's steps in order and archives the run.

pub mod overrides;

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ExecutorConfig, RunnerConfig};
use crate::error::{Error, Result};
use crate::logs::{self, LogLayout};
use crate::model::{
    Job, JobId, JobKind, JobUpdate, NewHistory, NewStepHistory, Status, Step, StepId, StepUpdate,
    Trigger,
};
use crate::runner::{self, LogHeader, LogSink, StepCommand, StepOutcome};
use crate::scheduler::FireTarget;
use crate::storage::JobRepository;
use crate::workspace::{Workspace, INVENTORY_FILE};

pub const SKIPPED: &str = "skipped after an earlier step failed";
pub const INTERRUPTED: &str = "interrupted by restart";
const STALE_STOP: &str = "stopped while not running in this process";

/// A started run. Awaiting it is optional; the run proceeds either way.
pub struct RunHandle {
    pub job_id: JobId,
    join: JoinHandle<()>,
}

impl RunHandle {
    /// Wait for the run, including its history write, to finish.
    pub async fn wait(self) {
        if let Err(e) = self.join.await {
            warn!(job_id = self.job_id, error = %e, "run task ended abnormally");
        }
    }
}

struct Inner {
    repo: Arc<dyn JobRepository>,
    workspace: Workspace,
    logs: LogLayout,
    runner: RunnerConfig,
    config: ExecutorConfig,
    /// Cancellation handles of steps running in this process.
    running_steps: Mutex<HashMap<StepId, CancellationToken>>,
    /// Jobs with a run task in this process.
    active_jobs: Mutex<HashSet<JobId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        workspace: Workspace,
        logs: LogLayout,
        runner: RunnerConfig,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                workspace,
                logs,
                runner,
                config,
                running_steps: Mutex::new(HashMap::new()),
                active_jobs: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        lock(&self.inner.active_jobs).contains(&job_id)
    }

    /// Mark the job running and start its steps in the background.
    pub async fn execute(&self, job_id: JobId, trigger: Trigger) -> Result<RunHandle> {
        let repo = &self.inner.repo;
        let job = repo
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("job", job_id))?;
        let steps = repo.list_steps(job_id).await?;
        if steps.is_empty() {
            return Err(Error::not_found("steps of job", job_id));
        }
        if !repo.claim_job(job_id).await? {
            return Err(Error::Conflict(format!("job {job_id} is already running")));
        }
        repo.reset_steps(job_id).await?;
        lock(&self.inner.active_jobs).insert(job_id);

        info!(job_id, name = %job.name, steps = steps.len(), trigger = trigger.as_str(), "job started");

        let this = self.clone();
        let join = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(this.run(job, steps, trigger)).catch_unwind().await;
            let fault = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic)),
            };
            if let Some(message) = fault {
                error!(job_id, error = %message, "job run aborted");
                this.fail_run(job_id, &message).await;
            }
            lock(&this.inner.active_jobs).remove(&job_id);
        });
        Ok(RunHandle { job_id, join })
    }

    /// Stop one step of a job.
    ///
    /// A step running here is cancelled and recorded by its run. A step
    /// left `running` with nobody driving it is marked failed directly.
    pub async fn stop(&self, job_id: JobId, step_id: StepId) -> Result<()> {
        let repo = &self.inner.repo;
        let step = repo
            .get_step(job_id, step_id)
            .await?
            .ok_or_else(|| Error::not_found("step", step_id))?;

        if let Some(token) = lock(&self.inner.running_steps).get(&step_id) {
            info!(job_id, step_id, "cancelling step");
            token.cancel();
            return Ok(());
        }

        if step.status == Status::Running {
            warn!(job_id, step_id, "repairing stale running step");
            repo.update_step(
                step_id,
                StepUpdate::finished(Status::Failed, Utc::now(), 0, None, STALE_STOP),
            )
            .await?;
            if !self.is_active(job_id) {
                let job = repo.get_job(job_id).await?;
                if job.map(|j| j.status == Status::Running).unwrap_or(false) {
                    repo.update_job(job_id, JobUpdate::failed(STALE_STOP)).await?;
                }
            }
        }
        Ok(())
    }

    /// Fail whatever a previous process left running.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let jobs = self.inner.repo.recover_interrupted(INTERRUPTED).await?;
        if jobs > 0 {
            warn!(jobs, "marked interrupted jobs as failed");
        }
        Ok(jobs)
    }

    fn history_keep(&self, job: &Job) -> usize {
        if job.max_history_keep > 0 {
            job.max_history_keep as usize
        } else {
            self.inner.config.default_history_keep.max(1) as usize
        }
    }

    async fn run(&self, job: Job, steps: Vec<Step>, trigger: Trigger) -> Result<()> {
        let inner = &self.inner;
        let workdir = inner.workspace.job_dir(job.id);
        let effective = overrides::apply(inner.repo.as_ref(), &job, &workdir).await?;

        let mut archived = Vec::with_capacity(steps.len());
        let mut failures = 0usize;
        let mut total_ms: i64 = 0;

        for step in &steps {
            if inner.config.fail_fast && failures > 0 {
                inner
                    .repo
                    .update_step(
                        step.id,
                        StepUpdate::finished(Status::Failed, Utc::now(), 0, None, SKIPPED),
                    )
                    .await?;
                info!(job_id = job.id, step_id = step.id, "step skipped");
                archived.push(NewStepHistory {
                    step_id: step.id,
                    label: step.entry_name.clone(),
                    status: Status::Failed,
                    log_path: None,
                    duration_ms: 0,
                });
                failures += 1;
                continue;
            }

            let record = self.run_step(&job, step, &workdir, &effective).await?;
            if record.status == Status::Failed {
                failures += 1;
            }
            total_ms += record.duration_ms;
            archived.push(record);
        }

        let status = if failures == 0 {
            Status::Succeeded
        } else {
            Status::Failed
        };
        let error_msg = if failures == 0 {
            String::new()
        } else {
            format!("{failures} of {} steps failed", steps.len())
        };
        inner
            .repo
            .update_job(
                job.id,
                JobUpdate {
                    status: Some(status),
                    error_msg: Some(error_msg),
                    total_duration_ms: Some(total_ms),
                    ..JobUpdate::default()
                },
            )
            .await?;
        info!(job_id = job.id, %status, total_ms, failures, "job finished");

        let history = inner
            .repo
            .create_history(NewHistory {
                job_id: job.id,
                run_id: format!("{}-{}", job.id, Utc::now().timestamp_millis()),
                status,
                total_duration_ms: total_ms,
                trigger,
                steps: archived,
            })
            .await?;

        let removed = inner.repo.prune_history(job.id, self.history_keep(&job)).await?;
        for row in removed {
            if let Some(path) = row.log_path.as_deref() {
                if let Err(e) = inner.logs.remove_run_log(Path::new(path)).await {
                    warn!(job_id = job.id, path, error = %e, "failed to remove pruned log");
                }
            }
        }
        info!(job_id = job.id, history_id = history.history.id, "run archived");
        Ok(())
    }

    /// Run one step and record its outcome; returns the archive row.
    async fn run_step(
        &self,
        job: &Job,
        step: &Step,
        workdir: &Path,
        effective: &overrides::Effective,
    ) -> Result<NewStepHistory> {
        let inner = &self.inner;
        let run_id = logs::new_run_id();
        let log_path = inner.logs.log_file(job.id, step.id, &run_id, &step.entry_name);
        let log_text = log_path.display().to_string();

        inner
            .repo
            .update_step(step.id, StepUpdate::started(log_text.clone(), Utc::now()))
            .await?;
        info!(job_id = job.id, step_id = step.id, %run_id, entry = %step.entry_name, "step started");

        let entry = Path::new(&step.entry_path);
        let command = match job.kind {
            JobKind::Templated => StepCommand::script(&inner.runner, workdir, entry),
            JobKind::Manual | JobKind::Imported => StepCommand::playbook(
                &inner.runner,
                workdir,
                entry,
                &effective.extra_vars,
                &effective.cli_args,
            ),
        };
        let header = LogHeader {
            command: command.display(),
            workdir: workdir.display().to_string(),
            inventory: (job.kind != JobKind::Templated).then(|| INVENTORY_FILE.to_string()),
            extra_vars: effective.extra_vars.clone(),
        };

        let token = CancellationToken::new();
        lock(&inner.running_steps).insert(step.id, token.clone());
        let started = Instant::now();

        let outcome = if tokio::fs::try_exists(entry).await.unwrap_or(false) {
            runner::run_step(&command, &log_path, &header, token).await
        } else {
            missing_entry(&log_path, &header, &step.entry_path).await
        };
        lock(&inner.running_steps).remove(&step.id);

        let outcome = outcome.unwrap_or_else(|e| StepOutcome {
            exit_code: -1,
            error: Some(e.to_string()),
        });
        let duration_ms = started.elapsed().as_millis() as i64;
        let status = if outcome.succeeded() {
            Status::Succeeded
        } else {
            Status::Failed
        };

        inner
            .repo
            .update_step(
                step.id,
                StepUpdate::finished(
                    status,
                    Utc::now(),
                    duration_ms,
                    Some(outcome.exit_code),
                    outcome.error.clone().unwrap_or_default(),
                ),
            )
            .await?;
        info!(
            job_id = job.id,
            step_id = step.id,
            %status,
            exit_code = outcome.exit_code,
            duration_ms,
            "step finished"
        );

        Ok(NewStepHistory {
            step_id: step.id,
            label: step.entry_name.clone(),
            status,
            log_path: Some(log_text),
            duration_ms,
        })
    }

    /// Record an orchestration fault against the job and its unfinished steps.
    async fn fail_run(&self, job_id: JobId, message: &str) {
        let repo = &self.inner.repo;
        if let Ok(steps) = repo.list_steps(job_id).await {
            for step in steps.iter().filter(|s| !s.status.is_terminal()) {
                let update = StepUpdate::finished(Status::Failed, Utc::now(), 0, None, message);
                if let Err(e) = repo.update_step(step.id, update).await {
                    warn!(job_id, step_id = step.id, error = %e, "failed to record step fault");
                }
            }
        }
        if let Err(e) = repo.update_job(job_id, JobUpdate::failed(message)).await {
            warn!(job_id, error = %e, "failed to record job fault");
        }
    }
}

/// Write a log for a step whose entry point vanished, without launching anything.
async fn missing_entry(log_path: &Path, header: &LogHeader, entry: &str) -> Result<StepOutcome> {
    let sink = LogSink::create(log_path).await?;
    sink.write_header(header).await?;
    let outcome = StepOutcome {
        exit_code: -1,
        error: Some(format!("entry point {entry} does not exist")),
    };
    sink.write_footer(outcome.exit_code, outcome.error.as_deref()).await?;
    Ok(outcome)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("run panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("run panicked: {s}")
    } else {
        "run panicked".to_string()
    }
}

#[async_trait]
impl FireTarget for Executor {
    async fn fire(&self, job_id: JobId) -> Result<()> {
        self.execute(job_id, Trigger::Scheduled).await.map(|_| ())
    }
}
