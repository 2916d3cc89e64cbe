//! Orchestration facade: validation, persistence, and the calls into the
//! executor, scheduler and tailer that each mutation implies.

pub mod wire;

pub use self::wire::{CreateJobRequest, HistoryLog, JobView, StartAccepted, UpdateJobRequest};

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::PilotConfig;
use crate::error::{Error, Result};
use crate::executor::{Executor, RunHandle};
use crate::logs::LogLayout;
use crate::model::{
    ConfigEntry, ConfigEntryId, ConfigRefs, HistoryDetail, HistoryId, History, Job, JobFilter,
    JobId, JobKind, JobUpdate, NewConfigEntry, NewJob, Page, PageRequest, Status, StepId, Trigger,
};
use crate::scheduler::{self, LoadReport, RecurrenceScheduler};
use crate::storage::JobRepository;
use crate::tail::{LogSubscription, LogTailer};
use crate::workspace::{self, Workspace};

pub struct Orchestrator {
    repo: Arc<dyn JobRepository>,
    executor: Executor,
    scheduler: Arc<RecurrenceScheduler>,
    tailer: LogTailer,
    workspace: Workspace,
    logs: LogLayout,
    config: PilotConfig,
}

impl Orchestrator {
    pub fn new(repo: Arc<dyn JobRepository>, config: PilotConfig) -> Self {
        let workspace = Workspace::new(&config.storage.workspace_root);
        let logs = LogLayout::new(&config.storage.log_root);
        let executor = Executor::new(
            repo.clone(),
            workspace.clone(),
            logs.clone(),
            config.runner.clone(),
            config.executor.clone(),
        );
        let scheduler = Arc::new(RecurrenceScheduler::new(
            repo.clone(),
            Arc::new(executor.clone()),
        ));
        let tailer = LogTailer::new(repo.clone(), config.tail.clone());
        Self {
            repo,
            executor,
            scheduler,
            tailer,
            workspace,
            logs,
            config,
        }
    }

    pub fn scheduler(&self) -> &RecurrenceScheduler {
        &self.scheduler
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Repair state left by a previous process, then arm recurring jobs.
    pub async fn startup(&self) -> Result<LoadReport> {
        self.executor.recover_interrupted().await?;
        if !self.config.scheduler.enabled {
            info!("scheduler disabled by configuration");
            return Ok(LoadReport::default());
        }
        self.scheduler.load_active().await
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    // -----------------------------------------------------------------------
    // Validation helpers
    // -----------------------------------------------------------------------

    async fn check_config_refs(&self, use_config: bool, refs: &ConfigRefs) -> Result<()> {
        if !use_config {
            return Ok(());
        }
        for (kind, id) in refs.expected() {
            match self.repo.get_config_entry(id).await? {
                Some(entry) if entry.kind == kind => {}
                Some(entry) => {
                    return Err(Error::validation(format!(
                        "config entry {id} is {}, expected {}",
                        entry.kind.as_str(),
                        kind.as_str()
                    )))
                }
                None => {
                    return Err(Error::validation(format!(
                        "config entry {id} ({}) does not exist",
                        kind.as_str()
                    )))
                }
            }
        }
        Ok(())
    }

    fn check_recurrence(is_recurring: bool, cron_expr: &str) -> Result<()> {
        if is_recurring {
            scheduler::cron::parse(cron_expr)?;
        }
        Ok(())
    }

    fn check_name(name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("job name is required"));
        }
        Ok(name.to_string())
    }

    async fn load_job(&self, id: JobId) -> Result<Job> {
        self.repo
            .get_job(id)
            .await?
            .ok_or_else(|| Error::not_found("job", id))
    }

    async fn view(&self, job: Job) -> Result<JobView> {
        let steps = self.repo.list_steps(job.id).await?;
        Ok(JobView { job, steps })
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub async fn create_job(&self, req: CreateJobRequest) -> Result<JobView> {
        let name = Self::check_name(&req.name)?;
        req.source.validate()?;
        let kind = req.source.kind();
        if kind != JobKind::Templated && req.host_groups.values().all(|hosts| hosts.is_empty()) {
            return Err(Error::validation("at least one target host is required"));
        }
        Self::check_recurrence(req.is_recurring, &req.cron_expr)?;
        self.check_config_refs(req.use_config, &req.config_refs).await?;
        if self.repo.find_job_by_name(&name).await?.is_some() {
            return Err(Error::Conflict(format!("job name '{name}' already exists")));
        }

        let job = self
            .repo
            .create_job(NewJob {
                name,
                description: req.description.clone(),
                kind,
                repo_url: req.source.repo_url(),
                host_groups: req.host_groups.clone(),
                global_vars: req.global_vars.clone(),
                extra_vars: req.extra_vars.clone(),
                cli_args: req.cli_args.clone(),
                use_config: req.use_config,
                config_refs: req.config_refs.clone(),
                is_recurring: req.is_recurring,
                cron_expr: req.cron_expr.trim().to_string(),
                max_history_keep: req
                    .max_history_keep
                    .unwrap_or(i64::from(self.config.executor.default_history_keep)),
            })
            .await?;

        let workdir = self.workspace.job_dir(job.id);
        if let Err(e) = self.prepare_workspace(&job, &req, &workdir).await {
            warn!(job_id = job.id, error = %e, "job preparation failed, rolling back");
            if let Err(cleanup) = self.repo.delete_job(job.id).await {
                warn!(job_id = job.id, error = %cleanup, "failed to remove half-created job");
            }
            if let Err(cleanup) = self.workspace.remove_job_dir(job.id).await {
                warn!(job_id = job.id, error = %cleanup, "failed to remove half-created workspace");
            }
            return Err(e);
        }

        let job = self.load_job(job.id).await?;
        self.sync_schedule(&job)?;
        info!(job_id = job.id, name = %job.name, kind = %job.kind, "job created");
        self.view(job).await
    }

    async fn prepare_workspace(&self, job: &Job, req: &CreateJobRequest, workdir: &Path) -> Result<()> {
        let steps = req.source.prepare(workdir, &self.config.runner).await?;
        if steps.is_empty() {
            return Err(Error::validation("job has no entry points"));
        }
        workspace::write_inventory(workdir, &job.host_groups).await?;
        workspace::write_global_vars(workdir, &job.global_vars).await?;
        self.repo.replace_steps(job.id, steps).await?;
        Ok(())
    }

    pub async fn update_job(&self, id: JobId, patch: UpdateJobRequest) -> Result<JobView> {
        let current = self.load_job(id).await?;
        if current.status == Status::Running {
            return Err(Error::Conflict(format!("job {id} is running")));
        }

        let name = patch.name.as_deref().map(Self::check_name).transpose()?;
        if let Some(name) = &name {
            if let Some(other) = self.repo.find_job_by_name(name).await? {
                if other.id != id {
                    return Err(Error::Conflict(format!("job name '{name}' already exists")));
                }
            }
        }
        let is_recurring = patch.is_recurring.unwrap_or(current.is_recurring);
        let cron_expr = patch
            .cron_expr
            .as_deref()
            .map(str::trim)
            .unwrap_or(current.cron_expr.as_str());
        Self::check_recurrence(is_recurring, cron_expr)?;
        let use_config = patch.use_config.unwrap_or(current.use_config);
        let refs = patch.config_refs.as_ref().unwrap_or(&current.config_refs);
        self.check_config_refs(use_config, refs).await?;

        self.repo
            .update_job(
                id,
                JobUpdate {
                    name,
                    description: patch.description.clone(),
                    host_groups: patch.host_groups.clone(),
                    global_vars: patch.global_vars.clone(),
                    extra_vars: patch.extra_vars.clone(),
                    cli_args: patch.cli_args.clone(),
                    use_config: patch.use_config,
                    config_refs: patch.config_refs.clone(),
                    is_recurring: patch.is_recurring,
                    cron_expr: patch.cron_expr.as_deref().map(|e| e.trim().to_string()),
                    max_history_keep: patch.max_history_keep,
                    ..JobUpdate::default()
                },
            )
            .await?;

        let workdir = self.workspace.job_dir(id);
        if let Some(groups) = &patch.host_groups {
            workspace::write_inventory(&workdir, groups).await?;
        }
        if let Some(vars) = &patch.global_vars {
            workspace::write_global_vars(&workdir, vars).await?;
        }

        let job = self.load_job(id).await?;
        self.sync_schedule(&job)?;
        info!(job_id = id, "job updated");
        self.view(job).await
    }

    /// Register or drop the job's trigger. Nothing is registered while the
    /// scheduler is disabled.
    fn sync_schedule(&self, job: &Job) -> Result<()> {
        if self.config.scheduler.enabled {
            self.scheduler.upsert(job)
        } else {
            self.scheduler.remove(job.id);
            Ok(())
        }
    }

    pub async fn delete_job(&self, id: JobId) -> Result<()> {
        let job = self.load_job(id).await?;
        if job.status == Status::Running {
            return Err(Error::Conflict(format!("job {id} is running")));
        }
        self.repo.delete_job(id).await?;
        self.scheduler.remove(id);
        if let Err(e) = self.logs.remove_job_logs(id).await {
            warn!(job_id = id, error = %e, "failed to remove job logs");
        }
        self.workspace.remove_job_dir(id).await?;
        info!(job_id = id, name = %job.name, "job deleted");
        Ok(())
    }

    /// Start a run. The returned handle may be dropped.
    pub async fn start_job(&self, id: JobId) -> Result<RunHandle> {
        self.executor.execute(id, Trigger::Manual).await
    }

    pub async fn stop_job(&self, id: JobId, step_id: StepId) -> Result<()> {
        self.executor.stop(id, step_id).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobView> {
        let job = self.load_job(id).await?;
        self.view(job).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter, page: PageRequest) -> Result<Page<Job>> {
        self.repo.list_jobs(filter, page).await
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    pub async fn list_history(&self, job_id: JobId, page: PageRequest) -> Result<Page<History>> {
        self.load_job(job_id).await?;
        self.repo.list_history(job_id, page).await
    }

    pub async fn get_history(&self, id: HistoryId) -> Result<HistoryDetail> {
        self.repo
            .get_history(id)
            .await?
            .ok_or_else(|| Error::not_found("history", id))
    }

    pub async fn get_history_log(&self, step_history_id: i64) -> Result<HistoryLog> {
        let step = self
            .repo
            .get_step_history(step_history_id)
            .await?
            .ok_or_else(|| Error::not_found("step history", step_history_id))?;
        let content = match step.log_path.as_deref() {
            Some(path) => {
                let bytes = tokio::fs::read(path).await?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            None => String::new(),
        };
        Ok(HistoryLog { step, content })
    }

    pub async fn delete_history(&self, id: HistoryId) -> Result<()> {
        let detail = self
            .repo
            .delete_history(id)
            .await?
            .ok_or_else(|| Error::not_found("history", id))?;
        for step in &detail.steps {
            if let Some(path) = step.log_path.as_deref() {
                if let Err(e) = self.logs.remove_run_log(Path::new(path)).await {
                    warn!(history_id = id, path, error = %e, "failed to remove archived log");
                }
            }
        }
        info!(history_id = id, job_id = detail.history.job_id, "history deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Logs
    // -----------------------------------------------------------------------

    pub async fn stream_log(&self, job_id: JobId, step_id: StepId) -> Result<LogSubscription> {
        self.repo
            .get_step(job_id, step_id)
            .await?
            .ok_or_else(|| Error::not_found("step", step_id))?;
        Ok(self.tailer.subscribe(job_id, step_id))
    }

    // -----------------------------------------------------------------------
    // Config entries
    // -----------------------------------------------------------------------

    pub async fn create_config_entry(&self, entry: NewConfigEntry) -> Result<ConfigEntry> {
        if entry.name.trim().is_empty() {
            return Err(Error::validation("config entry name is required"));
        }
        self.repo
            .create_config_entry(NewConfigEntry {
                name: entry.name.trim().to_string(),
                ..entry
            })
            .await
    }

    pub async fn list_config_entries(&self) -> Result<Vec<ConfigEntry>> {
        self.repo.list_config_entries().await
    }

    pub async fn get_config_entry(&self, id: ConfigEntryId) -> Result<ConfigEntry> {
        self.repo
            .get_config_entry(id)
            .await?
            .ok_or_else(|| Error::not_found("config entry", id))
    }

    pub async fn delete_config_entry(&self, id: ConfigEntryId) -> Result<()> {
        if !self.repo.delete_config_entry(id).await? {
            return Err(Error::not_found("config entry", id));
        }
        Ok(())
    }
}
