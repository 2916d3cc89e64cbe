use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use taskpilot::config::{LoggingConfig, PilotConfig};
use taskpilot::model::{JobFilter, PageRequest, Status};
use taskpilot::scheduler::cron;
use taskpilot::storage::{self, JobRepository, SqliteRepository};

#[derive(Parser)]
#[command(
    name = "taskpilot",
    about = "Playbook job orchestration with live log streaming and cron re-triggering",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (overrides TASKPILOT_CONFIG)
    #[arg(long, global = true, env = "TASKPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides storage.db_path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler)
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Inspect stored jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Inspect run history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Inspect recurring jobs
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs
    List {
        /// Name substring
        #[arg(long)]
        name: Option<String>,

        /// Status filter (waiting, running, succeeded, failed)
        #[arg(long)]
        status: Option<Status>,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "20")]
        size: u32,
    },

    /// Show one job with its steps
    Show {
        id: i64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List the archived runs of a job
    List {
        job_id: i64,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "20")]
        size: u32,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<PilotConfig> {
    let mut config = match &cli.config {
        Some(path) => PilotConfig::load(path)?,
        None => PilotConfig::load_or_default(),
    };
    if let Some(db) = &cli.db {
        config.storage.db_path = db.clone();
    }
    Ok(config)
}

fn open_repo(config: &PilotConfig) -> Result<Arc<SqliteRepository>> {
    let pool = storage::open_pool(&config.storage.db_path).with_context(|| {
        format!("failed to open database {}", config.storage.db_path.display())
    })?;
    Ok(Arc::new(SqliteRepository::new(pool)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting taskpilot daemon");
            taskpilot::serve(config).await?;
        }
        Commands::Jobs { action } => {
            let repo = open_repo(&config)?;
            match action {
                JobsAction::List {
                    name,
                    status,
                    page,
                    size,
                } => {
                    let filter = JobFilter {
                        name,
                        status,
                        ..JobFilter::default()
                    };
                    let jobs = repo.list_jobs(&filter, PageRequest::new(page, size)).await?;
                    if jobs.items.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<6} | {:<24} | {:<9} | {:<10} | Schedule",
                            "ID", "Name", "Kind", "Status"
                        );
                        println!("{:-<6}-|-{:-<24}-|-{:-<9}-|-{:-<10}-|-{:-<15}", "", "", "", "", "");
                        for job in &jobs.items {
                            let schedule = if job.is_recurring { job.cron_expr.as_str() } else { "-" };
                            println!(
                                "{:<6} | {:<24} | {:<9} | {:<10} | {}",
                                job.id, job.name, job.kind, job.status, schedule
                            );
                        }
                        println!("({} of {} jobs, page {})", jobs.items.len(), jobs.total, jobs.page);
                    }
                }
                JobsAction::Show { id, json } => {
                    let job = repo
                        .get_job(id)
                        .await?
                        .with_context(|| format!("job {id} not found"))?;
                    let steps = repo.list_steps(id).await?;
                    if json {
                        let view = taskpilot::service::JobView { job, steps };
                        println!("{}", serde_json::to_string_pretty(&view)?);
                    } else {
                        println!("Job {}: {} ({})", job.id, job.name, job.kind);
                        println!("Status:   {}", job.status);
                        if !job.error_msg.is_empty() {
                            println!("Error:    {}", job.error_msg);
                        }
                        if job.is_recurring {
                            println!("Schedule: {}", job.cron_expr);
                        }
                        println!("Duration: {} ms", job.total_duration_ms);
                        println!("\nSteps:");
                        for step in steps {
                            let exit = step
                                .exit_code
                                .map(|c| c.to_string())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                " {:>3}. {:<30} {:<10} exit {:<4} {} ms",
                                step.position, step.entry_name, step.status, exit, step.duration_ms
                            );
                        }
                    }
                }
            }
        }
        Commands::History { action } => {
            let repo = open_repo(&config)?;
            match action {
                HistoryAction::List { job_id, page, size } => {
                    let runs = repo.list_history(job_id, PageRequest::new(page, size)).await?;
                    if runs.items.is_empty() {
                        println!("No history for job {}.", job_id);
                    } else {
                        println!("{:<6} | {:<36} | {:<10} | {:<9} | Finished", "ID", "Run", "Status", "Trigger");
                        println!("{:-<6}-|-{:-<36}-|-{:-<10}-|-{:-<9}-|-{:-<20}", "", "", "", "", "");
                        for run in &runs.items {
                            println!(
                                "{:<6} | {:<36} | {:<10} | {:<9} | {}",
                                run.id,
                                run.run_id,
                                run.status,
                                run.trigger.as_str(),
                                run.created_at.to_rfc3339()
                            );
                        }
                    }
                }
            }
        }
        Commands::Schedule { action } => match action {
            ScheduleAction::DryRun { hours } => {
                let repo = open_repo(&config)?;
                let jobs = repo.list_recurring_jobs().await?;
                let preview = cron::plan(jobs.iter().map(|j| (j.id, j.cron_expr.as_str())), hours);
                if preview.is_empty() {
                    println!("No runs scheduled in next {} hours.", hours);
                } else {
                    println!("Upcoming runs (next {} hours):", hours);
                    for fire in preview {
                        let name = jobs
                            .iter()
                            .find(|j| j.id == fire.job_id)
                            .map(|j| j.name.as_str())
                            .unwrap_or("?");
                        println!("{} : {} ({})", fire.at.to_rfc3339(), name, fire.expr);
                    }
                }
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        },
    }

    Ok(())
}
