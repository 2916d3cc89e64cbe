//! Job definitions and the centrally managed configuration they may reference.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConfigEntryId, JobId, Status};

/// How a job obtained its entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Playbooks uploaded with the job.
    Manual,
    /// Playbooks fetched from a git repository.
    Imported,
    /// A single deployment script rendered from parameters.
    Templated,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Manual => "manual",
            JobKind::Imported => "imported",
            JobKind::Templated => "templated",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(JobKind::Manual),
            "imported" => Ok(JobKind::Imported),
            "templated" => Ok(JobKind::Templated),
            other => Err(format!("unknown job kind '{other}'")),
        }
    }
}

/// A target host as referenced from a host group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRef {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

/// Named groups of hosts, rendered as inventory sections.
pub type HostGroups = BTreeMap<String, Vec<HostRef>>;

/// References to centrally managed configuration entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigRefs {
    pub inventory: Option<ConfigEntryId>,
    pub global_vars: Option<ConfigEntryId>,
    pub extra_vars: Option<ConfigEntryId>,
    pub cli_args: Option<ConfigEntryId>,
}

impl ConfigRefs {
    /// Each populated reference paired with the kind it must point at.
    pub fn expected(&self) -> Vec<(ConfigKind, ConfigEntryId)> {
        [
            (ConfigKind::Inventory, self.inventory),
            (ConfigKind::GlobalVars, self.global_vars),
            (ConfigKind::ExtraVars, self.extra_vars),
            (ConfigKind::CliArgs, self.cli_args),
        ]
        .into_iter()
        .filter_map(|(kind, id)| id.map(|id| (kind, id)))
        .collect()
    }
}

/// A stored job definition.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: String,
    pub kind: JobKind,
    pub repo_url: Option<String>,
    pub host_groups: HostGroups,
    pub global_vars: BTreeMap<String, String>,
    pub extra_vars: String,
    pub cli_args: String,
    pub use_config: bool,
    pub config_refs: ConfigRefs,
    pub is_recurring: bool,
    pub cron_expr: String,
    pub max_history_keep: i64,
    pub status: Status,
    pub error_msg: String,
    pub step_count: i64,
    pub total_duration_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether the scheduler should hold a fire handle for this job.
    pub fn wants_schedule(&self) -> bool {
        self.is_recurring && !self.cron_expr.trim().is_empty()
    }
}

/// Insert payload for a job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub description: String,
    pub kind: JobKind,
    pub repo_url: Option<String>,
    pub host_groups: HostGroups,
    pub global_vars: BTreeMap<String, String>,
    pub extra_vars: String,
    pub cli_args: String,
    pub use_config: bool,
    pub config_refs: ConfigRefs,
    pub is_recurring: bool,
    pub cron_expr: String,
    pub max_history_keep: i64,
}

/// Field-level partial update of a job row. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub repo_url: Option<String>,
    pub host_groups: Option<HostGroups>,
    pub global_vars: Option<BTreeMap<String, String>>,
    pub extra_vars: Option<String>,
    pub cli_args: Option<String>,
    pub use_config: Option<bool>,
    pub config_refs: Option<ConfigRefs>,
    pub is_recurring: Option<bool>,
    pub cron_expr: Option<String>,
    pub max_history_keep: Option<i64>,
    pub status: Option<Status>,
    pub error_msg: Option<String>,
    pub step_count: Option<i64>,
    pub total_duration_ms: Option<i64>,
}

impl JobUpdate {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(error_msg: impl Into<String>) -> Self {
        Self {
            status: Some(Status::Failed),
            error_msg: Some(error_msg.into()),
            ..Self::default()
        }
    }
}

/// Listing filter. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    /// Case-sensitive substring of the job name.
    pub name: Option<String>,
    pub kind: Option<JobKind>,
    pub status: Option<Status>,
    pub recurring: Option<bool>,
}

/// What a central configuration entry substitutes at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    Inventory,
    GlobalVars,
    ExtraVars,
    CliArgs,
}

impl ConfigKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::Inventory => "inventory",
            ConfigKind::GlobalVars => "global_vars",
            ConfigKind::ExtraVars => "extra_vars",
            ConfigKind::CliArgs => "cli_args",
        }
    }
}

impl std::str::FromStr for ConfigKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inventory" => Ok(ConfigKind::Inventory),
            "global_vars" => Ok(ConfigKind::GlobalVars),
            "extra_vars" => Ok(ConfigKind::ExtraVars),
            "cli_args" => Ok(ConfigKind::CliArgs),
            other => Err(format!("unknown config kind '{other}'")),
        }
    }
}

/// Centrally managed inventory / variables / arguments.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigEntry {
    pub id: ConfigEntryId,
    pub name: String,
    pub kind: ConfigKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewConfigEntry {
    pub name: String,
    pub kind: ConfigKind,
    pub content: String,
}
