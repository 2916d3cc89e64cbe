//! Request and response shapes of the orchestration facade.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{ConfigRefs, HostGroups, Job, JobId, Step, StepHistory};
use crate::workspace::JobSource;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source: JobSource,
    #[serde(default)]
    pub host_groups: HostGroups,
    #[serde(default)]
    pub global_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_vars: String,
    #[serde(default)]
    pub cli_args: String,
    #[serde(default)]
    pub use_config: bool,
    #[serde(default)]
    pub config_refs: ConfigRefs,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub cron_expr: String,
    /// Falls back to the configured default.
    #[serde(default)]
    pub max_history_keep: Option<i64>,
}

/// Patch of a job definition. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub host_groups: Option<HostGroups>,
    pub global_vars: Option<BTreeMap<String, String>>,
    pub extra_vars: Option<String>,
    pub cli_args: Option<String>,
    pub use_config: Option<bool>,
    pub config_refs: Option<ConfigRefs>,
    pub is_recurring: Option<bool>,
    pub cron_expr: Option<String>,
    pub max_history_keep: Option<i64>,
}

/// A job with its steps.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartAccepted {
    pub job_id: JobId,
    pub message: &'static str,
}

/// Archived log of one step of one run.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryLog {
    #[serde(flatten)]
    pub step: StepHistory,
    pub content: String,
}
