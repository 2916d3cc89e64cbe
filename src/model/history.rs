//! Immutable snapshots of finished runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HistoryId, JobId, Status, StepId};

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduled,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Trigger::Manual),
            "scheduled" => Ok(Trigger::Scheduled),
            other => Err(format!("unknown trigger '{other}'")),
        }
    }
}

/// A finished run of a job.
#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub id: HistoryId,
    pub job_id: JobId,
    pub run_id: String,
    pub status: Status,
    pub total_duration_ms: i64,
    pub trigger: Trigger,
    pub created_at: DateTime<Utc>,
}

/// One step of an archived run.
#[derive(Debug, Clone, Serialize)]
pub struct StepHistory {
    pub id: i64,
    pub history_id: HistoryId,
    pub job_id: JobId,
    pub step_id: StepId,
    pub label: String,
    pub status: Status,
    pub log_path: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// A history row with its step rows.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryDetail {
    #[serde(flatten)]
    pub history: History,
    pub steps: Vec<StepHistory>,
}

#[derive(Debug, Clone)]
pub struct NewHistory {
    pub job_id: JobId,
    pub run_id: String,
    pub status: Status,
    pub total_duration_ms: i64,
    pub trigger: Trigger,
    pub steps: Vec<NewStepHistory>,
}

#[derive(Debug, Clone)]
pub struct NewStepHistory {
    pub step_id: StepId,
    pub label: String,
    pub status: Status,
    pub log_path: Option<String>,
    pub duration_ms: i64,
}
