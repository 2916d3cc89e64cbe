//! Steps: one external command of a job.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{JobId, Status, StepId};

/// A stored step. `log_path` is assigned when the step starts running.
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub id: StepId,
    pub job_id: JobId,
    pub position: i64,
    pub entry_name: String,
    pub entry_path: String,
    pub log_path: Option<String>,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub exit_code: Option<i32>,
    pub error_msg: String,
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub entry_name: String,
    pub entry_path: String,
}

/// Field-level partial update of a step row.
///
/// The outer `Option` selects the column, the inner one (where present)
/// allows writing NULL.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub status: Option<Status>,
    pub log_path: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<Option<i32>>,
    pub error_msg: Option<String>,
}

impl StepUpdate {
    /// Transition into `running` for a fresh run.
    pub fn started(log_path: String, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(Status::Running),
            log_path: Some(Some(log_path)),
            started_at: Some(Some(at)),
            finished_at: Some(None),
            duration_ms: Some(0),
            exit_code: Some(None),
            error_msg: Some(String::new()),
        }
    }

    /// Transition into a terminal state.
    pub fn finished(
        status: Status,
        at: DateTime<Utc>,
        duration_ms: i64,
        exit_code: Option<i32>,
        error_msg: impl Into<String>,
    ) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(Some(at)),
            duration_ms: Some(duration_ms),
            exit_code: Some(exit_code),
            error_msg: Some(error_msg.into()),
            ..Self::default()
        }
    }

    /// Back to `waiting` with every per-run field cleared.
    pub fn reset() -> Self {
        Self {
            status: Some(Status::Waiting),
            log_path: Some(None),
            started_at: Some(None),
            finished_at: Some(None),
            duration_ms: Some(0),
            exit_code: Some(None),
            error_msg: Some(String::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.log_path.is_none()
            && self.started_at.is_none()
            && self.finished_at.is_none()
            && self.duration_ms.is_none()
            && self.exit_code.is_none()
            && self.error_msg.is_none()
    }
}
