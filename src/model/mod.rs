//! Records exchanged between the engine and its job repository.

pub mod history;
pub mod job;
pub mod step;

pub use self::history::{History, HistoryDetail, NewHistory, NewStepHistory, StepHistory, Trigger};
pub use self::job::{
    ConfigEntry, ConfigKind, ConfigRefs, HostGroups, HostRef, Job, JobFilter, JobKind, JobUpdate,
    NewConfigEntry, NewJob,
};
pub use self::step::{NewStep, Step, StepUpdate};

use serde::{Deserialize, Serialize};

pub type JobId = i64;
pub type StepId = i64;
pub type HistoryId = i64;
pub type ConfigEntryId = i64;

/// Lifecycle shared by jobs and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Waiting,
    Running,
    Succeeded,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
        }
    }

    /// Succeeded and failed never transition again within one run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Status::Waiting),
            "running" => Ok(Status::Running),
            "succeeded" => Ok(Status::Succeeded),
            "failed" => Ok(Status::Failed),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// 1-based page selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, size: 20 }
    }
}

impl PageRequest {
    pub const MAX_SIZE: u32 = 500;

    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.size.clamp(1, Self::MAX_SIZE))
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * self.limit()
    }
}

/// One page of results plus the total count across all pages.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            size: self.size,
        }
    }
}
