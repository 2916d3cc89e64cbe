//! Log file layout under the configured log root.
//!
//! Every step execution writes to
//! `<log_root>/<job_id>/<step_id>/<run_id>/<entry>.log`, so re-runs of the
//! same step never share a file.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use uuid::Uuid;

use crate::model::{JobId, StepId};

/// A fresh, sortable run identifier: timestamp plus a random suffix.
pub fn new_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S%3f"), &suffix[..8])
}

/// Turn an entry name into a single safe path component.
fn file_stem(entry_name: &str) -> String {
    let cleaned: String = entry_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "entry".to_string(),
        _ => cleaned,
    }
}

#[derive(Debug, Clone)]
pub struct LogLayout {
    root: PathBuf,
}

impl LogLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, job_id: JobId, step_id: StepId, run_id: &str) -> PathBuf {
        self.root
            .join(job_id.to_string())
            .join(step_id.to_string())
            .join(run_id)
    }

    pub fn log_file(&self, job_id: JobId, step_id: StepId, run_id: &str, entry_name: &str) -> PathBuf {
        self.run_dir(job_id, step_id, run_id)
            .join(format!("{}.log", file_stem(entry_name)))
    }

    /// Remove the run directory holding `log_path`.
    ///
    /// Paths outside the log root are left alone and reported as `false`.
    /// A directory that is already gone counts as removed.
    pub async fn remove_run_log(&self, log_path: &Path) -> io::Result<bool> {
        let Some(run_dir) = log_path.parent() else {
            return Ok(false);
        };
        if !self.is_inside_root(run_dir).await {
            tracing::warn!(path = %log_path.display(), "refusing to delete log outside log root");
            return Ok(false);
        }
        match fs::remove_dir_all(run_dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Remove every log of a job.
    pub async fn remove_job_logs(&self, job_id: JobId) -> io::Result<()> {
        match fs::remove_dir_all(self.root.join(job_id.to_string())).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run directories sit exactly three levels below the root.
    async fn is_inside_root(&self, dir: &Path) -> bool {
        let Ok(root) = fs::canonicalize(&self.root).await else {
            return false;
        };
        // The run dir may already be gone; resolve through its parent.
        let resolved = match fs::canonicalize(dir).await {
            Ok(d) => d,
            Err(_) => {
                let (Some(parent), Some(name)) = (dir.parent(), dir.file_name()) else {
                    return false;
                };
                match fs::canonicalize(parent).await {
                    Ok(parent) => parent.join(name),
                    Err(_) => return false,
                }
            }
        };
        match resolved.strip_prefix(&root) {
            Ok(rel) => rel.components().count() == 3,
            Err(_) => false,
        }
    }
}
