//! Per-job working directories and how each job kind fills them.

pub mod git;
pub mod inventory;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::model::{HostGroups, JobId, JobKind, NewStep};

pub const INVENTORY_FILE: &str = "hosts";
pub const VARS_FILE: &str = "vars/all.yml";
pub const TEMPLATE_PARAMS_FILE: &str = "config.json";

/// An uploaded playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub name: String,
    pub content: String,
}

fn default_script_name() -> String {
    "deploy.sh".to_string()
}

/// Where a job's entry points come from. Chosen once, at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSource {
    Manual {
        playbooks: Vec<Playbook>,
    },
    Imported {
        repo_url: String,
        /// Relative playbook paths. Empty means discover them.
        #[serde(default)]
        entrypoints: Vec<String>,
    },
    Templated {
        #[serde(default = "default_script_name")]
        script_name: String,
        script: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl JobSource {
    pub fn kind(&self) -> JobKind {
        match self {
            JobSource::Manual { .. } => JobKind::Manual,
            JobSource::Imported { .. } => JobKind::Imported,
            JobSource::Templated { .. } => JobKind::Templated,
        }
    }

    pub fn repo_url(&self) -> Option<String> {
        match self {
            JobSource::Imported { repo_url, .. } => Some(repo_url.clone()),
            _ => None,
        }
    }

    /// Cheap checks that need no filesystem access.
    pub fn validate(&self) -> Result<()> {
        match self {
            JobSource::Manual { playbooks } => {
                if playbooks.is_empty() {
                    return Err(Error::validation("a manual job needs at least one playbook"));
                }
                let mut seen = HashSet::new();
                for playbook in playbooks {
                    let name = playbook_file_name(&playbook.name)?;
                    if !seen.insert(name.clone()) {
                        return Err(Error::validation(format!("duplicate playbook '{name}'")));
                    }
                }
                Ok(())
            }
            JobSource::Imported { repo_url, .. } => {
                if repo_url.trim().is_empty() {
                    return Err(Error::validation("repo_url is required for imported jobs"));
                }
                Ok(())
            }
            JobSource::Templated {
                script_name,
                script,
                ..
            } => {
                if script.trim().is_empty() {
                    return Err(Error::validation("templated job script is empty"));
                }
                plain_file_name(script_name)?;
                Ok(())
            }
        }
    }

    /// Populate `workdir` and return the ordered entry points.
    pub async fn prepare(&self, workdir: &Path, runner: &RunnerConfig) -> Result<Vec<NewStep>> {
        self.validate()?;
        match self {
            JobSource::Manual { playbooks } => {
                tokio::fs::create_dir_all(workdir).await?;
                let mut steps = Vec::with_capacity(playbooks.len());
                for playbook in playbooks {
                    let name = playbook_file_name(&playbook.name)?;
                    let path = workdir.join(&name);
                    tokio::fs::write(&path, &playbook.content).await?;
                    steps.push(NewStep {
                        entry_name: name,
                        entry_path: path.display().to_string(),
                    });
                }
                Ok(steps)
            }
            JobSource::Imported {
                repo_url,
                entrypoints,
            } => {
                if let Some(parent) = workdir.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                git::clone(&runner.git_program, repo_url, workdir).await?;
                let names = if entrypoints.is_empty() {
                    git::discover_playbooks(workdir)?
                } else {
                    git::validate_entrypoints(workdir, entrypoints)?
                };
                Ok(names
                    .into_iter()
                    .map(|name| NewStep {
                        entry_path: workdir.join(&name).display().to_string(),
                        entry_name: name,
                    })
                    .collect())
            }
            JobSource::Templated {
                script_name,
                script,
                params,
            } => {
                let scripts = workdir.join("scripts");
                tokio::fs::create_dir_all(&scripts).await?;
                let path = scripts.join(script_name);
                tokio::fs::write(&path, script).await?;
                let params = serde_json::to_vec_pretty(params)
                    .map_err(|e| Error::validation(format!("template params: {e}")))?;
                tokio::fs::write(workdir.join(TEMPLATE_PARAMS_FILE), params).await?;
                Ok(vec![NewStep {
                    entry_name: script_name.clone(),
                    entry_path: path.display().to_string(),
                }])
            }
        }
    }
}

fn plain_file_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(Error::validation(format!("invalid file name '{name}'")));
    }
    Ok(name.to_string())
}

/// Uploaded playbook names always end up with a `.yml` suffix.
fn playbook_file_name(name: &str) -> Result<String> {
    let name = plain_file_name(name)?;
    if name.ends_with(".yml") || name.ends_with(".yaml") {
        Ok(name)
    } else {
        Ok(format!("{name}.yml"))
    }
}

/// Root directory holding one working directory per job.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    pub async fn remove_job_dir(&self, job_id: JobId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.job_dir(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write the job's own inventory.
pub async fn write_inventory(workdir: &Path, groups: &HostGroups) -> Result<()> {
    write_inventory_text(workdir, &inventory::render_inventory(groups)).await
}

/// Overwrite `hosts` with literal inventory text.
pub async fn write_inventory_text(workdir: &Path, text: &str) -> Result<()> {
    tokio::fs::create_dir_all(workdir).await?;
    tokio::fs::write(workdir.join(INVENTORY_FILE), text).await?;
    Ok(())
}

/// Write `vars/all.yml`, or remove it when there are no variables.
pub async fn write_global_vars(workdir: &Path, vars: &BTreeMap<String, String>) -> Result<()> {
    let path = workdir.join(VARS_FILE);
    if vars.is_empty() {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    write_vars_text(workdir, &inventory::render_vars(vars)).await
}

/// Overwrite `vars/all.yml` with literal YAML.
pub async fn write_vars_text(workdir: &Path, text: &str) -> Result<()> {
    let path = workdir.join(VARS_FILE);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, text).await?;
    Ok(())
}
