//! Imported jobs: clone a repository and pick its playbooks.

use std::path::{Component, Path};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Error, Result};

/// Root-level files that are never playbooks.
const NOT_PLAYBOOKS: &[&str] = &["hosts", "ansible.cfg", "vars.yml", "vars.yaml"];

fn is_yaml(name: &str) -> bool {
    name.ends_with(".yml") || name.ends_with(".yaml")
}

/// Clone `repo_url` into `dest` with the external git program.
pub async fn clone(git_program: &str, repo_url: &str, dest: &Path) -> Result<()> {
    tracing::info!(repo = %repo_url, dest = %dest.display(), "cloning job repository");
    let output = Command::new(git_program)
        .arg("clone")
        .arg("--quiet")
        .arg(repo_url)
        .arg(dest)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::ExecutionFault(format!("failed to launch {git_program}: {e}")))?;

    if !output.status.success() {
        return Err(Error::ExecutionFault(format!(
            "git clone of {repo_url} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Root-level `.yml`/`.yaml` files, minus well-known non-playbooks, sorted by name.
pub fn discover_playbooks(repo_dir: &Path) -> Result<Vec<String>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(repo_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !is_yaml(&name)
            || NOT_PLAYBOOKS.contains(&name.as_str())
            || name.starts_with("group_vars")
            || name.starts_with("host_vars")
        {
            continue;
        }
        found.push(name);
    }

    if found.is_empty() {
        return Err(Error::validation(
            "no playbook (.yml/.yaml) found at the repository root",
        ));
    }
    found.sort();
    Ok(found)
}

/// Check caller-supplied entry points against the cloned tree.
pub fn validate_entrypoints(repo_dir: &Path, paths: &[String]) -> Result<Vec<String>> {
    let mut checked = Vec::with_capacity(paths.len());
    for raw in paths {
        let rel = raw.trim();
        if rel.is_empty() {
            continue;
        }
        let path = Path::new(rel);
        if path.is_absolute() {
            return Err(Error::validation(format!("entry point '{rel}' must be relative")));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::validation(format!("entry point '{rel}' must not contain '..'")));
        }
        if !is_yaml(rel) {
            return Err(Error::validation(format!(
                "entry point '{rel}' is not a .yml/.yaml file"
            )));
        }
        if !repo_dir.join(path).is_file() {
            return Err(Error::validation(format!(
                "entry point '{rel}' does not exist in the repository"
            )));
        }
        checked.push(rel.to_string());
    }
    if checked.is_empty() {
        return Err(Error::validation("no entry points given"));
    }
    Ok(checked)
}
