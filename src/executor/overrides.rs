//! Centrally managed configuration applied at execution time.

use std::path::Path;

use crate::error::Result;
use crate::model::{ConfigKind, Job};
use crate::storage::JobRepository;
use crate::workspace;

/// Values a run actually uses after config entries are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effective {
    pub extra_vars: String,
    pub cli_args: String,
}

/// Look up the job's config entries and apply them to `workdir`.
///
/// The job's own inventory and variables are rewritten first, so files an
/// earlier run overwrote from an entry never leak into this one. Missing
/// entries, or entries whose kind changed since the job referenced them,
/// are skipped and the job's own values stay in force.
pub async fn apply(repo: &dyn JobRepository, job: &Job, workdir: &Path) -> Result<Effective> {
    workspace::write_inventory(workdir, &job.host_groups).await?;
    workspace::write_global_vars(workdir, &job.global_vars).await?;

    let mut effective = Effective {
        extra_vars: job.extra_vars.clone(),
        cli_args: job.cli_args.clone(),
    };
    if !job.use_config {
        return Ok(effective);
    }

    for (kind, id) in job.config_refs.expected() {
        let entry = match repo.get_config_entry(id).await? {
            Some(entry) if entry.kind == kind => entry,
            Some(entry) => {
                tracing::warn!(job_id = job.id, entry_id = id, expected = kind.as_str(), found = entry.kind.as_str(), "config entry kind mismatch, ignoring");
                continue;
            }
            None => {
                tracing::warn!(job_id = job.id, entry_id = id, "config entry missing, ignoring");
                continue;
            }
        };
        tracing::debug!(job_id = job.id, entry = %entry.name, kind = kind.as_str(), "applying config entry");
        match kind {
            ConfigKind::Inventory => workspace::write_inventory_text(workdir, &entry.content).await?,
            ConfigKind::GlobalVars => workspace::write_vars_text(workdir, &entry.content).await?,
            ConfigKind::ExtraVars => effective.extra_vars = entry.content,
            ConfigKind::CliArgs => effective.cli_args = entry.content,
        }
    }
    Ok(effective)
}
