//! Shared fixtures: a temp data directory, a SQLite repository and a stand-in
//! playbook program that runs its last argument with `sh`.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use taskpilot::config::PilotConfig;
use taskpilot::model::{Job, JobId, Status};
use taskpilot::service::{CreateJobRequest, Orchestrator};
use taskpilot::storage::{self, JobRepository, SqliteRepository};

pub struct Harness {
    pub dir: TempDir,
    pub config: PilotConfig,
    pub repo: Arc<SqliteRepository>,
    pub orchestrator: Arc<Orchestrator>,
}

const FAKE_PLAYBOOK: &str = "#!/bin/sh\nfor last; do :; done\nexec sh \"$last\"\n";

fn write_fake_program(dir: &Path) -> String {
    let path = dir.join("fake-playbook");
    std::fs::write(&path, FAKE_PLAYBOOK).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

pub fn test_config(dir: &Path) -> PilotConfig {
    let mut config = PilotConfig::default();
    config.storage.db_path = dir.join("taskpilot.db");
    config.storage.workspace_root = dir.join("workspaces");
    config.storage.log_root = dir.join("logs");
    config.runner.playbook_program = write_fake_program(dir);
    config.runner.default_flags = Vec::new();
    config.runner.script_shell = "sh".to_string();
    config.tail.poll_interval_ms = 20;
    config.tail.status_check_every = 2;
    config.tail.heartbeat_every = 5;
    config.tail.log_path_retries = 50;
    config.tail.file_wait_retries = 50;
    config.tail.open_interval_ms = 20;
    config.tail.drain_grace_ms = 50;
    config
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut PilotConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let pool = storage::open_pool(&config.storage.db_path).unwrap();
    let repo = Arc::new(SqliteRepository::new(pool));
    let orchestrator = Arc::new(Orchestrator::new(repo.clone(), config.clone()));
    Harness {
        dir,
        config,
        repo,
        orchestrator,
    }
}

/// Request body of a manual job whose playbooks are shell snippets.
pub fn manual_body(name: &str, playbooks: &[(&str, &str)]) -> Value {
    let playbooks: Vec<Value> = playbooks
        .iter()
        .map(|(name, content)| json!({ "name": name, "content": content }))
        .collect();
    json!({
        "name": name,
        "source": { "kind": "manual", "playbooks": playbooks },
        "host_groups": { "web": [{ "address": "127.0.0.1" }] },
        "global_vars": { "env": "test" }
    })
}

pub fn manual_job(name: &str, playbooks: &[(&str, &str)]) -> CreateJobRequest {
    serde_json::from_value(manual_body(name, playbooks)).unwrap()
}

impl Harness {
    pub async fn job(&self, id: JobId) -> Job {
        self.repo.get_job(id).await.unwrap().unwrap()
    }

    /// Start a job and wait for its run, history included, to finish.
    pub async fn run_to_end(&self, id: JobId) -> Job {
        let handle = self.orchestrator.start_job(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(20), handle.wait())
            .await
            .expect("run did not finish");
        self.job(id).await
    }

    /// Poll until the job reaches `status`.
    pub async fn wait_for_status(&self, id: JobId, status: Status) {
        for _ in 0..200 {
            if self.job(id).await.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {id} never reached {status}");
    }
}
