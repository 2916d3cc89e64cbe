//! End-to-end engine behaviour against a real SQLite file and real child
//! processes.

mod common;

use std::path::Path;
use std::time::Duration;

use common::{harness, harness_with, manual_job};
use taskpilot::model::{ConfigKind, NewConfigEntry, PageRequest, Status, Trigger};
use taskpilot::service::UpdateJobRequest;
use taskpilot::storage::JobRepository;
use taskpilot::tail::{LogSubscription, TailEvent};
use taskpilot::Error;

#[tokio::test]
async fn test_partial_failure_runs_every_step() {
    let h = harness();
    let view = h
        .orchestrator
        .create_job(manual_job(
            "partial",
            &[("a", "echo A; exit 0"), ("b", "echo B; exit 1"), ("c", "echo C; exit 0")],
        ))
        .await
        .unwrap();
    assert_eq!(view.steps.len(), 3);
    assert_eq!(view.job.step_count, 3);

    let job = h.run_to_end(view.job.id).await;
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.error_msg, "1 of 3 steps failed");

    let steps = h.repo.list_steps(job.id).await.unwrap();
    let statuses: Vec<Status> = steps.iter().map(|s| s.status).collect();
    assert_eq!(statuses, vec![Status::Succeeded, Status::Failed, Status::Succeeded]);
    let codes: Vec<Option<i32>> = steps.iter().map(|s| s.exit_code).collect();
    assert_eq!(codes, vec![Some(0), Some(1), Some(0)]);

    let runs = h.repo.list_history(job.id, PageRequest::default()).await.unwrap();
    assert_eq!(runs.total, 1);
    assert_eq!(runs.items[0].status, Status::Failed);
    assert_eq!(runs.items[0].trigger, Trigger::Manual);

    let detail = h.orchestrator.get_history(runs.items[0].id).await.unwrap();
    let labels: Vec<&str> = detail.steps.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["a.yml", "b.yml", "c.yml"]);
    let archived: Vec<Status> = detail.steps.iter().map(|s| s.status).collect();
    assert_eq!(archived, vec![Status::Succeeded, Status::Failed, Status::Succeeded]);
    let summed: i64 = detail.steps.iter().map(|s| s.duration_ms).sum();
    assert_eq!(detail.history.total_duration_ms, summed);

    let log = h.orchestrator.get_history_log(detail.steps[0].id).await.unwrap();
    assert!(log.content.contains("starting step"));
    assert!(log.content.contains("inventory: hosts"));
    assert!(log.content.contains("\nA\n"));
    assert!(log.content.contains("step finished (exit code 0)"));
}

#[tokio::test]
async fn test_reruns_write_separate_logs() {
    let h = harness();
    let id = h
        .orchestrator
        .create_job(manual_job("rerun", &[("only", "echo run-$$")]))
        .await
        .unwrap()
        .job
        .id;

    h.run_to_end(id).await;
    let first = h.repo.list_steps(id).await.unwrap()[0].log_path.clone().unwrap();
    let first_content = std::fs::read_to_string(&first).unwrap();
    h.run_to_end(id).await;
    let second = h.repo.list_steps(id).await.unwrap()[0].log_path.clone().unwrap();

    assert_ne!(first, second);
    assert_eq!(std::fs::read_to_string(&first).unwrap(), first_content);
    assert!(Path::new(&second).exists());
    assert_eq!(
        h.repo.list_history(id, PageRequest::default()).await.unwrap().total,
        2
    );
}

#[tokio::test]
async fn test_history_retention_prunes_oldest_logs() {
    let h = harness();
    let mut req = manual_job("retained", &[("only", "echo hi")]);
    req.max_history_keep = Some(2);
    let id = h.orchestrator.create_job(req).await.unwrap().job.id;

    h.run_to_end(id).await;
    let oldest = h.repo.list_steps(id).await.unwrap()[0].log_path.clone().unwrap();
    h.run_to_end(id).await;
    h.run_to_end(id).await;

    let runs = h.repo.list_history(id, PageRequest::default()).await.unwrap();
    assert_eq!(runs.total, 2);
    assert!(!Path::new(&oldest).exists());
    assert!(!Path::new(&oldest).parent().unwrap().exists());
}

#[tokio::test]
async fn test_fail_fast_skips_remaining_steps() {
    let h = harness_with(|c| c.executor.fail_fast = true);
    let id = h
        .orchestrator
        .create_job(manual_job(
            "fast",
            &[("a", "exit 2"), ("b", "echo never")],
        ))
        .await
        .unwrap()
        .job
        .id;

    let job = h.run_to_end(id).await;
    assert_eq!(job.status, Status::Failed);
    let steps = h.repo.list_steps(id).await.unwrap();
    assert_eq!(steps[0].exit_code, Some(2));
    assert_eq!(steps[1].status, Status::Failed);
    assert_eq!(steps[1].log_path, None);
    assert_eq!(steps[1].error_msg, taskpilot::executor::SKIPPED);
}

#[tokio::test]
async fn test_running_job_rejects_start_update_delete() {
    let h = harness();
    let view = h
        .orchestrator
        .create_job(manual_job("slow", &[("wait", "sleep 5")]))
        .await
        .unwrap();
    let id = view.job.id;
    let step_id = view.steps[0].id;

    let handle = h.orchestrator.start_job(id).await.unwrap();
    assert!(matches!(h.orchestrator.start_job(id).await, Err(Error::Conflict(_))));
    assert!(matches!(
        h.orchestrator.update_job(id, UpdateJobRequest::default()).await,
        Err(Error::Conflict(_))
    ));
    assert!(matches!(h.orchestrator.delete_job(id).await, Err(Error::Conflict(_))));

    // wait for the child to be launched before cancelling it
    for _ in 0..200 {
        let step = h.repo.get_step(id, step_id).await.unwrap().unwrap();
        if step.log_path.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.orchestrator.stop_job(id, step_id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled run did not finish");

    let step = h.repo.get_step(id, step_id).await.unwrap().unwrap();
    assert_eq!(step.status, Status::Failed);
    assert_eq!(step.error_msg, "cancelled");
    assert_eq!(h.job(id).await.status, Status::Failed);
}

#[tokio::test]
async fn test_startup_recovers_interrupted_runs() {
    let h = harness_with(|c| c.scheduler.enabled = false);
    let id = h
        .orchestrator
        .create_job(manual_job("orphan", &[("x", "true")]))
        .await
        .unwrap()
        .job
        .id;
    assert!(h.repo.claim_job(id).await.unwrap());

    h.orchestrator.startup().await.unwrap();
    let job = h.job(id).await;
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.error_msg, taskpilot::executor::INTERRUPTED);
}

#[tokio::test]
async fn test_scheduler_upsert_is_idempotent() {
    let h = harness();
    let mut req = manual_job("nightly", &[("x", "true")]);
    req.is_recurring = true;
    req.cron_expr = "0 3 * * *".into();
    let id = h.orchestrator.create_job(req).await.unwrap().job.id;

    let scheduler = h.orchestrator.scheduler();
    assert!(scheduler.is_scheduled(id));

    let same = UpdateJobRequest {
        cron_expr: Some("0 3 * * *".into()),
        ..UpdateJobRequest::default()
    };
    h.orchestrator.update_job(id, same.clone()).await.unwrap();
    h.orchestrator.update_job(id, same).await.unwrap();
    assert_eq!(scheduler.handle_count(), 1);

    let bad = UpdateJobRequest {
        cron_expr: Some("not a schedule".into()),
        ..UpdateJobRequest::default()
    };
    assert!(matches!(
        h.orchestrator.update_job(id, bad).await,
        Err(Error::InvalidExpression { .. })
    ));
    assert_eq!(h.job(id).await.cron_expr, "0 3 * * *");
    assert!(scheduler.is_scheduled(id));

    let off = UpdateJobRequest {
        is_recurring: Some(false),
        ..UpdateJobRequest::default()
    };
    h.orchestrator.update_job(id, off).await.unwrap();
    assert!(!scheduler.is_scheduled(id));
    assert_eq!(scheduler.handle_count(), 0);
}

#[tokio::test]
async fn test_invalid_expression_rejected_at_create() {
    let h = harness();
    let mut req = manual_job("broken", &[("x", "true")]);
    req.is_recurring = true;
    req.cron_expr = "61 * * * *".into();
    assert!(matches!(
        h.orchestrator.create_job(req).await,
        Err(Error::InvalidExpression { .. })
    ));
    assert!(h.repo.find_job_by_name("broken").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_config_reference_is_validation_error() {
    let h = harness();
    let mut req = manual_job("refs", &[("x", "true")]);
    req.use_config = true;
    req.config_refs.extra_vars = Some(999);
    assert!(matches!(
        h.orchestrator.create_job(req).await,
        Err(Error::Validation(_))
    ));

    let entry = h
        .orchestrator
        .create_config_entry(NewConfigEntry {
            name: "args".into(),
            kind: ConfigKind::CliArgs,
            content: "--check".into(),
        })
        .await
        .unwrap();
    let mut req = manual_job("refs", &[("x", "true")]);
    req.use_config = true;
    req.config_refs.extra_vars = Some(entry.id);
    assert!(matches!(
        h.orchestrator.create_job(req).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_config_entry_replaces_extra_vars_at_run_time() {
    let h = harness();
    let entry = h
        .orchestrator
        .create_config_entry(NewConfigEntry {
            name: "shared-vars".into(),
            kind: ConfigKind::ExtraVars,
            content: "region=eu".into(),
        })
        .await
        .unwrap();
    let mut req = manual_job("configured", &[("x", "echo ok")]);
    req.extra_vars = "region=us".into();
    req.use_config = true;
    req.config_refs.extra_vars = Some(entry.id);
    let id = h.orchestrator.create_job(req).await.unwrap().job.id;

    h.run_to_end(id).await;
    let path = h.repo.list_steps(id).await.unwrap()[0].log_path.clone().unwrap();
    let log = std::fs::read_to_string(path).unwrap();
    assert!(log.contains("extra vars: region=eu"));
    assert!(!log.contains("region=us"));
}

#[tokio::test]
async fn test_inventory_entry_does_not_outlive_use_config() {
    let h = harness();
    let entry = h
        .orchestrator
        .create_config_entry(NewConfigEntry {
            name: "central-hosts".into(),
            kind: ConfigKind::Inventory,
            content: "[central]\n10.9.9.9\n".into(),
        })
        .await
        .unwrap();
    let mut req = manual_job("inventoried", &[("show", "cat hosts")]);
    req.use_config = true;
    req.config_refs.inventory = Some(entry.id);
    let id = h.orchestrator.create_job(req).await.unwrap().job.id;

    h.run_to_end(id).await;
    let path = h.repo.list_steps(id).await.unwrap()[0].log_path.clone().unwrap();
    assert!(std::fs::read_to_string(path).unwrap().contains("10.9.9.9"));

    let off = UpdateJobRequest {
        use_config: Some(false),
        ..UpdateJobRequest::default()
    };
    h.orchestrator.update_job(id, off).await.unwrap();
    h.run_to_end(id).await;
    let path = h.repo.list_steps(id).await.unwrap()[0].log_path.clone().unwrap();
    let log = std::fs::read_to_string(path).unwrap();
    assert!(log.contains("127.0.0.1"));
    assert!(!log.contains("10.9.9.9"));
}

#[tokio::test]
async fn test_disabled_scheduler_never_fires_new_jobs() {
    let h = harness_with(|c| c.scheduler.enabled = false);
    h.orchestrator.startup().await.unwrap();
    let mut req = manual_job("every-second", &[("x", "echo fired")]);
    req.is_recurring = true;
    req.cron_expr = "* * * * * *".into();
    let id = h.orchestrator.create_job(req).await.unwrap().job.id;
    assert!(!h.orchestrator.scheduler().is_scheduled(id));

    let touch = UpdateJobRequest {
        description: Some("still off".into()),
        ..UpdateJobRequest::default()
    };
    h.orchestrator.update_job(id, touch).await.unwrap();
    assert!(!h.orchestrator.scheduler().is_scheduled(id));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let runs = h.repo.list_history(id, PageRequest::default()).await.unwrap();
    assert_eq!(runs.total, 0);
    assert_eq!(h.job(id).await.status, Status::Waiting);
}

#[tokio::test]
async fn test_failed_delete_keeps_job_scheduled() {
    let h = harness();
    let mut req = manual_job("sticky", &[("x", "true")]);
    req.is_recurring = true;
    req.cron_expr = "0 3 * * *".into();
    let id = h.orchestrator.create_job(req).await.unwrap().job.id;

    h.repo
        .pool()
        .get()
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER keep_jobs BEFORE DELETE ON jobs
             BEGIN SELECT RAISE(ABORT, 'jobs are read-only'); END;",
        )
        .unwrap();
    assert!(h.orchestrator.delete_job(id).await.is_err());
    assert!(h.orchestrator.scheduler().is_scheduled(id));
    assert!(h.orchestrator.get_job(id).await.is_ok());

    h.repo
        .pool()
        .get()
        .unwrap()
        .execute_batch("DROP TRIGGER keep_jobs;")
        .unwrap();
    h.orchestrator.delete_job(id).await.unwrap();
    assert!(!h.orchestrator.scheduler().is_scheduled(id));
}

#[tokio::test]
async fn test_delete_job_removes_workspace_and_logs() {
    let h = harness();
    let id = h
        .orchestrator
        .create_job(manual_job("gone", &[("x", "echo bye")]))
        .await
        .unwrap()
        .job
        .id;
    h.run_to_end(id).await;

    let workdir = h.config.storage.workspace_root.join(id.to_string());
    let logdir = h.config.storage.log_root.join(id.to_string());
    assert!(workdir.join("hosts").exists());
    assert!(logdir.exists());

    h.orchestrator.delete_job(id).await.unwrap();
    assert!(!workdir.exists());
    assert!(!logdir.exists());
    assert!(matches!(h.orchestrator.get_job(id).await, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn test_live_tail_delivers_lines_in_order_then_one_completion() {
    let h = harness();
    let view = h
        .orchestrator
        .create_job(manual_job(
            "tailed",
            &[("talk", "echo one; sleep 0.3; echo two; sleep 0.3; echo three")],
        ))
        .await
        .unwrap();
    let (id, step_id) = (view.job.id, view.steps[0].id);

    let handle = h.orchestrator.start_job(id).await.unwrap();
    let mut sub = h.orchestrator.stream_log(id, step_id).await.unwrap();

    let mut events = Vec::new();
    let collect = async {
        while let Some(event) = sub.next().await {
            events.push(event);
        }
    };
    tokio::time::timeout(Duration::from_secs(15), collect)
        .await
        .expect("tail never completed");
    handle.wait().await;

    let lines: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            TailEvent::Line { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect();
    let position = |needle: &str| lines.iter().position(|l| l == needle).unwrap();
    assert!(position("one") < position("two"));
    assert!(position("two") < position("three"));

    let numbers: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            TailEvent::Line { number, .. } => Some(*number),
            _ => None,
        })
        .collect();
    assert!(numbers.windows(2).all(|w| w[1] == w[0] + 1));

    let completions: Vec<&TailEvent> = events
        .iter()
        .filter(|e| matches!(e, TailEvent::Complete { .. }))
        .collect();
    assert_eq!(completions.len(), 1);
    match events.last().unwrap() {
        TailEvent::Complete { status, lines: total } => {
            assert_eq!(*status, Status::Succeeded);
            assert_eq!(*total, numbers.len() as u64);
        }
        other => panic!("last event was {other:?}"),
    }
}

async fn collect_until_terminal(sub: &mut LogSubscription) -> Vec<TailEvent> {
    let mut events = Vec::new();
    let collect = async {
        while let Some(event) = sub.next().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(15), collect)
        .await
        .expect("tail never completed");
    events
}

fn lines_of(events: &[TailEvent]) -> Vec<(u64, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            TailEvent::Line { number, content } => Some((*number, content.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_tail_opened_before_start_waits_for_the_step() {
    let h = harness_with(|c| c.tail.log_path_retries = 500);
    let view = h
        .orchestrator
        .create_job(manual_job(
            "early",
            &[("warmup", "sleep 0.3"), ("talk", "echo one; echo two; echo three")],
        ))
        .await
        .unwrap();
    let (id, talk) = (view.job.id, view.steps[1].id);

    let mut sub = h.orchestrator.stream_log(id, talk).await.unwrap();
    let handle = h.orchestrator.start_job(id).await.unwrap();
    let events = collect_until_terminal(&mut sub).await;
    handle.wait().await;

    let lines: Vec<String> = lines_of(&events).into_iter().map(|(_, l)| l).collect();
    let position = |needle: &str| lines.iter().position(|l| l == needle).unwrap();
    assert!(position("one") < position("two"));
    assert!(position("two") < position("three"));
    assert!(!lines.iter().any(|l| l.contains("warmup")));

    let completions = events
        .iter()
        .filter(|e| matches!(e, TailEvent::Complete { .. }))
        .count();
    assert_eq!(completions, 1);
    assert!(matches!(
        events.last(),
        Some(TailEvent::Complete { status: Status::Succeeded, .. })
    ));
}

#[tokio::test]
async fn test_tail_follows_a_rerun_started_while_attached() {
    let h = harness_with(|c| c.tail.drain_grace_ms = 400);
    let view = h
        .orchestrator
        .create_job(manual_job("again", &[("only", "echo run-$$; sleep 0.2; echo done")]))
        .await
        .unwrap();
    let (id, step_id) = (view.job.id, view.steps[0].id);
    h.run_to_end(id).await;
    let first = h.repo.get_step(id, step_id).await.unwrap().unwrap().log_path.unwrap();

    let mut sub = h.orchestrator.stream_log(id, step_id).await.unwrap();
    let handle = h.orchestrator.start_job(id).await.unwrap();
    let events = collect_until_terminal(&mut sub).await;
    handle.wait().await;

    let second = h.repo.get_step(id, step_id).await.unwrap().unwrap().log_path.unwrap();
    assert_ne!(first, second);

    let restart = events
        .iter()
        .rposition(|e| matches!(e, TailEvent::Status(_)))
        .unwrap();
    let streamed = lines_of(&events[restart..]);
    let expected: Vec<(u64, String)> = std::fs::read_to_string(&second)
        .unwrap()
        .lines()
        .enumerate()
        .map(|(i, l)| (i as u64 + 1, l.to_string()))
        .collect();
    assert_eq!(streamed, expected);

    let completions = events
        .iter()
        .filter(|e| matches!(e, TailEvent::Complete { .. }))
        .count();
    assert_eq!(completions, 1);
    assert_eq!(
        events.last(),
        Some(&TailEvent::Complete {
            status: Status::Succeeded,
            lines: expected.len() as u64
        })
    );
}

#[tokio::test]
async fn test_tail_stops_when_subscriber_leaves() {
    let h = harness();
    let view = h
        .orchestrator
        .create_job(manual_job("long", &[("loop", "while true; do echo tick; sleep 0.05; done")]))
        .await
        .unwrap();
    let (id, step_id) = (view.job.id, view.steps[0].id);

    let _run = h.orchestrator.start_job(id).await.unwrap();
    let sub = h.orchestrator.stream_log(id, step_id).await.unwrap();
    let (mut events, task) = sub.into_parts();
    assert!(tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .is_some());
    drop(events);

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("tail session kept running")
        .unwrap();

    h.orchestrator.stop_job(id, step_id).await.unwrap();
    h.wait_for_status(id, Status::Failed).await;
}

#[tokio::test]
async fn test_stream_log_unknown_step_is_not_found() {
    let h = harness();
    assert!(matches!(
        h.orchestrator.stream_log(1, 1).await,
        Err(Error::NotFound { .. })
    ));
}
