// End-to-end scenarios driven through the engine itself: trigger, observe
// persisted state, logs and notifications.

mod support;

use common::loghub;
use common::models::{
    JobTriggers, NotificationConfig, NotificationKind, NotifyEvent, RunStatus, TriggerSource,
};
use common::scheduler::TargetId;
use std::collections::HashMap;
use std::time::Duration;
use support::{
    boot, boot_with_queue_depth, shell_job, shell_job_with, wait_terminal_build,
    wait_terminal_run, ScriptedWorkload,
};
use uuid::Uuid;

fn notification(events: Vec<NotifyEvent>) -> NotificationConfig {
    let now = chrono::Utc::now();
    NotificationConfig {
        id: Uuid::new_v4(),
        name: "capture".to_string(),
        kind: NotificationKind::Webhook,
        url: "http://notify.local/hook".to_string(),
        secret: None,
        headers: HashMap::new(),
        events,
        pipeline_ids: Vec::new(),
        job_ids: Vec::new(),
        enabled: true,
        created_at: now,
        updated_at: now,
    }
}

// Scenario: one local shell step echoing into the log
#[tokio::test]
async fn freestyle_single_local_step() {
    let h = boot(false).await;
    h.controller
        .store
        .notifications()
        .insert(notification(vec![NotifyEvent::BuildSucceeded]))
        .unwrap();
    let job = shell_job("hello", &[("say", "echo hello", false)]);
    h.controller.store.jobs().insert(job.clone()).unwrap();

    let build = h
        .controller
        .factory
        .trigger_job(job.id, HashMap::new(), TriggerSource::Manual, None, None)
        .await
        .unwrap();
    assert_eq!(build.build_number, 1);

    let build = wait_terminal_build(&h.controller, build.id, Duration::from_secs(10)).await;
    assert_eq!(build.status, RunStatus::Succeeded);
    assert_eq!(build.steps[0].status, RunStatus::Succeeded);
    assert_eq!(build.steps[0].exit_code, Some(0));
    // duration_ms equals finished - started, within clock granularity
    let elapsed = (build.finished_at.unwrap() - build.started_at.unwrap()).num_milliseconds();
    assert!((build.duration_ms.unwrap() - elapsed).abs() <= 1);

    // Logs carry the step output
    let logs = h
        .controller
        .loghub
        .tail(&loghub::build_key(build.id), 4096)
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&logs), "hello\n");

    // Counters and status block settled
    let job = h.controller.store.jobs().get(job.id).unwrap();
    assert_eq!(job.status.total_builds, 1);
    assert_eq!(job.status.last_build_status, Some(RunStatus::Succeeded));
    assert_eq!(job.status.last_build_id, Some(build.id));

    // Exactly one succeeded notification (started events not subscribed)
    support::wait_for("notification delivery", Duration::from_secs(5), || {
        h.poster.events().contains(&"build_succeeded".to_string())
    })
    .await;
    assert_eq!(h.poster.events(), vec!["build_succeeded".to_string()]);
}

// Scenario: continue-on-error lets the build succeed past a failing step
#[tokio::test]
async fn continue_on_error_step() {
    let h = boot(false).await;
    let job = shell_job(
        "resilient",
        &[("flaky", "false", true), ("steady", "echo ok", false)],
    );
    h.controller.store.jobs().insert(job.clone()).unwrap();

    let build = h
        .controller
        .factory
        .trigger_job(job.id, HashMap::new(), TriggerSource::Manual, None, None)
        .await
        .unwrap();
    let build = wait_terminal_build(&h.controller, build.id, Duration::from_secs(10)).await;

    assert_eq!(build.status, RunStatus::Succeeded);
    assert_eq!(build.steps[0].status, RunStatus::Failed);
    assert_eq!(build.steps[0].exit_code, Some(1));
    assert_eq!(build.steps[1].status, RunStatus::Succeeded);

    let logs = h
        .controller
        .loghub
        .tail(&loghub::build_key(build.id), 4096)
        .unwrap();
    assert!(String::from_utf8_lossy(&logs).contains("ok"));
}

// Scenario: a failing step without continue-on-error stops the build
#[tokio::test]
async fn failing_step_stops_build() {
    let h = boot(false).await;
    let job = shell_job(
        "fragile",
        &[("boom", "exit 7", false), ("never", "echo unreachable", false)],
    );
    h.controller.store.jobs().insert(job.clone()).unwrap();

    let build = h
        .controller
        .factory
        .trigger_job(job.id, HashMap::new(), TriggerSource::Manual, None, None)
        .await
        .unwrap();
    let build = wait_terminal_build(&h.controller, build.id, Duration::from_secs(10)).await;

    assert_eq!(build.status, RunStatus::Failed);
    assert_eq!(build.steps[0].status, RunStatus::Failed);
    assert_eq!(build.steps[0].exit_code, Some(7));
    // The second step never ran
    assert_eq!(build.steps[1].status, RunStatus::Pending);
    assert!(build.reason.as_deref().unwrap().contains("boom"));
}

// Scenario: cancellation mid-step terminates promptly with no success event
#[tokio::test]
async fn cancellation_mid_step() {
    let h = boot(false).await;
    h.controller
        .store
        .notifications()
        .insert(notification(vec![
            NotifyEvent::BuildSucceeded,
            NotifyEvent::BuildCancelled,
        ]))
        .unwrap();
    let job = shell_job("sleeper", &[("nap", "sleep 60", false)]);
    h.controller.store.jobs().insert(job.clone()).unwrap();

    let build = h
        .controller
        .factory
        .trigger_job(job.id, HashMap::new(), TriggerSource::Manual, None, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let started = std::time::Instant::now();
    assert!(h.controller.cancel(build.id));
    // Idempotent: repeated cancellation changes nothing
    h.controller.cancel(build.id);

    let build = wait_terminal_build(&h.controller, build.id, Duration::from_secs(3)).await;
    assert!(started.elapsed() <= Duration::from_secs(3));
    assert_eq!(build.status, RunStatus::Cancelled);
    assert_eq!(build.steps[0].status, RunStatus::Cancelled);

    support::wait_for("cancel notification", Duration::from_secs(5), || {
        h.poster.events().contains(&"build_cancelled".to_string())
    })
    .await;
    assert!(!h.poster.events().contains(&"build_succeeded".to_string()));
}

// Step environment: parameters, built-ins and ${VAR} expansion
#[tokio::test]
async fn parameters_and_builtins_reach_steps() {
    let h = boot(false).await;
    let mut job = shell_job(
        "env-check",
        &[(
            "print",
            "echo ${GREETING} $JOB_NAME build=$BUILD_NUMBER",
            false,
        )],
    );
    job.parameters = vec![common::models::ParameterSpec {
        name: "GREETING".to_string(),
        kind: common::models::ParameterKind::String,
        default: Some("salut".to_string()),
        required: false,
        choices: Vec::new(),
        description: None,
    }];
    h.controller.store.jobs().insert(job.clone()).unwrap();

    let build = h
        .controller
        .factory
        .trigger_job(job.id, HashMap::new(), TriggerSource::Manual, None, None)
        .await
        .unwrap();
    let build = wait_terminal_build(&h.controller, build.id, Duration::from_secs(10)).await;
    assert_eq!(build.status, RunStatus::Succeeded);

    let logs = h
        .controller
        .loghub
        .tail(&loghub::build_key(build.id), 4096)
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&logs),
        "salut env-check build=1\n"
    );
}

// Scenario: serialization per target, no overlapping builds
#[tokio::test]
async fn builds_serialize_per_job() {
    let h = boot(false).await;
    let job = shell_job("serial", &[("work", "sleep 1", false)]);
    h.controller.store.jobs().insert(job.clone()).unwrap();

    let first = h
        .controller
        .factory
        .trigger_job(job.id, HashMap::new(), TriggerSource::Manual, None, None)
        .await
        .unwrap();
    let second = h
        .controller
        .factory
        .trigger_job(job.id, HashMap::new(), TriggerSource::Manual, None, None)
        .await
        .unwrap();
    assert_eq!(first.build_number, 1);
    assert_eq!(second.build_number, 2);

    // While the first runs, the second stays pending
    support::wait_for("first build running", Duration::from_secs(5), || {
        h.controller.store.builds().get(first.id).unwrap().status == RunStatus::Running
    })
    .await;
    assert_eq!(
        h.controller.store.builds().get(second.id).unwrap().status,
        RunStatus::Pending
    );

    let first = wait_terminal_build(&h.controller, first.id, Duration::from_secs(10)).await;
    let second = wait_terminal_build(&h.controller, second.id, Duration::from_secs(10)).await;
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
    // Intervals do not overlap
    assert!(first.finished_at.unwrap() <= second.started_at.unwrap());
}

// Queue overflow surfaces Busy once the depth is exhausted
#[tokio::test]
async fn saturated_queue_rejects_with_busy() {
    let h = boot_with_queue_depth(false, 1).await;
    let job = shell_job("narrow", &[("work", "sleep 2", false)]);
    h.controller.store.jobs().insert(job.clone()).unwrap();

    let mut accepted = 0;
    let mut busy = 0;
    for _ in 0..5 {
        match h
            .controller
            .factory
            .trigger_job(job.id, HashMap::new(), TriggerSource::Manual, None, None)
            .await
        {
            Ok(_) => accepted += 1,
            Err(common::errors::TriggerError::Busy) => busy += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
        tokio::task::yield_now().await;
    }
    assert!(accepted >= 1);
    assert!(busy >= 1, "expected Busy rejections on a depth-1 queue");

    // Accepted build numbers are dense regardless of rejections
    let numbers: Vec<i64> = {
        let mut builds = h.controller.store.builds_for_job(job.id);
        builds.sort_by_key(|b| b.build_number);
        builds.iter().map(|b| b.build_number).collect()
    };
    let expected: Vec<i64> = (1..=accepted as i64).collect();
    assert_eq!(numbers, expected);
}

// Cron fires create builds through the same serialized path
#[tokio::test]
async fn cron_fire_creates_build() {
    let h = boot(false).await;
    let job = shell_job_with(
        "nightly",
        &[("work", "echo tick", false)],
        JobTriggers {
            webhook_enabled: false,
            webhook_secret: None,
            cron: Some("* * * * *".to_string()),
        },
    );
    h.controller.store.jobs().insert(job.clone()).unwrap();
    h.controller.cron.register_job(&job).unwrap();

    // Drive the engine one tick past the next minute boundary
    h.controller
        .cron
        .fire_due(chrono::Utc::now() + chrono::Duration::minutes(2))
        .await;

    support::wait_for("cron build", Duration::from_secs(5), || {
        !h.controller.store.builds_for_job(job.id).is_empty()
    })
    .await;
    let build = &h.controller.store.builds_for_job(job.id)[0];
    assert_eq!(build.trigger, TriggerSource::Cron);
    let build = wait_terminal_build(&h.controller, build.id, Duration::from_secs(10)).await;
    assert_eq!(build.status, RunStatus::Succeeded);
}

// Scenario: cluster pipeline with artifacts, against the scripted cluster
#[tokio::test]
async fn cluster_pipeline_with_artifacts() {
    let h = boot(true).await;
    let cluster = h.cluster.as_ref().unwrap();
    cluster.script(
        "emit",
        ScriptedWorkload {
            logs: b"producing\n".to_vec(),
            fail: false,
            artifacts: vec![("out.txt".to_string(), b"42".to_vec())],
            running_for: Duration::from_millis(50),
        },
    );

    let yaml = r#"
name: artifacts-demo
stages:
  - name: main
    jobs:
      - name: emit
        image: alpine:3
        command: ["sh", "-c", "echo 42 > /artifacts/out.txt"]
        artifacts:
          paths: ["/artifacts"]
"#;
    let pipeline = common::spec::new_pipeline(yaml).unwrap();
    h.controller
        .store
        .pipelines()
        .insert(pipeline.clone())
        .unwrap();

    let run = h
        .controller
        .factory
        .trigger_pipeline(
            pipeline.id,
            HashMap::new(),
            TriggerSource::Manual,
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(run.run_number, 1);

    let run = wait_terminal_run(&h.controller, run.id, Duration::from_secs(10)).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.jobs[0].status, RunStatus::Succeeded);
    assert!(run.jobs[0].workload.is_some());

    let artifacts = h.controller.store.artifacts_for_run(run.id);
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].name, "out.txt");
    assert_eq!(artifacts[0].size_bytes, 2);

    // Workload logs went through the hub
    let logs = h
        .controller
        .loghub
        .tail(&loghub::run_job_key(run.id, "emit"), 4096)
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&logs), "producing\n");
}

// Dependent jobs are skipped when an upstream job fails
#[tokio::test]
async fn failed_job_skips_dependents() {
    let h = boot(true).await;
    let cluster = h.cluster.as_ref().unwrap();
    cluster.script(
        "build",
        ScriptedWorkload {
            fail: true,
            ..Default::default()
        },
    );

    let yaml = r#"
name: chain
stages:
  - name: main
    jobs:
      - name: build
        image: alpine:3
        command: ["true"]
      - name: deploy
        image: alpine:3
        command: ["true"]
        needs: [build]
"#;
    let pipeline = common::spec::new_pipeline(yaml).unwrap();
    h.controller
        .store
        .pipelines()
        .insert(pipeline.clone())
        .unwrap();

    let run = h
        .controller
        .factory
        .trigger_pipeline(
            pipeline.id,
            HashMap::new(),
            TriggerSource::Manual,
            None,
            None,
        )
        .await
        .unwrap();
    let run = wait_terminal_run(&h.controller, run.id, Duration::from_secs(10)).await;

    assert_eq!(run.status, RunStatus::Failed);
    let by_name: HashMap<&str, RunStatus> =
        run.jobs.iter().map(|j| (j.name.as_str(), j.status)).collect();
    assert_eq!(by_name["build"], RunStatus::Failed);
    assert_eq!(by_name["deploy"], RunStatus::Skipped);
    assert!(run.reason.as_deref().unwrap().contains("build"));
}

// Restart recovery: non-terminal work is failed as interrupted on boot
#[tokio::test]
async fn restart_marks_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = common::config::Settings::default();
    settings.storage.base_dir = dir.path().to_path_buf();

    // First process: a build left mid-flight
    {
        let store = common::store::Store::open(dir.path()).unwrap();
        let job = shell_job("left-behind", &[("work", "sleep 60", false)]);
        store.jobs().insert(job.clone()).unwrap();
        let now = chrono::Utc::now();
        store
            .builds()
            .insert(common::models::FreestyleBuild {
                id: Uuid::new_v4(),
                job_id: job.id,
                job_name: job.name.clone(),
                build_number: 1,
                trigger: TriggerSource::Manual,
                trigger_user: None,
                commit: None,
                parameters: HashMap::new(),
                status: RunStatus::Running,
                steps: Vec::new(),
                reason: None,
                created_at: now,
                started_at: Some(now),
                finished_at: None,
                duration_ms: None,
            })
            .unwrap();
    }

    // Second process: boot over the same directory
    let poster = std::sync::Arc::new(support::RecordingPoster::default());
    let controller = common::supervisor::boot_with(
        settings,
        None,
        std::sync::Arc::new(support::UnreachableShell),
        poster as std::sync::Arc<dyn common::notifier::HttpPoster>,
    )
    .await
    .unwrap();

    let builds = controller.store.builds().list();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].status, RunStatus::Failed);
    assert_eq!(builds[0].reason.as_deref(), Some("interrupted"));
    assert!(builds[0].finished_at.is_some());
}

// Deleting a pipeline cascades runs, artifacts and queue/cron registrations
#[tokio::test]
async fn pipeline_delete_cascades() {
    let h = boot(true).await;
    let cluster = h.cluster.as_ref().unwrap();
    cluster.script(
        "emit",
        ScriptedWorkload {
            artifacts: vec![("keep.txt".to_string(), b"x".to_vec())],
            ..Default::default()
        },
    );

    let yaml = r#"
name: doomed
stages:
  - name: main
    jobs:
      - name: emit
        image: alpine:3
        command: ["true"]
        artifacts:
          paths: ["/artifacts"]
"#;
    let pipeline = common::spec::new_pipeline(yaml).unwrap();
    h.controller
        .store
        .pipelines()
        .insert(pipeline.clone())
        .unwrap();
    let run = h
        .controller
        .factory
        .trigger_pipeline(
            pipeline.id,
            HashMap::new(),
            TriggerSource::Manual,
            None,
            None,
        )
        .await
        .unwrap();
    let run = wait_terminal_run(&h.controller, run.id, Duration::from_secs(10)).await;
    assert_eq!(h.controller.store.artifacts_for_run(run.id).len(), 1);

    h.controller.delete_pipeline(pipeline.id).unwrap();
    assert!(h.controller.store.pipelines().get(pipeline.id).is_err());
    assert!(h.controller.store.runs_for_pipeline(pipeline.id).is_empty());
    assert!(h.controller.store.artifacts_for_run(run.id).is_empty());
    // Target bookkeeping is gone too
    h.controller.queues.remove_target(TargetId::Pipeline(pipeline.id));
}
