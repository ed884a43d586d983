mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use meshq_core::execution::TokioProcessExecutor;
use meshq_core::models::{
    GlobalVars, NewProject, NewTask, PROJECT_TASKS_VAR, ProjectId, ProjectStatus, QueueState,
    TaskStatus,
};
use meshq_core::orchestration::{QueueRunner, RecoveryOutcome, RunnerConfig};
use meshq_core::persistence::StoreGateway;
use meshq_core::registry::WorkerRegistry;
use meshq_core::workers::script::QUEUE_TASK_TYPE;
use meshq_core::workers::{QueueAction, ScriptWorker, ScriptWorkerConfig};

use support::{
    BLOCK_UNTIL_ABORT, FAIL, FAKE_TASK_TYPE, FakeEngine, FakeWorker, REDIRECT, RecordingNotifier,
    SUCCEED,
};

struct Fixture {
    gateway: StoreGateway,
    engine: Arc<FakeEngine>,
    notifier: Arc<RecordingNotifier>,
    worker: Arc<FakeWorker>,
    runner: QueueRunner,
}

fn fixture(test_name: &str) -> Fixture {
    fixture_with(test_name, support::fast_runner_config())
}

fn fixture_with(test_name: &str, config: RunnerConfig) -> Fixture {
    let gateway = support::gateway(test_name);
    let engine = Arc::new(FakeEngine::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let worker = Arc::new(FakeWorker::default());

    let fake = worker.clone();
    let registry = WorkerRegistry::new(
        engine.clone(),
        gateway.clone(),
        notifier.clone(),
        support::fast_envelope_config(),
    )
    .with_worker(FAKE_TASK_TYPE, move || fake.clone())
    .with_worker(QUEUE_TASK_TYPE, || {
        Arc::new(ScriptWorker::new(
            Arc::new(TokioProcessExecutor),
            ScriptWorkerConfig {
                success_delay: Duration::from_millis(1),
                abort_grace: Duration::from_millis(1),
                ..ScriptWorkerConfig::default()
            },
        ))
    });

    let runner = QueueRunner::new(
        gateway.clone(),
        Arc::new(registry),
        engine.clone(),
        notifier.clone(),
        config,
    );

    Fixture {
        gateway,
        engine,
        notifier,
        worker,
        runner,
    }
}

/// Chains the tasks in order through explicit guids.
fn chained(key: &str, tasks: Vec<NewTask>) -> NewProject {
    let count = tasks.len();
    let tasks = tasks
        .into_iter()
        .enumerate()
        .map(|(index, task)| {
            let task = task.guid(format!("{key}-{index}"));
            if index + 1 < count {
                task.next(format!("{key}-{}", index + 1))
            } else {
                task
            }
        })
        .collect();
    NewProject {
        project_key: key.to_string(),
        manager: None,
        global_vars: GlobalVars::new(),
        tasks,
    }
}

fn fake(action: i64) -> NewTask {
    NewTask::new(FAKE_TASK_TYPE, action).comment(format!("fake {action}"))
}

impl Fixture {
    async fn insert(&self, project: NewProject) -> ProjectId {
        self.gateway.insert_projects(vec![project]).await.unwrap()[0]
    }

    async fn project_status(&self, id: ProjectId) -> ProjectStatus {
        self.gateway.project(id).await.unwrap().unwrap().status
    }

    async fn task_statuses(&self, id: ProjectId) -> Vec<TaskStatus> {
        self.gateway
            .tasks_for_project(id)
            .await
            .unwrap()
            .into_iter()
            .map(|task| task.status)
            .collect()
    }

    fn spawn_tick(&self) -> tokio::task::JoinHandle<Option<(ProjectId, ProjectStatus)>> {
        let runner = self.runner.clone();
        tokio::spawn(async move { runner.tick().await.unwrap() })
    }
}

#[tokio::test]
async fn chain_runs_in_guid_order_with_substituted_params() {
    let fixture = fixture("runner-chain");
    let mut project = chained(
        "chain",
        vec![
            fake(SUCCEED).params(json!({ "site": "$$site$$", "id": "$$current_task_id$$" })),
            fake(SUCCEED).params(json!({ "site": "$$site$$" })),
        ],
    );
    project
        .global_vars
        .insert("site".to_string(), Value::from("north"));
    let id = fixture.insert(project).await;
    let tasks = fixture.gateway.tasks_for_project(id).await.unwrap();

    let result = fixture.runner.tick().await.unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Completed)));
    assert_eq!(fixture.project_status(id).await, ProjectStatus::Completed);
    assert_eq!(
        fixture.task_statuses(id).await,
        [TaskStatus::Completed, TaskStatus::Completed]
    );
    assert_eq!(
        fixture.worker.seen_params(),
        [
            json!({ "site": "north", "id": tasks[0].id.0.to_string() }),
            json!({ "site": "north" }),
        ]
    );

    let globals = fixture.gateway.global_vars(id).await.unwrap();
    assert_eq!(globals.get("$$current_task_id"), Some(&Value::Null));
    assert_eq!(
        globals[PROJECT_TASKS_VAR][tasks[1].id.0.to_string()],
        json!("chain-1")
    );

    let names = fixture.notifier.names();
    assert!(names.contains(&"Finished".to_string()));
    assert_eq!(names.last().map(String::as_str), Some("QueueFinished"));

    let status = fixture.runner.status();
    assert_eq!(status.state, QueueState::Pending);
    assert_eq!(status.current_project_id, None);
}

#[tokio::test]
async fn chain_ends_where_the_guid_pointers_end() {
    let fixture = fixture("runner-unlinked");
    let id = fixture
        .insert(NewProject {
            project_key: "unlinked".to_string(),
            manager: None,
            global_vars: GlobalVars::new(),
            tasks: vec![fake(SUCCEED), fake(SUCCEED)],
        })
        .await;

    let result = fixture.runner.tick().await.unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Completed)));
    assert_eq!(
        fixture.task_statuses(id).await,
        [TaskStatus::Completed, TaskStatus::Pending]
    );
}

#[tokio::test]
async fn dangling_successor_completes_the_project() {
    let fixture = fixture("runner-dangling");
    let id = fixture
        .insert(NewProject {
            project_key: "dangling".to_string(),
            manager: None,
            global_vars: GlobalVars::new(),
            tasks: vec![fake(SUCCEED).guid("a").next("missing")],
        })
        .await;

    let result = fixture.runner.tick().await.unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Completed)));
}

#[tokio::test]
async fn failed_task_stops_the_chain() {
    let fixture = fixture("runner-failure");
    let id = fixture
        .insert(chained("failing", vec![fake(FAIL), fake(SUCCEED)]))
        .await;

    let result = fixture.runner.tick().await.unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Failed)));
    assert_eq!(
        fixture.task_statuses(id).await,
        [TaskStatus::Failed, TaskStatus::Pending]
    );
    assert_eq!(fixture.worker.seen_params().len(), 1);
    let names = fixture.notifier.names();
    assert!(!names.contains(&"Finished".to_string()));
    assert!(names.contains(&"QueueFinished".to_string()));
}

#[tokio::test]
async fn unknown_task_type_fails_the_project() {
    let fixture = fixture("runner-unknown-type");
    let id = fixture
        .insert(chained(
            "mystery",
            vec![NewTask::new("Mystery", 0).comment("odd one")],
        ))
        .await;
    let task = fixture.gateway.tasks_for_project(id).await.unwrap()[0].id;

    let result = fixture.runner.tick().await.unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Failed)));
    assert_eq!(fixture.task_statuses(id).await, [TaskStatus::Failed]);
    let reason = fixture.gateway.latest_task_log(task).await.unwrap().unwrap();
    assert!(reason.message.contains("Mystery"));
    assert!(
        fixture
            .notifier
            .names()
            .contains(&"Task odd one is failed".to_string())
    );
}

#[tokio::test]
async fn next_project_waits_for_queue_order() {
    let fixture = fixture("runner-order");
    let first = fixture.insert(chained("first", vec![fake(SUCCEED)])).await;
    let second = fixture.insert(chained("second", vec![fake(SUCCEED)])).await;

    assert_eq!(
        fixture.runner.tick().await.unwrap(),
        Some((first, ProjectStatus::Completed))
    );
    assert!(!fixture.notifier.names().contains(&"QueueFinished".to_string()));
    assert_eq!(
        fixture.runner.tick().await.unwrap(),
        Some((second, ProjectStatus::Completed))
    );
    assert_eq!(fixture.runner.tick().await.unwrap(), None);
}

#[tokio::test]
async fn paused_queue_does_not_dispatch() {
    let fixture = fixture("runner-paused");
    let id = fixture.insert(chained("later", vec![fake(SUCCEED)])).await;

    fixture.runner.pause();
    assert_eq!(fixture.runner.tick().await.unwrap(), None);
    assert_eq!(fixture.project_status(id).await, ProjectStatus::Pending);

    fixture.runner.unpause();
    assert_eq!(
        fixture.runner.tick().await.unwrap(),
        Some((id, ProjectStatus::Completed))
    );
}

#[tokio::test]
async fn pause_task_holds_the_chain_until_unpaused() {
    let fixture = fixture("runner-pause-task");
    let id = fixture
        .insert(chained(
            "pausing",
            vec![
                NewTask::new(QUEUE_TASK_TYPE, QueueAction::Pause.code()).comment("hold"),
                fake(SUCCEED),
            ],
        ))
        .await;

    let tick = fixture.spawn_tick();
    let runner = fixture.runner.clone();
    assert!(support::eventually(|| runner.status().state == QueueState::Paused).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fixture.worker.seen_params().is_empty());

    fixture.runner.unpause();
    let result = tokio::time::timeout(Duration::from_secs(2), tick)
        .await
        .expect("chain should resume")
        .unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Completed)));
    assert_eq!(fixture.worker.seen_params().len(), 1);
}

#[tokio::test]
async fn abort_finalizes_the_running_project_once() {
    let fixture = fixture("runner-abort");
    let id = fixture
        .insert(chained(
            "aborted",
            vec![fake(BLOCK_UNTIL_ABORT), fake(SUCCEED)],
        ))
        .await;

    let tick = fixture.spawn_tick();
    fixture.worker.wait_started().await;
    assert_eq!(fixture.runner.status().current_project_id, Some(id));

    fixture.runner.abort().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), tick)
        .await
        .expect("aborted project should unwind")
        .unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Aborted)));
    assert_eq!(fixture.project_status(id).await, ProjectStatus::Aborted);
    assert_eq!(
        fixture.task_statuses(id).await,
        [TaskStatus::Aborted, TaskStatus::Pending]
    );
    let aborted_events = fixture
        .notifier
        .names()
        .into_iter()
        .filter(|name| name == "Aborted")
        .count();
    assert_eq!(aborted_events, 1);
    assert!(fixture.notifier.names().contains(&"QueueFinished".to_string()));
    assert_eq!(fixture.runner.status().state, QueueState::Pending);
    assert_eq!(fixture.worker.seen_params().len(), 1);
}

#[tokio::test]
async fn abort_with_work_left_does_not_finish_the_queue() {
    let fixture = fixture("runner-abort-waiting");
    let id = fixture
        .insert(chained("aborted", vec![fake(BLOCK_UNTIL_ABORT)]))
        .await;
    let waiting = fixture.insert(chained("waiting", vec![fake(SUCCEED)])).await;

    let tick = fixture.spawn_tick();
    fixture.worker.wait_started().await;
    fixture.runner.abort().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), tick)
        .await
        .expect("aborted project should unwind")
        .unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Aborted)));
    assert_eq!(fixture.project_status(waiting).await, ProjectStatus::Pending);
    let names = fixture.notifier.names();
    assert!(names.contains(&"Aborted".to_string()));
    assert!(!names.contains(&"QueueFinished".to_string()));
}

#[tokio::test]
async fn abort_while_paused_between_tasks_ends_the_chain() {
    let fixture = fixture("runner-abort-paused");
    let id = fixture
        .insert(chained(
            "held",
            vec![
                NewTask::new(QUEUE_TASK_TYPE, QueueAction::Pause.code()).comment("hold"),
                fake(SUCCEED),
            ],
        ))
        .await;

    let tick = fixture.spawn_tick();
    let runner = fixture.runner.clone();
    assert!(support::eventually(|| runner.status().state == QueueState::Paused).await);

    fixture.runner.abort().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), tick)
        .await
        .expect("paused chain should unwind")
        .unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Aborted)));
    assert_eq!(fixture.project_status(id).await, ProjectStatus::Aborted);
    assert_eq!(
        fixture.task_statuses(id).await,
        [TaskStatus::Completed, TaskStatus::Pending]
    );
    assert!(fixture.worker.seen_params().is_empty());
    assert!(!fixture.notifier.names().contains(&"Finished".to_string()));
    assert_eq!(fixture.runner.status().state, QueueState::Pending);
}

#[tokio::test]
async fn dead_engine_fails_the_project_before_its_first_task() {
    let fixture = fixture("runner-engine-down");
    let id = fixture
        .insert(chained("offline", vec![fake(SUCCEED), fake(SUCCEED)]))
        .await;
    let first = fixture.gateway.tasks_for_project(id).await.unwrap()[0].id;
    fixture.engine.set_alive(false);

    let result = fixture.runner.tick().await.unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Failed)));
    assert_eq!(fixture.project_status(id).await, ProjectStatus::Failed);
    assert_eq!(
        fixture.task_statuses(id).await,
        [TaskStatus::Failed, TaskStatus::Pending]
    );
    assert!(fixture.worker.seen_params().is_empty());
    let latest = fixture.gateway.latest_task_log(first).await.unwrap().unwrap();
    assert_eq!(latest.message, "Build engine is not alive");
    assert_eq!(fixture.runner.status().state, QueueState::Pending);
}

#[tokio::test]
async fn task_clearing_its_successor_ends_the_chain() {
    let fixture = fixture("runner-redirect-none");
    let id = fixture
        .insert(chained(
            "rewired",
            vec![fake(REDIRECT).params(json!({ "next": null })), fake(SUCCEED)],
        ))
        .await;

    let result = fixture.runner.tick().await.unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Completed)));
    assert_eq!(
        fixture.task_statuses(id).await,
        [TaskStatus::Completed, TaskStatus::Pending]
    );
    assert_eq!(fixture.worker.seen_params().len(), 1);
}

#[tokio::test]
async fn task_redirecting_its_successor_skips_the_old_one() {
    let fixture = fixture("runner-redirect-c");
    let id = fixture
        .insert(NewProject {
            project_key: "detour".to_string(),
            manager: None,
            global_vars: GlobalVars::new(),
            tasks: vec![
                fake(REDIRECT)
                    .guid("a")
                    .next("b")
                    .params(json!({ "next": "c" })),
                fake(SUCCEED).guid("b").params(json!({ "step": "b" })),
                fake(SUCCEED).guid("c").params(json!({ "step": "c" })),
            ],
        })
        .await;

    let result = fixture.runner.tick().await.unwrap();

    assert_eq!(result, Some((id, ProjectStatus::Completed)));
    assert_eq!(
        fixture.task_statuses(id).await,
        [TaskStatus::Completed, TaskStatus::Pending, TaskStatus::Completed]
    );
    assert_eq!(
        fixture.worker.seen_params(),
        [json!({ "next": "c" }), json!({ "step": "c" })]
    );
}

#[tokio::test]
async fn recovery_disabled_aborts_leftover_work() {
    let fixture = fixture("runner-recovery-off");
    let id = fixture.insert(chained("leftover", vec![fake(SUCCEED)])).await;

    assert_eq!(fixture.runner.recover().await, RecoveryOutcome::AbortedAll(1));
    assert_eq!(fixture.project_status(id).await, ProjectStatus::Aborted);
}

#[tokio::test]
async fn recovery_flag_comes_from_the_engine() {
    let fixture = fixture("runner-recovery-engine");
    let id = fixture.insert(chained("interrupted", vec![fake(SUCCEED)])).await;
    fixture
        .gateway
        .update_project_status(id, ProjectStatus::Running)
        .await
        .unwrap();
    fixture.engine.set_recovery_enabled(true);

    assert_eq!(
        fixture.runner.recover().await,
        RecoveryOutcome::Recovered(Some(id))
    );
    assert_eq!(fixture.project_status(id).await, ProjectStatus::Pending);
}

#[tokio::test]
async fn started_runner_resumes_an_interrupted_project() {
    let fixture = fixture_with(
        "runner-resume",
        RunnerConfig {
            recovery_override: Some(true),
            ..support::fast_runner_config()
        },
    );
    let id = fixture
        .insert(chained("resumed", vec![fake(SUCCEED), fake(SUCCEED)]))
        .await;
    let tasks = fixture.gateway.tasks_for_project(id).await.unwrap();
    fixture
        .gateway
        .update_task_status(tasks[0].id, TaskStatus::Completed)
        .await
        .unwrap();
    fixture
        .gateway
        .update_task_status(tasks[1].id, TaskStatus::Running)
        .await
        .unwrap();
    fixture
        .gateway
        .update_project_status(id, ProjectStatus::Running)
        .await
        .unwrap();

    fixture.runner.start().await.unwrap();
    assert!(fixture.runner.is_started());

    let mut status = fixture.project_status(id).await;
    for _ in 0..100 {
        if status == ProjectStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = fixture.project_status(id).await;
    }
    assert_eq!(status, ProjectStatus::Completed);
    assert_eq!(fixture.worker.seen_params().len(), 1);

    fixture.runner.stop().await.unwrap();
    assert!(!fixture.runner.is_started());
    assert_eq!(fixture.runner.status().state, QueueState::Stopped);
}
