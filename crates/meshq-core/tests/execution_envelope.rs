mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use meshq_core::models::{
    CoreErrorKind, GlobalVars, NewProject, NewTask, Project, TaskRecord, TaskStatus,
};
use meshq_core::notify::QueueEvent;
use meshq_core::orchestration::{
    ENGINE_NOT_ALIVE, ExecutionEnvelope, ExecutionOutcome, QueueControl,
};
use meshq_core::persistence::StoreGateway;
use meshq_core::workers::WorkerContext;

use support::{
    BLOCK_UNTIL_ABORT, CANCELLED, FAIL, FAKE_TASK_TYPE, FakeEngine, FakeWorker, RETURN_FALSE,
    RecordingNotifier, SUCCEED,
};

struct Harness {
    gateway: StoreGateway,
    engine: Arc<FakeEngine>,
    notifier: Arc<RecordingNotifier>,
    worker: Arc<FakeWorker>,
    envelope: Arc<ExecutionEnvelope>,
    ctx: WorkerContext,
    project: Project,
}

async fn harness(test_name: &str, actions: &[i64]) -> Harness {
    let gateway = support::gateway(test_name);
    let tasks = actions
        .iter()
        .map(|action| {
            NewTask::new(FAKE_TASK_TYPE, *action)
                .comment(format!("fake {action}"))
                .params(json!({ "value": "$$site$$" }))
        })
        .collect();
    let ids = gateway
        .insert_projects(vec![NewProject {
            project_key: test_name.to_string(),
            manager: None,
            global_vars: GlobalVars::new(),
            tasks,
        }])
        .await
        .expect("insert should succeed");
    let project = gateway
        .project(ids[0])
        .await
        .expect("load should succeed")
        .expect("project exists");

    let engine = Arc::new(FakeEngine::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let worker = Arc::new(FakeWorker::default());
    let envelope = Arc::new(ExecutionEnvelope::new(
        worker.clone(),
        engine.clone(),
        gateway.clone(),
        notifier.clone(),
        support::fast_envelope_config(),
    ));
    let ctx = WorkerContext {
        gateway: gateway.clone(),
        notifier: notifier.clone(),
        control: QueueControl::new(),
        project: project.clone(),
    };

    Harness {
        gateway,
        engine,
        notifier,
        worker,
        envelope,
        ctx,
        project,
    }
}

impl Harness {
    fn task(&self, index: usize) -> TaskRecord {
        self.project.tasks[index].clone()
    }

    async fn stored(&self, index: usize) -> TaskRecord {
        self.gateway
            .task(self.project.tasks[index].id)
            .await
            .expect("load should succeed")
            .expect("task exists")
    }

    async fn latest_message(&self, index: usize) -> String {
        self.gateway
            .latest_task_log(self.project.tasks[index].id)
            .await
            .expect("load should succeed")
            .expect("log exists")
            .message
    }
}

#[tokio::test]
async fn successful_task_is_completed_and_timed() {
    let harness = harness("envelope-success", &[SUCCEED]).await;

    let outcome = harness
        .envelope
        .execute(&harness.ctx, &harness.task(0))
        .await
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Completed);
    let stored = harness.stored(0).await;
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at >= stored.started_at);
    assert_eq!(
        harness.latest_message(0).await,
        "Task completed successfully"
    );
    assert_eq!(
        harness.notifier.names(),
        ["Task fake 0 is running", "Task fake 0 is completed"]
    );
    assert!(harness.worker.resets() >= 1);
    assert!(!harness.envelope.is_busy());
}

#[tokio::test]
async fn false_result_and_worker_errors_fail_the_task() {
    let harness = harness("envelope-failures", &[RETURN_FALSE, FAIL]).await;

    let outcome = harness
        .envelope
        .execute(&harness.ctx, &harness.task(0))
        .await
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Failed);
    assert_eq!(harness.latest_message(0).await, "Task failed");

    let outcome = harness
        .envelope
        .execute(&harness.ctx, &harness.task(1))
        .await
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Failed);
    assert_eq!(harness.stored(1).await.status, TaskStatus::Failed);
    assert_eq!(harness.latest_message(1).await, "Task failed: boom");

    let reasons = harness
        .notifier
        .events()
        .into_iter()
        .filter_map(|event| match event {
            QueueEvent::TaskStatus {
                status: TaskStatus::Failed,
                reason,
                ..
            } => reason,
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(reasons, ["Task failed", "Task failed: boom"]);
}

#[tokio::test]
async fn dead_engine_fails_before_the_worker_runs() {
    let harness = harness("envelope-dead-engine", &[SUCCEED]).await;
    harness.engine.set_alive(false);

    let outcome = harness
        .envelope
        .execute(&harness.ctx, &harness.task(0))
        .await
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Failed);
    assert_eq!(harness.latest_message(0).await, ENGINE_NOT_ALIVE);
    assert!(harness.worker.seen_params().is_empty());
    assert_eq!(harness.stored(0).await.status, TaskStatus::Failed);
}

#[tokio::test]
async fn engine_lost_mid_task_fails_it() {
    let harness = harness("envelope-engine-lost", &[BLOCK_UNTIL_ABORT]).await;

    let execution = {
        let envelope = harness.envelope.clone();
        let ctx = harness.ctx.clone();
        let task = harness.task(0);
        tokio::spawn(async move { envelope.execute(&ctx, &task).await })
    };
    harness.worker.wait_started().await;
    harness.engine.set_alive(false);

    let outcome = tokio::time::timeout(Duration::from_secs(2), execution)
        .await
        .expect("health watchdog should end the task")
        .expect("task should not panic")
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Failed);
    let message = harness.latest_message(0).await;
    assert!(message.starts_with("Task failed: build engine has been unreachable"));
    assert!(harness.engine.health_probes() >= 3);
}

#[tokio::test]
async fn abort_wins_even_when_the_worker_then_succeeds() {
    let harness = harness("envelope-abort", &[BLOCK_UNTIL_ABORT]).await;

    let execution = {
        let envelope = harness.envelope.clone();
        let ctx = harness.ctx.clone();
        let task = harness.task(0);
        tokio::spawn(async move { envelope.execute(&ctx, &task).await })
    };
    harness.worker.wait_started().await;
    assert_eq!(harness.envelope.current_task(), Some(harness.task(0).id));

    let error = harness.envelope.abort().await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Cancelled);
    assert_eq!(error.task, Some(harness.task(0).id));

    let outcome = tokio::time::timeout(Duration::from_secs(2), execution)
        .await
        .expect("aborted task should unwind")
        .expect("task should not panic")
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Aborted);
    assert_eq!(harness.stored(0).await.status, TaskStatus::Aborted);
    assert_eq!(harness.latest_message(0).await, "Task aborted");
    assert_eq!(harness.worker.abort_calls(), 1);
    assert_eq!(harness.envelope.current_task(), None);
}

#[tokio::test]
async fn cancelled_worker_error_counts_as_aborted() {
    let harness = harness("envelope-cancelled", &[CANCELLED]).await;

    let outcome = harness
        .envelope
        .execute(&harness.ctx, &harness.task(0))
        .await
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Aborted);
    assert_eq!(
        harness.latest_message(0).await,
        "Task aborted: Task was aborted"
    );
}

#[tokio::test]
async fn abort_without_running_task_still_reports_cancellation() {
    let harness = harness("envelope-idle-abort", &[SUCCEED]).await;

    let error = harness.envelope.abort().await.unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::Cancelled);
    assert_eq!(error.task, None);
    assert_eq!(harness.worker.abort_calls(), 1);
}
