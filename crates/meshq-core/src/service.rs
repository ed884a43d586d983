use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::engine::BuildEngine;
use crate::ingest::{IngestContext, normalize_submission};
use crate::models::{
    CoreError, GlobalVars, NewTask, Project, ProjectId, ProjectSelector, ProjectStatus, QueueState,
    QueueStatus, TaskId, TaskLogRecord, TaskRecord, TaskStatus,
};
use crate::notify::{NotificationSink, QueueEvent};
use crate::orchestration::{OrchestrationResult, QueueRunner};
use crate::persistence::StoreGateway;

/// Persisted queue plus the runner's live state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub status: QueueStatus,
    pub projects: Vec<Project>,
}

/// Operator-facing entry points over a running queue.
#[derive(Clone)]
pub struct QueueService {
    runner: QueueRunner,
}

impl QueueService {
    pub fn new(runner: QueueRunner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &QueueRunner {
        &self.runner
    }

    fn gateway(&self) -> &StoreGateway {
        self.runner.gateway()
    }

    fn notifier(&self) -> &Arc<dyn NotificationSink> {
        self.runner.notifier()
    }

    fn engine(&self) -> &Arc<dyn BuildEngine> {
        self.runner.engine()
    }

    pub fn status(&self) -> QueueStatus {
        self.runner.status()
    }

    pub async fn queue(&self) -> OrchestrationResult<QueueSnapshot> {
        let projects = self.gateway().list_projects().await?;
        Ok(QueueSnapshot {
            status: self.status(),
            projects,
        })
    }

    pub fn pause(&self) {
        self.runner.pause();
    }

    pub fn unpause(&self) {
        self.runner.unpause();
    }

    pub async fn abort(&self) -> OrchestrationResult<()> {
        self.runner.abort().await
    }

    /// Ingests a submission with keywords resolved against this host and the engine
    /// version reported by the health probe.
    pub async fn enqueue(&self, submission: &Value) -> OrchestrationResult<Vec<ProjectId>> {
        let version = self.engine().health().await.version.unwrap_or_default();
        let ctx = IngestContext::detect(version);
        self.enqueue_with(submission, &ctx).await
    }

    pub async fn enqueue_with(
        &self,
        submission: &Value,
        ctx: &IngestContext,
    ) -> OrchestrationResult<Vec<ProjectId>> {
        let projects = normalize_submission(submission, ctx)?;
        let ids = self.gateway().insert_projects(projects).await?;

        tracing::info!(projects = ids.len(), "queue submission ingested");
        self.notifier().broadcast(QueueEvent::AddProjects {
            project_ids: ids.clone(),
        });
        Ok(ids)
    }

    /// Swaps the queue positions of two projects.
    ///
    /// When either one is being processed it is aborted first and put back to pending
    /// together with its running task.
    pub async fn switch_projects(
        &self,
        first: ProjectId,
        second: ProjectId,
    ) -> OrchestrationResult<()> {
        let snapshot = self.status();
        let active = snapshot
            .current_project_id
            .filter(|project| *project == first || *project == second);

        let Some(active) = active else {
            return self.gateway().switch_projects(first, second).await;
        };

        tracing::info!(
            project_id = active.0,
            "switching the active project, aborting it first"
        );
        let abort_result = self.runner.abort().await;
        if let Err(error) = &abort_result {
            tracing::warn!(message = %error.message, "abort before switch reported an error");
        }

        let _dispatch = self.runner.hold_dispatch().await;
        if let Some(task) = snapshot.current_task_id {
            self.gateway()
                .update_task_status(task, TaskStatus::Pending)
                .await?;
        }
        self.gateway()
            .update_project_status(active, ProjectStatus::Pending)
            .await?;
        self.gateway().switch_projects(first, second).await?;

        match abort_result {
            Err(error) if !error.is_cancellation() => Err(error),
            _ => Ok(()),
        }
    }

    pub async fn rerun(&self, project: ProjectId, from: Option<TaskId>) -> OrchestrationResult<()> {
        self.gateway().rerun_from_task(project, from).await
    }

    pub async fn append_tasks(
        &self,
        project: ProjectSelector,
        tasks: Vec<NewTask>,
    ) -> OrchestrationResult<Vec<TaskRecord>> {
        let inserted = self.gateway().append_tasks(project, tasks).await?;
        if let Some(first) = inserted.first() {
            self.notifier().broadcast(QueueEvent::AddTasks {
                project_id: first.project_id,
                task_ids: inserted.iter().map(|task| task.id).collect(),
            });
        }
        Ok(inserted)
    }

    pub async fn set_next_task_guid(
        &self,
        task: TaskId,
        next: Option<String>,
    ) -> OrchestrationResult<()> {
        self.gateway().update_task_next_guid(task, next).await
    }

    /// Points `task` at the task called `name` in the same project.
    pub async fn set_next_task_by_name(&self, task: TaskId, name: &str) -> OrchestrationResult<()> {
        let record = self
            .gateway()
            .task(task)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {} not found", task.0)))?;
        let next = self
            .gateway()
            .task_by_name(record.project_id, name)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!(
                    "task named '{name}' not found in project {}",
                    record.project_id.0
                ))
            })?;
        self.set_next_task_guid(task, Some(next.guid)).await
    }

    fn require_current_task(&self) -> OrchestrationResult<TaskId> {
        self.runner
            .control()
            .current_task()
            .ok_or_else(|| CoreError::invalid_input("No task is currently running"))
    }

    pub async fn set_next_task_guid_for_current(
        &self,
        next: Option<String>,
    ) -> OrchestrationResult<()> {
        let task = self.require_current_task()?;
        self.set_next_task_guid(task, next).await
    }

    pub async fn set_next_task_by_name_for_current(&self, name: &str) -> OrchestrationResult<()> {
        let task = self.require_current_task()?;
        self.set_next_task_by_name(task, name).await
    }

    pub async fn global_vars(&self, project: ProjectId) -> OrchestrationResult<GlobalVars> {
        self.gateway().global_vars(project).await
    }

    pub async fn set_global_vars(
        &self,
        project: ProjectId,
        vars: GlobalVars,
    ) -> OrchestrationResult<()> {
        self.gateway().set_global_vars(project, vars).await
    }

    pub async fn remove_project(&self, project: ProjectId) -> OrchestrationResult<()> {
        self.gateway().remove_project(project).await
    }

    /// Deletes every pending project with dispatch paused for the duration.
    pub async fn remove_pending_projects(&self) -> OrchestrationResult<usize> {
        let already_paused = self.runner.control().state() == QueueState::Paused;
        if !already_paused {
            self.runner.pause();
        }
        let result = self.gateway().remove_pending_projects().await;
        if !already_paused {
            self.runner.unpause();
        }

        if let Ok(count) = result {
            tracing::info!(removed = count, "pending projects removed");
        }
        result
    }

    /// Message of the most recent log line of `task`, used as the failure reason.
    pub async fn failure_reason(&self, task: TaskId) -> OrchestrationResult<Option<String>> {
        Ok(self
            .gateway()
            .latest_task_log(task)
            .await?
            .map(|log| log.message))
    }

    pub async fn task_logs(&self, task: TaskId) -> OrchestrationResult<Vec<TaskLogRecord>> {
        self.gateway().list_task_logs(task).await
    }
}
