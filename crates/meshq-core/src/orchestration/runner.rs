use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::BuildEngine;
use crate::models::{
    CURRENT_TASK_ID_VAR, GlobalVars, PROJECT_TASKS_VAR, Project, ProjectId, ProjectStatus,
    QueueState, QueueStatus, TaskId, TaskLogLevel, TaskRecord, TaskStatus,
};
use crate::notify::{NotificationSink, QueueEvent};
use crate::orchestration::substitution::substitute;
use crate::orchestration::{ExecutionEnvelope, ExecutionOutcome, OrchestrationResult, QueueControl};
use crate::persistence::StoreGateway;
use crate::registry::WorkerRegistry;
use crate::workers::WorkerContext;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub pause_poll_interval: Duration,
    /// Pause after every task before the chain advances.
    pub post_task_delay: Duration,
    pub recovery_flag_timeout: Duration,
    /// Replaces the engine-provided recovery flag when set.
    pub recovery_override: Option<bool>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            pause_poll_interval: Duration::from_secs(1),
            post_task_delay: Duration::from_secs(2),
            recovery_flag_timeout: Duration::from_secs(5),
            recovery_override: None,
        }
    }
}

/// What startup recovery did with work left over from a previous process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryOutcome {
    Recovered(Option<ProjectId>),
    AbortedAll(usize),
    Failed,
}

struct ActiveRun {
    project: ProjectId,
    project_key: String,
    /// Set by `abort` before it finalizes; outlives the finalize claim.
    aborted: Arc<AtomicBool>,
}

struct RunnerInner {
    gateway: StoreGateway,
    registry: Arc<WorkerRegistry>,
    engine: Arc<dyn BuildEngine>,
    notifier: Arc<dyn NotificationSink>,
    control: QueueControl,
    config: RunnerConfig,
    started: AtomicBool,
    stopping: AtomicBool,
    dispatch: tokio::sync::Mutex<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    envelope: Mutex<Option<Arc<ExecutionEnvelope>>>,
    active_run: Mutex<Option<ActiveRun>>,
}

/// Drives the queue: polls for the next pending project and walks its task chain.
///
/// Cloning yields another handle to the same runner.
#[derive(Clone)]
pub struct QueueRunner {
    inner: Arc<RunnerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QueueRunner {
    pub fn new(
        gateway: StoreGateway,
        registry: Arc<WorkerRegistry>,
        engine: Arc<dyn BuildEngine>,
        notifier: Arc<dyn NotificationSink>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                gateway,
                registry,
                engine,
                notifier,
                control: QueueControl::new(),
                config,
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                dispatch: tokio::sync::Mutex::new(()),
                loop_handle: Mutex::new(None),
                envelope: Mutex::new(None),
                active_run: Mutex::new(None),
            }),
        }
    }

    pub fn control(&self) -> &QueueControl {
        &self.inner.control
    }

    pub fn gateway(&self) -> &StoreGateway {
        &self.inner.gateway
    }

    pub fn notifier(&self) -> &Arc<dyn NotificationSink> {
        &self.inner.notifier
    }

    pub fn engine(&self) -> &Arc<dyn BuildEngine> {
        &self.inner.engine
    }

    /// Waits for the project being processed to unwind, then keeps new projects from
    /// being dispatched until the guard is dropped.
    pub async fn hold_dispatch(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.dispatch.lock().await
    }

    pub fn status(&self) -> QueueStatus {
        self.inner.control.snapshot()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Runs startup recovery and spawns the polling loop. Calling it again is a no-op.
    pub async fn start(&self) -> OrchestrationResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.inner.control.set_state(QueueState::Pending, true);

        let recovery = self.recover().await;
        tracing::info!(outcome = ?recovery, "queue recovery finished");

        let runner = self.clone();
        let handle = tokio::spawn(async move { runner.run_loop().await });
        *lock(&self.inner.loop_handle) = Some(handle);
        Ok(())
    }

    /// Applies the recovery policy to projects left over from an earlier process.
    pub async fn recover(&self) -> RecoveryOutcome {
        let enabled = match self.inner.config.recovery_override {
            Some(enabled) => enabled,
            None => {
                match tokio::time::timeout(
                    self.inner.config.recovery_flag_timeout,
                    self.inner.engine.queue_recovery_enabled(),
                )
                .await
                {
                    Ok(Ok(enabled)) => enabled,
                    Ok(Err(error)) => {
                        tracing::warn!(
                            kind = ?error.kind,
                            message = %error.message,
                            "could not read queue recovery flag, assuming disabled"
                        );
                        false
                    }
                    Err(_) => {
                        tracing::warn!("queue recovery flag request timed out, assuming disabled");
                        false
                    }
                }
            }
        };

        let gateway = &self.inner.gateway;
        if enabled {
            match gateway.recover_interrupted_project().await {
                Ok(project) => RecoveryOutcome::Recovered(project),
                Err(error) => {
                    tracing::error!(message = %error.message, "queue recovery failed");
                    RecoveryOutcome::Failed
                }
            }
        } else {
            match gateway.abort_all_projects().await {
                Ok(count) => RecoveryOutcome::AbortedAll(count),
                Err(error) => {
                    tracing::error!(message = %error.message, "aborting leftover projects failed");
                    RecoveryOutcome::Failed
                }
            }
        }
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.inner.stopping.load(Ordering::SeqCst) {
                break;
            }
            if let Err(error) = self.tick().await {
                tracing::error!(
                    kind = ?error.kind,
                    message = %error.message,
                    "error in queue processing loop"
                );
            }
        }
        tracing::info!("queue polling loop stopped");
    }

    /// One polling step: processes the next pending project unless the queue is busy,
    /// paused or aborting. Returns the project and its terminal status.
    pub async fn tick(&self) -> OrchestrationResult<Option<(ProjectId, ProjectStatus)>> {
        if self.inner.control.state().blocks_dispatch() {
            return Ok(None);
        }
        let Ok(_dispatch) = self.inner.dispatch.try_lock() else {
            return Ok(None);
        };

        let Some(project) = self.inner.gateway.next_pending_project().await? else {
            return Ok(None);
        };
        let status = self.process_project(project.clone()).await;
        Ok(Some((project.id, status)))
    }

    async fn process_project(&self, project: Project) -> ProjectStatus {
        match self.run_project(&project).await {
            Ok(status) => status,
            Err(error) => {
                tracing::error!(
                    project_id = project.id.0,
                    kind = ?error.kind,
                    message = %error.message,
                    "error processing project"
                );
                if let Err(error) = self
                    .inner
                    .gateway
                    .update_project_status(project.id, ProjectStatus::Failed)
                    .await
                {
                    tracing::error!(
                        project_id = project.id.0,
                        message = %error.message,
                        "failed to mark project as failed"
                    );
                }
                lock(&self.inner.active_run).take();
                self.inner.control.set_state(QueueState::Pending, false);
                self.inner.control.clear_current();
                ProjectStatus::Failed
            }
        }
    }

    async fn run_project(&self, project: &Project) -> OrchestrationResult<ProjectStatus> {
        let control = &self.inner.control;

        self.inner
            .gateway
            .update_project_status(project.id, ProjectStatus::Running)
            .await?;
        control.set_state(QueueState::Running, false);
        control.set_current_project(project.id, &project.project_key);
        let aborted = Arc::new(AtomicBool::new(false));
        *lock(&self.inner.active_run) = Some(ActiveRun {
            project: project.id,
            project_key: project.project_key.clone(),
            aborted: aborted.clone(),
        });

        tracing::info!(
            project_id = project.id.0,
            project_key = %project.project_key,
            tasks = project.tasks.len(),
            "processing project"
        );

        self.initialize_globals(project).await?;
        let status = self.traverse(project, &aborted).await?;
        self.finalize(project.id, status).await?;
        Ok(status)
    }

    async fn initialize_globals(&self, project: &Project) -> OrchestrationResult<GlobalVars> {
        let index = project
            .tasks
            .iter()
            .map(|task| (task.id.0.to_string(), Value::String(task.guid.clone())))
            .collect::<serde_json::Map<_, _>>();

        let mut patch = GlobalVars::new();
        patch.insert(CURRENT_TASK_ID_VAR.to_string(), Value::Null);
        patch.insert(PROJECT_TASKS_VAR.to_string(), Value::Object(index));
        self.inner.gateway.merge_global_vars(project.id, patch).await
    }

    async fn traverse(
        &self,
        project: &Project,
        aborted: &AtomicBool,
    ) -> OrchestrationResult<ProjectStatus> {
        let control = &self.inner.control;
        let gateway = &self.inner.gateway;
        let total = project.tasks.len().max(1);
        let mut executed = 0usize;
        let mut current = project.first_pending_task().cloned();

        let halted = || {
            self.inner.stopping.load(Ordering::SeqCst)
                || aborted.load(Ordering::SeqCst)
                || control.state() == QueueState::Aborting
        };

        while let Some(task) = current.take() {
            if halted() {
                return Ok(ProjectStatus::Aborted);
            }
            self.wait_while_paused().await;
            if halted() {
                return Ok(ProjectStatus::Aborted);
            }

            control.set_current_task(Some(task.id));
            let globals = gateway
                .set_global_var(project.id, CURRENT_TASK_ID_VAR, Value::from(task.id.0))
                .await?;

            let mut prepared = task.clone();
            prepared.task_params = substitute(&task.task_params, &globals);

            let envelope = match self.inner.registry.resolve(&task.task_type) {
                Ok(envelope) => envelope,
                Err(error) => {
                    self.fail_unresolved_task(project, &task, &error.message)
                        .await?;
                    return Ok(ProjectStatus::Failed);
                }
            };

            let ctx = WorkerContext {
                gateway: gateway.clone(),
                notifier: self.inner.notifier.clone(),
                control: control.clone(),
                project: project.clone(),
            };

            *lock(&self.inner.envelope) = Some(envelope.clone());
            let outcome = envelope.execute(&ctx, &prepared).await;
            lock(&self.inner.envelope).take();
            let outcome = outcome?;

            tokio::time::sleep(self.inner.config.post_task_delay).await;

            executed += 1;
            control.set_progress(((executed * 100) / total).min(100) as u8);

            match outcome {
                ExecutionOutcome::Completed => {}
                ExecutionOutcome::Failed => return Ok(ProjectStatus::Failed),
                ExecutionOutcome::Aborted => return Ok(ProjectStatus::Aborted),
            }
            if aborted.load(Ordering::SeqCst) {
                return Ok(ProjectStatus::Aborted);
            }

            current = self.next_task(project.id, task.id).await?;
        }

        Ok(ProjectStatus::Completed)
    }

    /// Follows the successor pointer of the persisted task, which the task itself may
    /// have rewritten while it ran.
    async fn next_task(
        &self,
        project: ProjectId,
        task: TaskId,
    ) -> OrchestrationResult<Option<TaskRecord>> {
        let gateway = &self.inner.gateway;
        let Some(fresh) = gateway.task(task).await? else {
            return Ok(None);
        };
        let Some(guid) = fresh.next_task_guid else {
            return Ok(None);
        };

        let next = gateway.task_by_guid(project, &guid).await?;
        if next.is_none() {
            tracing::warn!(
                project_id = project.0,
                task_id = task.0,
                next_task_guid = %guid,
                "successor task not found, ending chain"
            );
        }
        Ok(next)
    }

    async fn wait_while_paused(&self) {
        while self.inner.control.state() == QueueState::Paused {
            if self.inner.stopping.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(self.inner.config.pause_poll_interval).await;
        }
    }

    async fn fail_unresolved_task(
        &self,
        project: &Project,
        task: &TaskRecord,
        reason: &str,
    ) -> OrchestrationResult<()> {
        tracing::error!(
            project_id = project.id.0,
            task_id = task.id.0,
            task_type = %task.task_type,
            "no worker for task type"
        );
        let gateway = &self.inner.gateway;
        gateway
            .append_log(task.id, Some(TaskStatus::Failed), TaskLogLevel::Error, reason)
            .await?;
        gateway.update_task_status(task.id, TaskStatus::Failed).await?;
        self.inner.notifier.broadcast(QueueEvent::TaskStatus {
            project_id: project.id,
            task_id: task.id,
            label: task.label().to_string(),
            status: TaskStatus::Failed,
            reason: Some(reason.to_string()),
        });
        Ok(())
    }

    /// Writes the project's terminal state once; later calls for the same run are no-ops.
    async fn finalize(&self, project: ProjectId, status: ProjectStatus) -> OrchestrationResult<()> {
        let claimed = {
            let mut active = lock(&self.inner.active_run);
            if active.as_ref().is_some_and(|run| run.project == project) {
                active.take()
            } else {
                None
            }
        };
        let Some(run) = claimed else {
            return Ok(());
        };

        let gateway = &self.inner.gateway;
        gateway
            .set_global_var(project, CURRENT_TASK_ID_VAR, Value::Null)
            .await?;
        gateway.update_project_status(project, status).await?;

        tracing::info!(
            project_id = project.0,
            project_key = %run.project_key,
            status = status.as_str(),
            "project finished"
        );

        match status {
            ProjectStatus::Completed => self.inner.notifier.broadcast(QueueEvent::Finished {
                project_id: project,
                project_key: run.project_key,
            }),
            ProjectStatus::Aborted => self.inner.notifier.broadcast(QueueEvent::Aborted {
                project_id: project,
                project_key: run.project_key,
            }),
            _ => {}
        }

        if gateway.count_pending_projects().await? == 0 {
            self.inner.notifier.broadcast(QueueEvent::QueueFinished);
        }

        self.inner.control.set_state(QueueState::Pending, false);
        self.inner.control.clear_current();
        Ok(())
    }

    pub fn pause(&self) {
        tracing::info!("pausing queue");
        self.inner.control.pause();
    }

    pub fn unpause(&self) {
        tracing::info!("resuming queue");
        self.inner.control.unpause();
    }

    /// Aborts the running task and finalizes the active project as aborted.
    pub async fn abort(&self) -> OrchestrationResult<()> {
        let control = &self.inner.control;
        let project = control.current_project();
        tracing::warn!(project_id = ?project.map(|id| id.0), "aborting queue");

        control.set_state(QueueState::Aborting, true);
        if let Some(run) = lock(&self.inner.active_run).as_ref() {
            run.aborted.store(true, Ordering::SeqCst);
        }

        let envelope = lock(&self.inner.envelope).clone();
        if let Some(envelope) = envelope
            && let Err(error) = envelope.abort().await
        {
            tracing::debug!(message = %error.message, "abort delivered to worker");
        }

        let result = match project {
            Some(project) => self.finalize(project, ProjectStatus::Aborted).await,
            None => Ok(()),
        };

        let current = control.current_project();
        if current.is_none() || current == project {
            control.set_state(QueueState::Pending, false);
        }
        result
    }

    /// Stops polling and asks the running worker to stop, then waits for the loop to exit.
    pub async fn stop(&self) -> OrchestrationResult<()> {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.started.store(false, Ordering::SeqCst);

        let envelope = lock(&self.inner.envelope).clone();
        let stop_result = match envelope {
            Some(envelope) => envelope.stop().await,
            None => Ok(()),
        };
        self.inner.control.set_state(QueueState::Stopped, true);

        let handle = lock(&self.inner.loop_handle).take();
        if let Some(handle) = handle
            && let Err(error) = handle.await
        {
            tracing::error!(message = %error, "queue loop ended abnormally");
        }
        stop_result
    }
}
