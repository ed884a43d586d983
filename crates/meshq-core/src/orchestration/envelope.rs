use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::engine::BuildEngine;
use crate::models::{CoreError, CoreErrorKind, TaskId, TaskLogLevel, TaskRecord, TaskStatus};
use crate::notify::{NotificationSink, QueueEvent};
use crate::orchestration::{AbortGate, OrchestrationResult};
use crate::persistence::StoreGateway;
use crate::workers::{TaskWorker, WorkerContext, WorkerResult};

pub const ENGINE_NOT_ALIVE: &str = "Build engine is not alive";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnvelopeConfig {
    pub health_probe_interval: Duration,
    /// Continuous engine downtime tolerated while a task runs.
    pub health_timeout: Duration,
    /// Pause after a task is marked completed.
    pub completion_delay: Duration,
    /// Upper bound on a worker's own abort routine.
    pub abort_timeout: Duration,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            health_probe_interval: Duration::from_secs(2),
            health_timeout: Duration::from_secs(30),
            completion_delay: Duration::from_secs(1),
            abort_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    Failed,
    Aborted,
}

enum RaceResult {
    Worker(WorkerResult<bool>),
    Aborted,
    EngineDown(Duration),
}

#[derive(Default)]
struct ActiveExecution {
    gate: Option<AbortGate>,
    task: Option<TaskId>,
}

/// Shared behavior around one worker: bookkeeping, health gating and abort racing.
///
/// Each envelope runs at most one task at a time.
pub struct ExecutionEnvelope {
    worker: Arc<dyn TaskWorker>,
    engine: Arc<dyn BuildEngine>,
    gateway: StoreGateway,
    notifier: Arc<dyn NotificationSink>,
    config: EnvelopeConfig,
    slot: tokio::sync::Mutex<()>,
    active: Mutex<ActiveExecution>,
}

/// Clears the active execution and the worker's task pointer on every exit path.
struct ActiveGuard<'a> {
    envelope: &'a ExecutionEnvelope,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.envelope.lock_active() = ActiveExecution::default();
        self.envelope.worker.reset();
    }
}

impl ExecutionEnvelope {
    pub fn new(
        worker: Arc<dyn TaskWorker>,
        engine: Arc<dyn BuildEngine>,
        gateway: StoreGateway,
        notifier: Arc<dyn NotificationSink>,
        config: EnvelopeConfig,
    ) -> Self {
        Self {
            worker,
            engine,
            gateway,
            notifier,
            config,
            slot: tokio::sync::Mutex::new(()),
            active: Mutex::new(ActiveExecution::default()),
        }
    }

    pub fn task_type(&self) -> &str {
        self.worker.task_type()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, ActiveExecution> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Task currently executing in this envelope.
    pub fn current_task(&self) -> Option<TaskId> {
        self.lock_active().task
    }

    pub fn is_busy(&self) -> bool {
        self.lock_active().gate.is_some()
    }

    /// Runs `task` to a terminal state and persists it.
    ///
    /// Worker and engine errors become a failed task; only persistence errors are
    /// returned.
    pub async fn execute(
        &self,
        ctx: &WorkerContext,
        task: &TaskRecord,
    ) -> OrchestrationResult<ExecutionOutcome> {
        let _slot = self.slot.lock().await;

        let gate = AbortGate::new();
        {
            let mut active = self.lock_active();
            active.gate = Some(gate.clone());
            active.task = Some(task.id);
        }
        let _guard = ActiveGuard { envelope: self };

        let started_at = SystemTime::now();
        self.gateway
            .update_task_times(task.id, started_at, None)
            .await?;

        let health = self.engine.health().await;
        if !health.alive {
            tracing::error!(
                project_id = ctx.project.id.0,
                task_id = task.id.0,
                "build engine is not alive, failing task"
            );
            self.finish(
                ctx,
                task,
                started_at,
                TaskStatus::Failed,
                ENGINE_NOT_ALIVE.to_string(),
            )
            .await?;
            return Ok(ExecutionOutcome::Failed);
        }

        self.transition(
            ctx,
            task,
            TaskStatus::Running,
            TaskLogLevel::Info,
            format!("Starting {} task: {}", task.task_type, task.label()),
        )
        .await?;

        let race = tokio::select! {
            biased;
            _ = gate.cancelled() => RaceResult::Aborted,
            downtime = self.watch_engine_health() => RaceResult::EngineDown(downtime),
            result = self.worker.start(ctx, task) => RaceResult::Worker(result),
        };

        let (status, message) = if gate.is_cancelled() {
            (TaskStatus::Aborted, "Task aborted".to_string())
        } else {
            match race {
                RaceResult::Aborted => (TaskStatus::Aborted, "Task aborted".to_string()),
                RaceResult::EngineDown(downtime) => (
                    TaskStatus::Failed,
                    format!(
                        "Task failed: build engine has been unreachable for more than {} seconds",
                        downtime.as_secs().max(self.config.health_timeout.as_secs())
                    ),
                ),
                RaceResult::Worker(Ok(true)) => (
                    TaskStatus::Completed,
                    "Task completed successfully".to_string(),
                ),
                RaceResult::Worker(Ok(false)) => (TaskStatus::Failed, "Task failed".to_string()),
                RaceResult::Worker(Err(error)) if error.is_cancellation() => (
                    TaskStatus::Aborted,
                    format!("Task aborted: {}", error.message),
                ),
                RaceResult::Worker(Err(error)) => {
                    if error.kind == CoreErrorKind::EngineFailure {
                        self.notifier.broadcast(QueueEvent::EngineMessage {
                            message: error.message.clone(),
                        });
                    }
                    (TaskStatus::Failed, format!("Task failed: {}", error.message))
                }
            }
        };

        self.finish(ctx, task, started_at, status, message).await?;

        Ok(match status {
            TaskStatus::Completed => ExecutionOutcome::Completed,
            TaskStatus::Aborted => ExecutionOutcome::Aborted,
            _ => ExecutionOutcome::Failed,
        })
    }

    /// Interrupts the running task, if any.
    ///
    /// Always returns a cancellation error so the caller observes the abort even when
    /// the execution has not unwound yet.
    pub async fn abort(&self) -> OrchestrationResult<()> {
        let (gate, task) = {
            let active = self.lock_active();
            (active.gate.clone(), active.task)
        };

        if let Some(gate) = &gate {
            gate.request();
        }

        match tokio::time::timeout(self.config.abort_timeout, self.worker.abort()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(
                    task_type = self.worker.task_type(),
                    task_id = ?task,
                    kind = ?error.kind,
                    message = %error.message,
                    "worker abort reported an error"
                );
            }
            Err(_) => {
                tracing::warn!(
                    task_type = self.worker.task_type(),
                    task_id = ?task,
                    timeout_ms = self.config.abort_timeout.as_millis() as u64,
                    "worker abort timed out"
                );
            }
        }

        if let Some(gate) = gate {
            gate.fire();
        }

        let error = CoreError::cancelled("Task aborted");
        Err(match task {
            Some(task) => error.for_task(task),
            None => error,
        })
    }

    pub async fn stop(&self) -> OrchestrationResult<()> {
        self.worker.stop().await
    }

    /// Resolves with the observed downtime once the engine stayed unreachable for longer
    /// than the configured timeout.
    async fn watch_engine_health(&self) -> Duration {
        let mut last_healthy = Instant::now();
        loop {
            tokio::time::sleep(self.config.health_probe_interval).await;
            if self.engine.health().await.alive {
                last_healthy = Instant::now();
                continue;
            }

            let downtime = last_healthy.elapsed();
            tracing::warn!(
                downtime_ms = downtime.as_millis() as u64,
                "build engine health probe failed"
            );
            if downtime > self.config.health_timeout {
                return downtime;
            }
        }
    }

    async fn transition(
        &self,
        ctx: &WorkerContext,
        task: &TaskRecord,
        status: TaskStatus,
        level: TaskLogLevel,
        message: String,
    ) -> OrchestrationResult<()> {
        tracing::info!(
            project_id = ctx.project.id.0,
            task_id = task.id.0,
            task_type = %task.task_type,
            status = status.as_str(),
            message = %message,
            "task status changed"
        );
        self.gateway
            .append_log(task.id, Some(status), level, message.clone())
            .await?;
        self.gateway.update_task_status(task.id, status).await?;

        self.notifier.broadcast(QueueEvent::TaskStatus {
            project_id: ctx.project.id,
            task_id: task.id,
            label: task.label().to_string(),
            status,
            reason: (status == TaskStatus::Failed).then_some(message),
        });
        Ok(())
    }

    async fn finish(
        &self,
        ctx: &WorkerContext,
        task: &TaskRecord,
        started_at: SystemTime,
        status: TaskStatus,
        message: String,
    ) -> OrchestrationResult<()> {
        self.gateway
            .update_task_times(task.id, started_at, Some(SystemTime::now()))
            .await?;

        let level = match status {
            TaskStatus::Failed => TaskLogLevel::Error,
            TaskStatus::Aborted => TaskLogLevel::Warning,
            _ => TaskLogLevel::Info,
        };
        self.transition(ctx, task, status, level, message).await?;

        if status == TaskStatus::Completed {
            tokio::time::sleep(self.config.completion_delay).await;
        }
        Ok(())
    }
}
