pub mod params;
pub mod photomesh;
pub mod script;

pub use photomesh::{PhotoMeshAction, PhotoMeshWorker};
pub use script::{QueueAction, ScriptWorker, ScriptWorkerConfig};

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{CoreError, CoreErrorKind, Project, TaskLogLevel, TaskRecord};
use crate::notify::NotificationSink;
use crate::orchestration::QueueControl;
use crate::persistence::StoreGateway;

pub type WorkerResult<T> = Result<T, CoreError>;

/// Collaborators handed to a worker for one execution.
#[derive(Clone)]
pub struct WorkerContext {
    pub gateway: StoreGateway,
    pub notifier: Arc<dyn NotificationSink>,
    pub control: QueueControl,
    pub project: Project,
}

impl WorkerContext {
    /// Appends a progress line to the task's log without changing its status.
    pub async fn log(&self, task: &TaskRecord, level: TaskLogLevel, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(
            project_id = self.project.id.0,
            task_id = task.id.0,
            message = %message,
            "worker progress"
        );
        if let Err(error) = self.gateway.append_log(task.id, None, level, message).await {
            tracing::warn!(task_id = task.id.0, message = %error.message, "failed to persist task log");
        }
    }
}

/// Type-specific task logic. One instance per task type serves every task of that type.
#[async_trait]
pub trait TaskWorker: Send + Sync {
    fn task_type(&self) -> &str;

    /// Performs the task; `Ok(false)` is a plain failure without a reason.
    async fn start(&self, ctx: &WorkerContext, task: &TaskRecord) -> WorkerResult<bool>;

    /// Stops background work when the runner shuts down.
    async fn stop(&self) -> WorkerResult<()> {
        Ok(())
    }

    /// Interrupts the task currently handled by `start`.
    async fn abort(&self) -> WorkerResult<()>;

    /// Forgets the task currently being handled.
    fn reset(&self) {}
}

pub(crate) fn unsupported_action(task_type: &str, action: i64) -> CoreError {
    CoreError::new(
        CoreErrorKind::UnsupportedAction,
        format!("Unsupported {task_type} action: {action}"),
    )
}
