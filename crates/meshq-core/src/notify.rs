//! Fire-and-forget notifications about queue progress.
//!
//! The runner and the execution envelope call [`NotificationSink::broadcast`] for every
//! task status change and project terminal event. Sinks must return immediately and
//! never fail the caller.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{ProjectId, TaskId, TaskStatus};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    TaskStatus {
        project_id: ProjectId,
        task_id: TaskId,
        label: String,
        status: TaskStatus,
        /// Failure reason, present for failed tasks.
        reason: Option<String>,
    },
    Finished {
        project_id: ProjectId,
        project_key: String,
    },
    Aborted {
        project_id: ProjectId,
        project_key: String,
    },
    QueueFinished,
    BuildFailed {
        project_id: Option<ProjectId>,
        task_id: Option<TaskId>,
        message: String,
    },
    EngineMessage {
        message: String,
    },
    AddProjects {
        project_ids: Vec<ProjectId>,
    },
    AddTasks {
        project_id: ProjectId,
        task_ids: Vec<TaskId>,
    },
}

impl QueueEvent {
    /// Event name as shown to subscribers.
    pub fn name(&self) -> String {
        match self {
            QueueEvent::TaskStatus { label, status, .. } => {
                format!("Task {label} is {}", status.as_str())
            }
            QueueEvent::Finished { .. } => "Finished".to_string(),
            QueueEvent::Aborted { .. } => "Aborted".to_string(),
            QueueEvent::QueueFinished => "QueueFinished".to_string(),
            QueueEvent::BuildFailed { .. } => "BuildFailed".to_string(),
            QueueEvent::EngineMessage { message } => format!("PhotoMesh - {message}"),
            QueueEvent::AddProjects { .. } => "AddProjects".to_string(),
            QueueEvent::AddTasks { .. } => "AddTasks".to_string(),
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn broadcast(&self, event: QueueEvent);
}

/// In-process fan-out over a `tokio::sync::broadcast` channel.
///
/// Slow subscribers lag and lose the oldest events; publishing never waits.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<QueueEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NotificationSink for BroadcastNotifier {
    fn broadcast(&self, event: QueueEvent) {
        // zero receivers is not an error for us
        let _ = self.sender.send(event);
    }
}

/// Writes every event to the tracing log.
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn broadcast(&self, event: QueueEvent) {
        tracing::info!(event = %event.name(), payload = ?event, "queue notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_event_name_uses_label_and_status() {
        let event = QueueEvent::TaskStatus {
            project_id: ProjectId(1),
            task_id: TaskId(2),
            label: "Build tiles".to_string(),
            status: TaskStatus::Failed,
            reason: Some("Engine offline".to_string()),
        };

        assert_eq!(event.name(), "Task Build tiles is failed");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let notifier = BroadcastNotifier::default();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.broadcast(QueueEvent::QueueFinished);

        assert_eq!(first.recv().await.unwrap(), QueueEvent::QueueFinished);
        assert_eq!(second.recv().await.unwrap(), QueueEvent::QueueFinished);
    }

    #[test]
    fn broadcast_without_subscribers_does_not_fail() {
        let notifier = BroadcastNotifier::new(4);
        notifier.broadcast(QueueEvent::EngineMessage {
            message: "Build started".to_string(),
        });
    }
}
