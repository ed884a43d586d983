use serde::{Deserialize, Serialize};

use crate::models::{ProjectId, TaskId};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    #[default]
    Pending,
    Running,
    Paused,
    Stopped,
    Aborting,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Pending => "PENDING",
            QueueState::Running => "RUNNING",
            QueueState::Paused => "PAUSED",
            QueueState::Stopped => "STOPPED",
            QueueState::Aborting => "ABORTING",
        }
    }

    /// States in which the polling loop must not pick up a new project.
    pub fn blocks_dispatch(self) -> bool {
        matches!(
            self,
            QueueState::Running | QueueState::Paused | QueueState::Aborting
        )
    }
}

/// Volatile view of what the runner is doing right now.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub current_project_id: Option<ProjectId>,
    pub current_task_id: Option<TaskId>,
    pub project_key: Option<String>,
    pub progress: u8,
    pub state: QueueState,
}
