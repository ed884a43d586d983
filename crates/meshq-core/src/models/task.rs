use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::SystemTime;

use crate::models::{CoreError, ProjectId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted
        )
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "aborted" => Ok(TaskStatus::Aborted),
            _ => Err(CoreError::invalid_input(format!(
                "unknown task status '{raw}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub guid: String,
    pub task_type: String,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub action: i64,
    pub task_params: serde_json::Value,
    pub next_task_guid: Option<String>,
    pub is_active: bool,
    pub status: TaskStatus,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
}

impl TaskRecord {
    /// Human label used in log lines and notifications.
    pub fn label(&self) -> &str {
        self.comment
            .as_deref()
            .filter(|comment| !comment.trim().is_empty())
            .or(self.name.as_deref())
            .unwrap_or(&self.guid)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub guid: Option<String>,
    pub task_type: String,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub action: i64,
    pub task_params: serde_json::Value,
    pub next_task_guid: Option<String>,
    pub is_active: bool,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, action: i64) -> Self {
        Self {
            guid: None,
            task_type: task_type.into(),
            name: None,
            comment: None,
            action,
            task_params: serde_json::Value::Object(serde_json::Map::new()),
            next_task_guid: None,
            is_active: true,
        }
    }

    pub fn guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn params(mut self, task_params: serde_json::Value) -> Self {
        self.task_params = task_params;
        self
    }

    pub fn next(mut self, next_task_guid: impl Into<String>) -> Self {
        self.next_task_guid = Some(next_task_guid.into());
        self
    }
}
