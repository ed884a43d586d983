use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::SystemTime;

use crate::models::{CoreError, TaskId, TaskStatus};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLogLevel {
    Info,
    Warning,
    Error,
}

impl TaskLogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskLogLevel::Info => "info",
            TaskLogLevel::Warning => "warning",
            TaskLogLevel::Error => "error",
        }
    }
}

impl FromStr for TaskLogLevel {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "info" => Ok(TaskLogLevel::Info),
            "warning" => Ok(TaskLogLevel::Warning),
            "error" => Ok(TaskLogLevel::Error),
            _ => Err(CoreError::invalid_input(format!(
                "unknown task log level '{raw}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskLogRecord {
    pub id: u64,
    pub task_id: TaskId,
    pub status: Option<TaskStatus>,
    pub level: TaskLogLevel,
    pub message: String,
    pub created_at: SystemTime,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NewTaskLogRecord {
    pub task_id: TaskId,
    pub status: Option<TaskStatus>,
    pub level: TaskLogLevel,
    pub message: String,
    pub created_at: SystemTime,
}

impl NewTaskLogRecord {
    pub fn new(
        task_id: TaskId,
        status: Option<TaskStatus>,
        level: TaskLogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            status,
            level,
            message: message.into(),
            created_at: SystemTime::now(),
        }
    }
}
